//! Entity records and sync operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type used throughout the engine (RFC 3339 on the wire).
pub type Timestamp = DateTime<Utc>;

/// A synchronized entity.
///
/// The engine treats entities as opaque records: beyond the identifier,
/// the last-modified timestamp, and the tombstone flag, all fields pass
/// through untouched in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Client-generated identifier, stable for the entity's lifetime.
    pub id: String,
    /// Last-modified timestamp, advanced by whichever side performed
    /// the write.
    pub updated_at: Timestamp,
    /// Soft-delete tombstone. Synced records are never physically
    /// removed, only marked.
    #[serde(default)]
    pub deleted: bool,
    /// Remaining entity fields, passed through opaquely.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl EntityRecord {
    /// Creates a record with the given id and timestamp and no extra
    /// fields.
    pub fn new(id: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            updated_at,
            deleted: false,
            fields: serde_json::Map::new(),
        }
    }

    /// Generates a fresh client-side entity identifier.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Sets an opaque field, builder style.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Returns a tombstoned copy of this record, stamped at `deleted_at`.
    pub fn tombstone(&self, deleted_at: Timestamp) -> Self {
        let mut copy = self.clone();
        copy.deleted = true;
        copy.updated_at = deleted_at;
        copy
    }

    /// Serializes the record for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes a record from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The kind of mutation an outbox item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created locally.
    Create,
    /// Entity was updated locally.
    Update,
    /// Entity was soft-deleted locally.
    Delete,
}

impl Operation {
    /// Returns true for delete operations.
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// One pending local mutation awaiting push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Local queue ordering id (auto-incrementing).
    pub id: u64,
    /// Entity type name.
    pub table: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Identifier of the mutated entity.
    pub entity_id: String,
    /// Full entity snapshot at enqueue time.
    pub payload: EntityRecord,
    /// Enqueue time, rewritten on each failed push attempt.
    pub timestamp: Timestamp,
    /// Failed push attempts so far.
    pub retries: u32,
}

impl OutboxItem {
    /// Storage key: zero-padded so the store's ordered scan yields FIFO
    /// order.
    pub fn key(&self) -> String {
        Self::key_for(self.id)
    }

    /// Storage key for a given queue id.
    pub fn key_for(id: u64) -> String {
        format!("{id:020}")
    }
}

/// One remote row delivered by a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Table the row belongs to.
    pub table: String,
    /// The remote candidate record.
    pub record: EntityRecord,
}
