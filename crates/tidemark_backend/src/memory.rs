//! The in-memory backend.

use crate::config::BackendConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tidemark_engine::{BackendClient, BackendError, EntityRecord, RemoteChange, Timestamp};
use tokio::sync::mpsc;
use tracing::debug;

/// Advisory notification that a row changed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeHint {
    /// Owner of the changed row.
    pub user_id: String,
    /// Table the row belongs to.
    pub table: String,
    /// Identifier of the changed row.
    pub entity_id: String,
}

type UserTables = HashMap<String, BTreeMap<String, EntityRecord>>;

/// An in-memory [`BackendClient`] with per-user row scoping.
///
/// Rows are held per user and per table. [`MemoryBackend::fail_next`]
/// queues errors returned by upcoming calls, letting tests drive the
/// engine through its retry and abandonment paths against otherwise
/// real backend semantics.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    config: BackendConfig,
    rows: RwLock<HashMap<String, UserTables>>,
    failures: Mutex<VecDeque<BackendError>>,
    hints: RwLock<Vec<mpsc::Sender<ChangeHint>>>,
}

impl MemoryBackend {
    /// Creates an empty backend with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BackendConfig::default())
    }

    /// Creates an empty backend with the given configuration.
    pub fn with_config(config: BackendConfig) -> Self {
        Self {
            config,
            rows: RwLock::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            hints: RwLock::new(Vec::new()),
        }
    }

    /// Queues an error to be returned by the next backend call.
    ///
    /// Queued errors are consumed FIFO, one per call, before the call's
    /// normal semantics apply.
    pub fn fail_next(&self, error: BackendError) {
        self.failures.lock().push_back(error);
    }

    /// Inserts a row directly, bypassing failure injection and hints.
    /// Used to set up pre-existing remote state.
    pub fn seed(&self, user_id: &str, table: &str, record: EntityRecord) {
        self.rows
            .write()
            .entry(user_id.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Writes a row as another device would, emitting a change hint.
    pub fn remote_write(&self, user_id: &str, table: &str, record: EntityRecord) {
        let entity_id = record.id.clone();
        self.seed(user_id, table, record);
        self.emit_hint(user_id, table, &entity_id);
    }

    /// Reads a row back, for assertions.
    pub fn get(&self, user_id: &str, table: &str, entity_id: &str) -> Option<EntityRecord> {
        self.rows
            .read()
            .get(user_id)?
            .get(table)?
            .get(entity_id)
            .cloned()
    }

    /// Number of rows a user has in a table, tombstones included.
    pub fn len(&self, user_id: &str, table: &str) -> usize {
        self.rows
            .read()
            .get(user_id)
            .and_then(|tables| tables.get(table))
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if the user has no rows in the table.
    pub fn is_empty(&self, user_id: &str, table: &str) -> bool {
        self.len(user_id, table) == 0
    }

    /// Subscribes to change hints. Dropping the receiver unsubscribes.
    pub fn subscribe_hints(&self) -> mpsc::Receiver<ChangeHint> {
        let (tx, rx) = mpsc::channel(self.config.hint_buffer.max(1));
        self.hints.write().push(tx);
        rx
    }

    fn emit_hint(&self, user_id: &str, table: &str, entity_id: &str) {
        let hint = ChangeHint {
            user_id: user_id.to_string(),
            table: table.to_string(),
            entity_id: entity_id.to_string(),
        };

        let mut hints = self.hints.write();
        hints.retain(|tx| match tx.try_send(hint.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(table, entity_id, "hint channel full, dropping hint");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn take_failure(&self) -> Result<(), BackendError> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        record: &EntityRecord,
    ) -> Result<(), BackendError> {
        self.take_failure()?;
        self.seed(user_id, table, record.clone());
        self.emit_hint(user_id, table, &record.id);
        Ok(())
    }

    async fn soft_delete(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
        deleted_at: Timestamp,
    ) -> Result<(), BackendError> {
        self.take_failure()?;

        let mut rows = self.rows.write();
        let row = rows
            .get_mut(user_id)
            .and_then(|tables| tables.get_mut(table))
            .and_then(|table| table.get_mut(entity_id));

        let Some(record) = row else {
            return Err(BackendError::NotFound(format!("{table}/{entity_id}")));
        };

        record.deleted = true;
        record.updated_at = deleted_at;
        drop(rows);

        self.emit_hint(user_id, table, entity_id);
        Ok(())
    }

    async fn changes_since(
        &self,
        user_id: &str,
        cursor: Option<Timestamp>,
    ) -> Result<Vec<RemoteChange>, BackendError> {
        self.take_failure()?;

        let rows = self.rows.read();
        let Some(tables) = rows.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        for (table, records) in tables {
            for record in records.values() {
                let newer = cursor.is_none_or(|cursor| record.updated_at > cursor);
                if newer {
                    changes.push(RemoteChange {
                        table: table.clone(),
                        record: record.clone(),
                    });
                }
            }
        }

        Ok(changes)
    }
}
