//! Persisted pull cursors.
//!
//! One high-water mark per authenticated user: the maximum `updated_at`
//! of all remote records ever pulled. Keyed by user id so switching
//! accounts on the same device never corrupts another user's cursor.

use crate::error::EngineResult;
use crate::record::Timestamp;
use chrono::DateTime;
use std::sync::Arc;
use tidemark_store::{EntityStore, StoreError, Transaction};

/// System table holding one RFC 3339 timestamp per user id.
pub const CURSOR_TABLE: &str = "_sync_cursors";

/// Durable per-user pull cursors.
pub struct CursorStore {
    store: Arc<EntityStore>,
}

impl CursorStore {
    /// Opens the cursor store over an entity store.
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store }
    }

    /// Returns the user's cursor, or `None` before the first successful
    /// pull.
    pub fn get(&self, user_id: &str) -> EngineResult<Option<Timestamp>> {
        let Some(bytes) = self.store.get(CURSOR_TABLE, user_id) else {
            return Ok(None);
        };

        let text = String::from_utf8(bytes)
            .map_err(|e| StoreError::corrupt_row(CURSOR_TABLE, e.to_string()))?;
        let parsed = DateTime::parse_from_rfc3339(&text)
            .map_err(|e| StoreError::corrupt_row(CURSOR_TABLE, e.to_string()))?;

        Ok(Some(parsed.with_timezone(&chrono::Utc)))
    }

    /// Stages a monotonic advance through the caller's open transaction.
    ///
    /// The persisted value becomes `max(current, candidate)`; a stale
    /// candidate never regresses the cursor. Returns the effective value.
    pub fn stage_advance(
        &self,
        txn: &mut Transaction,
        user_id: &str,
        candidate: Timestamp,
    ) -> EngineResult<Timestamp> {
        let effective = match self.get(user_id)? {
            Some(current) if current > candidate => current,
            _ => candidate,
        };

        txn.put(CURSOR_TABLE, user_id, effective.to_rfc3339().into_bytes());
        Ok(effective)
    }
}
