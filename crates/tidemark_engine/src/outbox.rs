//! Transactional outbox queue.
//!
//! Every committed local mutation writes exactly one outbox row in the
//! same store transaction as the entity write it describes, so the two
//! can never diverge. Items are drained FIFO by the push phase, retried
//! with exponential backoff, and abandoned once they hit the retry
//! ceiling.

use crate::error::EngineResult;
use crate::record::{EntityRecord, Operation, OutboxItem, Timestamp};
use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidemark_store::{EntityStore, Transaction};
use tracing::warn;

/// System table holding pending outbox rows.
pub const OUTBOX_TABLE: &str = "_outbox";

/// Backoff before retry `n` becomes eligible: `2^n` seconds.
pub fn backoff(retries: u32) -> ChronoDuration {
    ChronoDuration::seconds(1i64 << retries.min(62))
}

/// What happened to an item on a failed push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry counter bumped; the item waits out its backoff.
    Requeued {
        /// Failed attempts so far.
        retries: u32,
    },
    /// The retry ceiling was hit; the item was dropped.
    Abandoned,
}

/// The pending-mutation queue, persisted in the entity store.
pub struct OutboxQueue {
    store: Arc<EntityStore>,
    next_id: AtomicU64,
    max_retries: u32,
}

impl OutboxQueue {
    /// Opens the queue over a store, resuming ids after any persisted
    /// rows.
    pub fn new(store: Arc<EntityStore>, max_retries: u32) -> Self {
        let highest = store
            .scan(OUTBOX_TABLE)
            .last()
            .and_then(|(key, _)| key.parse::<u64>().ok())
            .unwrap_or(0);

        Self {
            store,
            next_id: AtomicU64::new(highest + 1),
            max_retries,
        }
    }

    /// Stages a new item through the caller's open transaction.
    ///
    /// The item commits or aborts together with the entity write the
    /// caller staged in the same transaction; an aborted transaction
    /// leaves no orphan item.
    pub fn enqueue(
        &self,
        txn: &mut Transaction,
        table: &str,
        operation: Operation,
        payload: &EntityRecord,
        now: Timestamp,
    ) -> EngineResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let item = OutboxItem {
            id,
            table: table.to_string(),
            operation,
            entity_id: payload.id.clone(),
            payload: payload.clone(),
            timestamp: now,
            retries: 0,
        };

        txn.put(OUTBOX_TABLE, item.key(), serde_json::to_vec(&item)?);
        Ok(id)
    }

    /// Loads every persisted item in FIFO order.
    fn load_all(&self) -> EngineResult<Vec<OutboxItem>> {
        self.store
            .scan(OUTBOX_TABLE)
            .iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }

    /// Items eligible for a push attempt at `now`, FIFO by enqueue order.
    ///
    /// Fresh items (`retries == 0`) are eligible immediately; retried
    /// items wait out `backoff(retries)` since their last attempt.
    pub fn pending_items(&self, now: Timestamp) -> EngineResult<Vec<OutboxItem>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|item| {
                item.retries < self.max_retries
                    && (item.retries == 0 || now - item.timestamp >= backoff(item.retries))
            })
            .collect())
    }

    /// Entity ids with at least one outstanding item, eligible or not.
    ///
    /// This is the primary local-wins signal for the conflict resolver.
    pub fn pending_entity_ids(&self) -> EngineResult<HashSet<String>> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|item| item.entity_id)
            .collect())
    }

    /// Number of outstanding items.
    pub fn pending_count(&self) -> usize {
        self.store.len(OUTBOX_TABLE)
    }

    /// Removes a successfully pushed item.
    pub fn mark_succeeded(&self, id: u64) -> EngineResult<()> {
        self.store.transaction(|txn| -> EngineResult<()> {
            txn.delete(OUTBOX_TABLE, OutboxItem::key_for(id));
            Ok(())
        })
    }

    /// Records a failed push attempt: bumps the retry counter and resets
    /// the backoff clock, or abandons the item at the ceiling.
    pub fn mark_failed(
        &self,
        item: &OutboxItem,
        now: Timestamp,
    ) -> EngineResult<FailureDisposition> {
        let retries = item.retries + 1;

        if retries >= self.max_retries {
            warn!(
                table = %item.table,
                entity_id = %item.entity_id,
                retries,
                "abandoning outbox item after retry ceiling; local-only state remains"
            );
            self.store.transaction(|txn| -> EngineResult<()> {
                txn.delete(OUTBOX_TABLE, item.key());
                Ok(())
            })?;
            return Ok(FailureDisposition::Abandoned);
        }

        let mut updated = item.clone();
        updated.retries = retries;
        updated.timestamp = now;
        self.store.transaction(|txn| -> EngineResult<()> {
            txn.put(OUTBOX_TABLE, updated.key(), serde_json::to_vec(&updated)?);
            Ok(())
        })?;

        Ok(FailureDisposition::Requeued { retries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn queue() -> (Arc<EntityStore>, OutboxQueue) {
        let store = Arc::new(EntityStore::new());
        let queue = OutboxQueue::new(Arc::clone(&store), 5);
        (store, queue)
    }

    fn enqueue_one(store: &EntityStore, queue: &OutboxQueue, id: &str, now: Timestamp) -> u64 {
        let record = EntityRecord::new(id, now);
        store
            .transaction(|txn| {
                txn.put("goals", id, record.to_bytes()?);
                queue.enqueue(txn, "goals", Operation::Create, &record, now)
            })
            .unwrap()
    }

    #[test]
    fn enqueue_commits_with_entity_write() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));

        assert_eq!(queue.pending_count(), 1);
        assert!(store.contains("goals", "g-1"));
    }

    #[test]
    fn aborted_transaction_leaves_no_orphan() {
        let (store, queue) = queue();
        let record = EntityRecord::new("g-1", ts(0));

        let result: EngineResult<u64> = store.transaction(|txn| {
            txn.put("goals", "g-1", record.to_bytes()?);
            queue.enqueue(txn, "goals", Operation::Create, &record, ts(0))?;
            Err(EngineError::backend_fatal("injected abort"))
        });

        assert!(result.is_err());
        assert_eq!(queue.pending_count(), 0);
        assert!(!store.contains("goals", "g-1"));
    }

    #[test]
    fn fresh_items_are_immediately_eligible() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(100));

        let pending = queue.pending_items(ts(100)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "g-1");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));
        enqueue_one(&store, &queue, "g-2", ts(1));
        enqueue_one(&store, &queue, "g-3", ts(2));

        let ids: Vec<String> = queue
            .pending_items(ts(10))
            .unwrap()
            .into_iter()
            .map(|i| i.entity_id)
            .collect();
        assert_eq!(ids, vec!["g-1", "g-2", "g-3"]);
    }

    #[test]
    fn backoff_gates_retried_items() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));

        let item = queue.pending_items(ts(0)).unwrap().remove(0);
        let disposition = queue.mark_failed(&item, ts(10)).unwrap();
        assert_eq!(disposition, FailureDisposition::Requeued { retries: 1 });

        // backoff(1) = 2s: hidden at +1s, visible from +2s
        assert!(queue.pending_items(ts(11)).unwrap().is_empty());
        assert_eq!(queue.pending_items(ts(12)).unwrap().len(), 1);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(backoff(0).num_seconds(), 1);
        assert_eq!(backoff(1).num_seconds(), 2);
        assert_eq!(backoff(2).num_seconds(), 4);
        assert_eq!(backoff(3).num_seconds(), 8);
        assert_eq!(backoff(4).num_seconds(), 16);
    }

    #[test]
    fn item_is_abandoned_at_retry_ceiling() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));

        let mut now = ts(0);
        for attempt in 1..=4 {
            let item = queue.pending_items(now).unwrap().remove(0);
            assert_eq!(
                queue.mark_failed(&item, now).unwrap(),
                FailureDisposition::Requeued { retries: attempt }
            );
            now = now + backoff(attempt);
        }

        let item = queue.pending_items(now).unwrap().remove(0);
        assert_eq!(
            queue.mark_failed(&item, now).unwrap(),
            FailureDisposition::Abandoned
        );
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn mark_succeeded_removes_item() {
        let (store, queue) = queue();
        let id = enqueue_one(&store, &queue, "g-1", ts(0));

        queue.mark_succeeded(id).unwrap();
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn pending_entity_ids_ignores_backoff() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));

        let item = queue.pending_items(ts(0)).unwrap().remove(0);
        queue.mark_failed(&item, ts(0)).unwrap();

        // Not eligible for push yet, but still protects the entity.
        assert!(queue.pending_items(ts(0)).unwrap().is_empty());
        assert!(queue.pending_entity_ids().unwrap().contains("g-1"));
    }

    #[test]
    fn ids_resume_after_reopen() {
        let (store, queue) = queue();
        enqueue_one(&store, &queue, "g-1", ts(0));
        enqueue_one(&store, &queue, "g-2", ts(0));

        let reopened = OutboxQueue::new(Arc::clone(&store), 5);
        let id = enqueue_one(&store, &reopened, "g-3", ts(0));
        assert!(id > 2);

        let ids: Vec<String> = reopened
            .pending_items(ts(0))
            .unwrap()
            .into_iter()
            .map(|i| i.entity_id)
            .collect();
        assert_eq!(ids, vec!["g-1", "g-2", "g-3"]);
    }
}
