//! Entity store and transactions.

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;

/// Prefix marking system tables that do not emit change events.
const SYSTEM_PREFIX: char = '_';

/// One staged write inside a transaction.
#[derive(Debug, Clone)]
enum StagedWrite {
    Put {
        table: String,
        id: String,
        payload: Vec<u8>,
    },
    Delete {
        table: String,
        id: String,
    },
}

/// A write transaction.
///
/// Writes are staged in order and become visible only when the enclosing
/// [`EntityStore::transaction`] closure returns `Ok`. Staging the same
/// key twice keeps the later write.
#[derive(Debug, Default)]
pub struct Transaction {
    writes: Vec<StagedWrite>,
}

impl Transaction {
    fn new() -> Self {
        Self { writes: Vec::new() }
    }

    /// Stages a put of `payload` under `(table, id)`.
    pub fn put(&mut self, table: impl Into<String>, id: impl Into<String>, payload: Vec<u8>) {
        self.writes.push(StagedWrite::Put {
            table: table.into(),
            id: id.into(),
            payload,
        });
    }

    /// Stages a delete of `(table, id)`. Deleting a missing row is a no-op.
    pub fn delete(&mut self, table: impl Into<String>, id: impl Into<String>) {
        self.writes.push(StagedWrite::Delete {
            table: table.into(),
            id: id.into(),
        });
    }

    /// Returns the number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns true if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// The embedded entity store.
///
/// Holds one ordered table per entity type plus system tables, and emits
/// change events for committed domain writes.
///
/// # Example
///
/// ```
/// use tidemark_store::{EntityStore, StoreResult};
///
/// let store = EntityStore::new();
/// store
///     .transaction(|txn| -> StoreResult<()> {
///         txn.put("goals", "g-1", vec![1, 2, 3]);
///         Ok(())
///     })
///     .unwrap();
///
/// assert_eq!(store.get("goals", "g-1"), Some(vec![1, 2, 3]));
/// ```
pub struct EntityStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    feed: ChangeFeed,
    sequence: AtomicU64,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Runs a closure inside a write transaction.
    ///
    /// All writes staged by the closure commit atomically when it returns
    /// `Ok`; on `Err` every staged write is discarded and the error is
    /// returned to the caller. The error type is the caller's own, so
    /// layers above the store can abort a transaction with their errors.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
    {
        let mut txn = Transaction::new();
        let out = f(&mut txn)?;
        let events = self.commit(txn);
        self.feed.emit_batch(events);
        Ok(out)
    }

    /// Applies staged writes under the write lock and collects events.
    fn commit(&self, txn: Transaction) -> Vec<ChangeEvent> {
        let mut tables = self.tables.write();
        let mut events = Vec::new();

        for write in txn.writes {
            match write {
                StagedWrite::Put { table, id, payload } => {
                    let existed = tables
                        .entry(table.clone())
                        .or_default()
                        .insert(id.clone(), payload.clone())
                        .is_some();

                    if !table.starts_with(SYSTEM_PREFIX) {
                        events.push(ChangeEvent {
                            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                            table,
                            entity_id: id,
                            kind: if existed {
                                ChangeKind::Update
                            } else {
                                ChangeKind::Insert
                            },
                            payload: Some(payload),
                        });
                    }
                }
                StagedWrite::Delete { table, id } => {
                    let existed = tables
                        .get_mut(&table)
                        .map(|t| t.remove(&id).is_some())
                        .unwrap_or(false);

                    if existed && !table.starts_with(SYSTEM_PREFIX) {
                        events.push(ChangeEvent {
                            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                            table,
                            entity_id: id,
                            kind: ChangeKind::Delete,
                            payload: None,
                        });
                    }
                }
            }
        }

        events
    }

    /// Gets a payload by table and id.
    pub fn get(&self, table: &str, id: &str) -> Option<Vec<u8>> {
        self.tables.read().get(table)?.get(id).cloned()
    }

    /// Returns true if `(table, id)` exists.
    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|t| t.contains_key(id))
    }

    /// Returns all rows of a table in key order.
    pub fn scan(&self, table: &str) -> Vec<(String, Vec<u8>)> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Returns the number of rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Returns true if the table is missing or empty.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Removes every row of a table.
    pub fn clear(&self, table: &str) {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.clear();
        }
    }

    /// Returns the names of all tables that currently exist.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribes to committed domain-table changes.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Polls committed events with sequence > cursor, up to limit.
    pub fn poll_changes(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.feed.poll(cursor, limit)
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
