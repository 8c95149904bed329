//! Change feed for observing committed writes.
//!
//! The change feed emits events for committed domain-table writes,
//! enabling:
//! - Reactive UI updates
//! - Sync status displays
//! - Tests that assert on applied changes
//!
//! Events are emitted only after a transaction commits, in commit order.
//! System tables (names starting with `_`) never emit events.

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Type of committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entity was inserted (no previous version existed).
    Insert,
    /// Entity was updated (previous version existed).
    Update,
    /// Entity was deleted.
    Delete,
}

/// A single change event from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Sequence number of the commit.
    pub sequence: u64,
    /// Table name.
    pub table: String,
    /// Entity identifier.
    pub entity_id: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// New payload for Insert/Update. None for Delete.
    pub payload: Option<Vec<u8>>,
}

/// A change feed that distributes committed writes to subscribers.
///
/// Multiple subscribers are supported; a subscriber unsubscribes by
/// dropping its receiver. A bounded history is kept for consumers that
/// prefer polling over a live channel.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<Vec<ChangeEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a change feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a receiver that will receive all future change events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change event to all subscribers.
    ///
    /// Called by the store after commit. Disconnected subscribers are
    /// pruned on the way through.
    pub fn emit(&self, event: ChangeEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let overflow = history.len() - self.max_history;
                history.drain(0..overflow);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emits multiple events from a single commit.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Polls events with sequence > cursor, up to limit.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number in history.
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
