//! Conflict resolution.
//!
//! Whole-record last-write-wins with two zero-round-trip guards that
//! close the common races between a pull and an in-flight local write:
//! the outbox protection (authoritative) and the recently-modified set
//! (a short-lived in-memory shadow of writes whose outbox rows may not
//! be visible yet).
//!
//! Known limitation, preserved deliberately: the timestamp comparison
//! assumes loosely synchronized clocks across devices and backend. Under
//! significant clock drift last-write-wins can pick the wrong winner.

use crate::record::EntityRecord;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default time-to-live of recently-modified entries.
pub const RECENT_WRITE_TTL: Duration = Duration::from_secs(5);

/// In-memory map of entity id → local-write time with a fixed TTL.
///
/// Never persisted; losing it on restart only widens the conflict
/// window, because the outbox protection remains authoritative.
#[derive(Debug)]
pub struct RecentWrites {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl RecentWrites {
    /// Creates a map with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Records a local write at `now`, expiring stale entries as a side
    /// effect.
    pub fn insert(&mut self, entity_id: impl Into<String>, now: Instant) {
        self.purge_expired(now);
        self.entries.insert(entity_id.into(), now);
    }

    /// Returns true if the entity was written within the TTL.
    pub fn contains(&self, entity_id: &str, now: Instant) -> bool {
        self.entries
            .get(entity_id)
            .is_some_and(|written| now.duration_since(*written) < self.ttl)
    }

    /// Drops entries older than the TTL.
    pub fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, written| now.duration_since(*written) < ttl);
    }

    /// Number of live entries (expired ones may still be counted until
    /// the next purge).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RecentWrites {
    fn default() -> Self {
        Self::new(RECENT_WRITE_TTL)
    }
}

/// Outcome of resolving one remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accepted: no local copy exists.
    AcceptNew,
    /// Accepted: the remote copy is strictly newer.
    AcceptNewer,
    /// Rejected: an unsynced local change is queued; local wins.
    RejectPending,
    /// Rejected: a local write landed within the TTL window.
    RejectRecentWrite,
    /// Rejected: the remote copy is not newer (ties keep local).
    RejectStale,
}

impl Decision {
    /// Returns true if the remote candidate should be applied.
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::AcceptNew | Decision::AcceptNewer)
    }
}

/// Decides whether a remote candidate replaces the local copy.
///
/// Rules, in order:
/// 1. A pending outbox item for the id rejects unconditionally.
/// 2. A local write within the recently-modified TTL rejects.
/// 3. No local copy accepts.
/// 4. Otherwise accept iff `remote.updated_at > local.updated_at`.
pub fn resolve(
    remote: &EntityRecord,
    local: Option<&EntityRecord>,
    pending_ids: &std::collections::HashSet<String>,
    recent: &RecentWrites,
    now: Instant,
) -> Decision {
    if pending_ids.contains(&remote.id) {
        return Decision::RejectPending;
    }

    if recent.contains(&remote.id, now) {
        return Decision::RejectRecentWrite;
    }

    match local {
        None => Decision::AcceptNew,
        Some(local) if remote.updated_at > local.updated_at => Decision::AcceptNewer,
        Some(_) => Decision::RejectStale,
    }
}
