//! The sync orchestrator.
//!
//! One [`SyncEngine`] instance owns all mutable sync state: the cycle
//! flag, the authenticated user, and the recently-modified guard. It is
//! constructed with an injected store and backend client, so tests can
//! run many isolated engines side by side.
//!
//! A cycle is push then pull: draining the outbox first guarantees a
//! device's own just-made changes are not overwritten by a stale pull of
//! its prior state. At most one cycle runs at a time; triggers arriving
//! while one is in flight are dropped, not queued, because the next
//! trigger re-discovers the same pending work.

use crate::backend::{classify_push, BackendClient, PushOutcome};
use crate::config::EngineConfig;
use crate::cursor::CursorStore;
use crate::error::{EngineError, EngineResult};
use crate::outbox::{FailureDisposition, OutboxQueue};
use crate::record::{EntityRecord, Operation, RemoteChange, Timestamp};
use crate::resolver::{self, RecentWrites};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;
use tidemark_store::EntityStore;
use tracing::{debug, warn};

/// Status reported to consumers when a cycle finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// The cycle completed; the engine is idle.
    Idle,
    /// The cycle failed.
    Error,
}

/// Completion notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleNotice {
    /// Final status of the cycle.
    pub status: CycleStatus,
    /// When the cycle finished.
    pub at: Timestamp,
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Outbox items durably pushed.
    pub pushed: u64,
    /// Remote rows fetched.
    pub pulled: u64,
    /// Remote rows accepted and applied locally.
    pub applied: u64,
    /// Remote rows rejected by conflict resolution.
    pub rejected: u64,
    /// `(table, entity_id)` pairs dropped at the retry ceiling, for
    /// caller-facing warnings about permanently-unsynced data.
    pub abandoned: Vec<(String, String)>,
}

/// Result of a sync invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A cycle ran to completion.
    Completed(CycleSummary),
    /// Another cycle was in flight; nothing happened.
    Skipped,
}

/// Cumulative statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles run to successful completion.
    pub cycles_completed: u64,
    /// Total outbox items pushed.
    pub items_pushed: u64,
    /// Total remote rows pulled.
    pub records_pulled: u64,
    /// Total remote rows applied locally.
    pub records_applied: u64,
    /// Total remote rows rejected by conflict resolution.
    pub conflicts_rejected: u64,
    /// Total outbox items abandoned at the retry ceiling.
    pub items_abandoned: u64,
    /// Most recent cycle error, if any.
    pub last_error: Option<String>,
}

/// Clears the in-flight flag on every exit path.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Counters accumulated by one pull attempt.
#[derive(Debug, Default)]
struct PullCounts {
    pulled: u64,
    applied: u64,
    rejected: u64,
}

/// The synchronization engine.
pub struct SyncEngine<B: BackendClient> {
    store: Arc<EntityStore>,
    backend: Arc<B>,
    outbox: OutboxQueue,
    cursors: CursorStore,
    config: EngineConfig,
    recent: Mutex<RecentWrites>,
    user: RwLock<Option<String>>,
    in_flight: AtomicBool,
    auth_required: AtomicBool,
    subscribers: RwLock<Vec<Sender<CycleNotice>>>,
    stats: RwLock<SyncStats>,
}

impl<B: BackendClient> SyncEngine<B> {
    /// Creates an engine over a store and backend client.
    pub fn new(store: Arc<EntityStore>, backend: B, config: EngineConfig) -> Self {
        let outbox = OutboxQueue::new(Arc::clone(&store), config.max_retries);
        let cursors = CursorStore::new(Arc::clone(&store));
        let recent = Mutex::new(RecentWrites::new(config.recent_write_ttl));

        Self {
            store,
            backend: Arc::new(backend),
            outbox,
            cursors,
            config,
            recent,
            user: RwLock::new(None),
            in_flight: AtomicBool::new(false),
            auth_required: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// The underlying entity store.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// The backend client this engine pushes to and pulls from.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Sets the authenticated user cycles are scoped to.
    pub fn set_user(&self, user_id: impl Into<String>) {
        *self.user.write() = Some(user_id.into());
    }

    /// Clears the authenticated user; cycles error until one is set.
    pub fn clear_user(&self) {
        *self.user.write() = None;
    }

    /// The current authenticated user.
    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    /// Returns true if a cycle hit an authorization failure and pushes
    /// are halted until [`SyncEngine::credentials_refreshed`].
    pub fn auth_required(&self) -> bool {
        self.auth_required.load(Ordering::SeqCst)
    }

    /// Signals that credentials were refreshed; sync may resume.
    pub fn credentials_refreshed(&self) {
        self.auth_required.store(false, Ordering::SeqCst);
    }

    /// Number of outstanding outbox items, for UI badges.
    pub fn pending_count(&self) -> usize {
        self.outbox.pending_count()
    }

    /// The user's persisted pull cursor.
    pub fn last_cursor(&self, user_id: &str) -> EngineResult<Option<Timestamp>> {
        self.cursors.get(user_id)
    }

    /// Subscribes to cycle-completion notices. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> Receiver<CycleNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    fn notify(&self, status: CycleStatus) {
        let notice = CycleNotice {
            status,
            at: Utc::now(),
        };
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Applies a local mutation: writes the entity row and its outbox
    /// item in one atomic transaction, then records the write in the
    /// recently-modified guard.
    ///
    /// Deletes are written as tombstones; sync never physically removes
    /// a record.
    pub fn apply_local_write(
        &self,
        table: &str,
        operation: Operation,
        mut record: EntityRecord,
    ) -> EngineResult<()> {
        if operation.is_delete() {
            record.deleted = true;
        }
        let now = Utc::now();

        self.store.transaction(|txn| -> EngineResult<()> {
            txn.put(table, record.id.as_str(), record.to_bytes()?);
            self.outbox.enqueue(txn, table, operation, &record, now)?;
            Ok(())
        })?;

        self.recent.lock().insert(record.id.clone(), Instant::now());
        Ok(())
    }

    /// Runs one sync cycle: push then pull.
    ///
    /// Returns [`CycleOutcome::Skipped`] immediately when another cycle
    /// is in flight. A completion notice is emitted for every cycle that
    /// actually ran, success or failure.
    pub async fn sync(&self) -> EngineResult<CycleOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync cycle already in flight; dropping trigger");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = FlagGuard(&self.in_flight);

        let result = self.run_cycle().await;
        match &result {
            Ok(summary) => {
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.items_pushed += summary.pushed;
                stats.records_pulled += summary.pulled;
                stats.records_applied += summary.applied;
                stats.conflicts_rejected += summary.rejected;
                stats.items_abandoned += summary.abandoned.len() as u64;
                stats.last_error = None;
                drop(stats);
                self.notify(CycleStatus::Idle);
            }
            Err(error) => {
                if matches!(error, EngineError::AuthRequired(_)) {
                    self.auth_required.store(true, Ordering::SeqCst);
                }
                self.stats.write().last_error = Some(error.to_string());
                self.notify(CycleStatus::Error);
            }
        }

        result.map(CycleOutcome::Completed)
    }

    async fn run_cycle(&self) -> EngineResult<CycleSummary> {
        let user = self.user.read().clone().ok_or(EngineError::NoUser)?;

        if self.auth_required.load(Ordering::SeqCst) {
            return Err(EngineError::AuthRequired(
                "credentials were rejected; refresh before syncing".into(),
            ));
        }

        let mut summary = CycleSummary::default();
        self.push_phase(&user, &mut summary).await?;
        self.pull_phase(&user, &mut summary).await?;

        debug!(
            pushed = summary.pushed,
            pulled = summary.pulled,
            applied = summary.applied,
            rejected = summary.rejected,
            "sync cycle complete"
        );
        Ok(summary)
    }

    /// Drains eligible outbox items FIFO. A single item's failure never
    /// blocks the rest of the queue; only an authorization failure
    /// aborts the phase.
    async fn push_phase(&self, user: &str, summary: &mut CycleSummary) -> EngineResult<()> {
        let items = self.outbox.pending_items(Utc::now())?;

        for item in items {
            let result = match item.operation {
                Operation::Create | Operation::Update => {
                    self.backend.upsert(user, &item.table, &item.payload).await
                }
                Operation::Delete => {
                    self.backend
                        .soft_delete(user, &item.table, &item.entity_id, Utc::now())
                        .await
                }
            };

            match classify_push(result) {
                PushOutcome::Success => {
                    self.outbox.mark_succeeded(item.id)?;
                    summary.pushed += 1;
                }
                PushOutcome::PermanentFailure(error) => {
                    return Err(error.into());
                }
                PushOutcome::RetryableFailure(error) => {
                    warn!(
                        table = %item.table,
                        entity_id = %item.entity_id,
                        retries = item.retries,
                        "push attempt failed: {error}"
                    );
                    if self.outbox.mark_failed(&item, Utc::now())?
                        == FailureDisposition::Abandoned
                    {
                        summary
                            .abandoned
                            .push((item.table.clone(), item.entity_id.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs the pull with bounded linear-backoff retries on transient
    /// failure.
    async fn pull_phase(&self, user: &str, summary: &mut CycleSummary) -> EngineResult<()> {
        let retry = self.config.pull_retry.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.pull_once(user).await {
                Ok(counts) => {
                    summary.pulled += counts.pulled;
                    summary.applied += counts.applied;
                    summary.rejected += counts.rejected;
                    return Ok(());
                }
                Err(error) if error.is_retryable() && attempt < retry.max_attempts => {
                    warn!(attempt, "pull attempt failed, backing off: {error}");
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                Err(error) if error.is_retryable() => {
                    return Err(EngineError::PullExhausted {
                        attempts: attempt,
                        message: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One pull attempt: fetch since cursor, resolve each candidate,
    /// apply accepted rows and the cursor advance in a single atomic
    /// transaction.
    async fn pull_once(&self, user: &str) -> EngineResult<PullCounts> {
        let cursor = self.cursors.get(user)?;
        let changes = self.backend.changes_since(user, cursor).await?;

        if changes.is_empty() {
            return Ok(PullCounts::default());
        }

        let pending = self.outbox.pending_entity_ids()?;
        let now = Instant::now();
        let mut accepted: Vec<&RemoteChange> = Vec::new();
        let mut rejected = 0u64;
        let mut max_seen = changes[0].record.updated_at;

        {
            let mut recent = self.recent.lock();
            recent.purge_expired(now);

            for change in &changes {
                if change.record.updated_at > max_seen {
                    max_seen = change.record.updated_at;
                }

                let local = self.load_local(&change.table, &change.record.id);
                let decision =
                    resolver::resolve(&change.record, local.as_ref(), &pending, &recent, now);

                if decision.is_accept() {
                    accepted.push(change);
                } else {
                    debug!(
                        table = %change.table,
                        entity_id = %change.record.id,
                        ?decision,
                        "rejected remote candidate"
                    );
                    rejected += 1;
                }
            }
        }

        let applied = accepted.len() as u64;
        self.store.transaction(|txn| -> EngineResult<()> {
            for change in &accepted {
                // Remote deletes land as tombstones, same as local ones.
                txn.put(
                    change.table.as_str(),
                    change.record.id.as_str(),
                    change.record.to_bytes()?,
                );
            }
            self.cursors.stage_advance(txn, user, max_seen)?;
            Ok(())
        })?;

        Ok(PullCounts {
            pulled: changes.len() as u64,
            applied,
            rejected,
        })
    }

    fn load_local(&self, table: &str, id: &str) -> Option<EntityRecord> {
        let bytes = self.store.get(table, id)?;
        match EntityRecord::from_bytes(&bytes) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(table, id, "corrupt local record, treating as absent: {error}");
                None
            }
        }
    }
}
