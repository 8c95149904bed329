//! Integration tests for the sync engine against the memory backend.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tidemark_backend::MemoryBackend;
use tidemark_engine::{
    BackendClient, BackendError, CycleOutcome, EngineConfig, EngineError, EntityRecord, Operation,
    PullRetry, RemoteChange, SyncEngine, Timestamp,
};
use tidemark_store::EntityStore;
use tokio::sync::Notify;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn record(id: &str, secs: i64, title: &str) -> EntityRecord {
    EntityRecord::new(id, ts(secs)).with_field("title", serde_json::json!(title))
}

/// A device: one engine over its own local store, sharing a backend.
fn device(backend: Arc<MemoryBackend>, user: &str) -> SyncEngine<Arc<MemoryBackend>> {
    let engine = SyncEngine::new(
        Arc::new(EntityStore::new()),
        backend,
        EngineConfig::default().with_pull_retry(PullRetry::no_retry()),
    );
    engine.set_user(user);
    engine
}

fn completed(outcome: CycleOutcome) -> tidemark_engine::CycleSummary {
    match outcome {
        CycleOutcome::Completed(summary) => summary,
        CycleOutcome::Skipped => panic!("cycle was unexpectedly skipped"),
    }
}

fn local(engine: &SyncEngine<Arc<MemoryBackend>>, table: &str, id: &str) -> Option<EntityRecord> {
    engine
        .store()
        .get(table, id)
        .map(|bytes| EntityRecord::from_bytes(&bytes).unwrap())
}

#[tokio::test]
async fn offline_writes_queue_then_drain() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    // Work offline: everything lands locally and queues.
    for i in 0..3 {
        engine
            .apply_local_write(
                "goals",
                Operation::Create,
                record(&format!("g-{i}"), 100 + i, "offline"),
            )
            .unwrap();
    }
    assert_eq!(engine.pending_count(), 3);
    assert!(backend.is_empty("u-1", "goals"));

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pushed, 3);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(backend.len("u-1", "goals"), 3);
}

#[tokio::test]
async fn record_travels_between_devices() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let device_a = device(Arc::clone(&backend), "u-1");
    let device_b = device(Arc::clone(&backend), "u-1");

    device_a
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "from a"))
        .unwrap();
    device_a.sync().await.unwrap();

    let summary = completed(device_b.sync().await.unwrap());
    assert_eq!(summary.applied, 1);

    let copy = local(&device_b, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("from a"));
}

#[tokio::test]
async fn pending_local_change_survives_newer_remote() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    // A remote copy, newer than anything local will be.
    backend.seed("u-1", "goals", record("g-1", 1_000, "remote"));

    // A queued local edit that cannot be pushed yet.
    backend.fail_next(BackendError::Transient("timeout".into()));
    engine
        .apply_local_write("goals", Operation::Update, record("g-1", 500, "local"))
        .unwrap();

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.rejected, 1);

    // Local edit still intact and still queued.
    let copy = local(&engine, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("local"));
    assert_eq!(engine.pending_count(), 1);
}

#[tokio::test]
async fn newer_remote_replaces_settled_local() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig::default()
        .with_pull_retry(PullRetry::no_retry())
        .with_recent_write_ttl(Duration::ZERO);
    let engine = SyncEngine::new(Arc::new(EntityStore::new()), Arc::clone(&backend), config);
    engine.set_user("u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "v1"))
        .unwrap();
    engine.sync().await.unwrap();

    // Another device edits the same record later.
    backend.remote_write("u-1", "goals", record("g-1", 200, "v2"));

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.applied, 1);
    let copy = local(&engine, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("v2"));
}

#[tokio::test]
async fn recent_write_guard_holds_until_ttl() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "mine"))
        .unwrap();
    // Drain the outbox so only the recently-modified guard remains.
    engine.sync().await.unwrap();
    assert_eq!(engine.pending_count(), 0);

    backend.remote_write("u-1", "goals", record("g-1", 9_000, "theirs"));

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.rejected, 1);
    let copy = local(&engine, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("mine"));
}

#[tokio::test]
async fn delete_propagates_as_tombstone() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let device_a = device(Arc::clone(&backend), "u-1");
    let device_b = device(Arc::clone(&backend), "u-1");

    device_a
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "doomed"))
        .unwrap();
    device_a.sync().await.unwrap();
    device_b.sync().await.unwrap();
    assert!(!local(&device_b, "goals", "g-1").unwrap().deleted);

    device_a
        .apply_local_write("goals", Operation::Delete, record("g-1", 200, "doomed"))
        .unwrap();
    device_a.sync().await.unwrap();

    device_b.sync().await.unwrap();
    let copy = local(&device_b, "goals", "g-1").unwrap();
    assert!(copy.deleted);
    // The backend row survives as a tombstone too.
    assert_eq!(backend.len("u-1", "goals"), 1);
    assert!(backend.get("u-1", "goals", "g-1").unwrap().deleted);
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "once"))
        .unwrap();
    engine.sync().await.unwrap();

    // Nothing new on either side: cycles settle into no-ops.
    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pushed, 0);
    assert_eq!(summary.applied, 0);
    assert_eq!(backend.len("u-1", "goals"), 1);
}

#[tokio::test]
async fn cursor_advances_and_skips_already_pulled_rows() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    backend.seed("u-1", "goals", record("g-1", 100, "first"));
    engine.sync().await.unwrap();
    assert_eq!(engine.last_cursor("u-1").unwrap(), Some(ts(100)));

    backend.seed("u-1", "goals", record("g-2", 300, "second"));
    let summary = completed(engine.sync().await.unwrap());
    // Only the new row crosses the cursor.
    assert_eq!(summary.pulled, 1);
    assert_eq!(engine.last_cursor("u-1").unwrap(), Some(ts(300)));

    // A row stamped before the cursor never arrives at all.
    backend.seed("u-1", "goals", record("g-0", 50, "late"));
    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pulled, 0);
    assert!(local(&engine, "goals", "g-0").is_none());
}

#[tokio::test]
async fn users_do_not_see_each_others_rows() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let alice = device(Arc::clone(&backend), "alice");
    let bob = device(Arc::clone(&backend), "bob");

    alice
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "private"))
        .unwrap();
    alice.sync().await.unwrap();

    let summary = completed(bob.sync().await.unwrap());
    assert_eq!(summary.pulled, 0);
    assert!(local(&bob, "goals", "g-1").is_none());
}

#[tokio::test]
async fn single_failure_then_recovery() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "flaky"))
        .unwrap();
    backend.fail_next(BackendError::Transient("connection reset".into()));

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pushed, 0);
    assert_eq!(engine.pending_count(), 1);
    assert!(backend.is_empty("u-1", "goals"));
    // Requeued under backoff: the very next cycle does not retry it.
    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pushed, 0);
}

#[tokio::test]
async fn retry_ceiling_abandons_item() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig::default()
        .with_pull_retry(PullRetry::no_retry())
        .with_max_retries(1);
    let engine = SyncEngine::new(Arc::new(EntityStore::new()), Arc::clone(&backend), config);
    engine.set_user("u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "stuck"))
        .unwrap();
    backend.fail_next(BackendError::Transient("timeout".into()));

    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(
        summary.abandoned,
        vec![("goals".to_string(), "g-1".to_string())]
    );
    assert_eq!(engine.pending_count(), 0);
    // The local copy is retained even though it will never sync.
    assert!(local(&engine, "goals", "g-1").is_some());
}

#[tokio::test]
async fn auth_failure_halts_then_refresh_recovers() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = device(Arc::clone(&backend), "u-1");

    engine
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "kept"))
        .unwrap();
    backend.fail_next(BackendError::Unauthorized("token expired".into()));

    let result = engine.sync().await;
    assert!(matches!(result, Err(EngineError::AuthRequired(_))));
    assert!(engine.auth_required());
    assert_eq!(engine.pending_count(), 1);

    engine.credentials_refreshed();
    let summary = completed(engine.sync().await.unwrap());
    assert_eq!(summary.pushed, 1);
    assert_eq!(backend.len("u-1", "goals"), 1);
}

#[tokio::test]
async fn two_device_end_to_end_flow() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    // Zero recent-write TTL so the flow exercises timestamp resolution
    // rather than the race guard.
    let config = EngineConfig::default()
        .with_pull_retry(PullRetry::no_retry())
        .with_recent_write_ttl(Duration::ZERO);
    let device_a = SyncEngine::new(
        Arc::new(EntityStore::new()),
        Arc::clone(&backend),
        config.clone(),
    );
    let device_b = SyncEngine::new(Arc::new(EntityStore::new()), Arc::clone(&backend), config);
    device_a.set_user("u-1");
    device_b.set_user("u-1");

    // Device A creates offline at T1, then comes online.
    device_a
        .apply_local_write("goals", Operation::Create, record("g-1", 100, "v1"))
        .unwrap();
    assert_eq!(device_a.pending_count(), 1);
    device_a.sync().await.unwrap();
    assert_eq!(device_a.pending_count(), 0);
    assert_eq!(
        backend.get("u-1", "goals", "g-1").unwrap().fields["title"],
        serde_json::json!("v1")
    );

    // Device B pulls it, edits at T2, and pushes.
    device_b.sync().await.unwrap();
    device_b
        .apply_local_write("goals", Operation::Update, record("g-1", 200, "v2"))
        .unwrap();
    device_b.sync().await.unwrap();

    // Device A, with nothing pending, is overwritten to T2.
    device_a.sync().await.unwrap();
    let copy = local(&device_a, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("v2"));

    // A stale T2.5 copy lands remotely, then device A edits at T3 but its
    // push fails mid-flight. The queued T3 edit must win the pull.
    backend.seed("u-1", "goals", record("g-1", 250, "v2.5"));
    device_a
        .apply_local_write("goals", Operation::Update, record("g-1", 300, "v3"))
        .unwrap();
    backend.fail_next(BackendError::Transient("timeout".into()));

    let summary = completed(device_a.sync().await.unwrap());
    assert_eq!(summary.rejected, 1);
    let copy = local(&device_a, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("v3"));
    assert_eq!(device_a.pending_count(), 1);
}

#[tokio::test]
async fn remote_hint_drives_a_pull() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(device(Arc::clone(&backend), "u-1"));
    let scheduler = tidemark_engine::TriggerScheduler::new(Arc::clone(&engine));
    let mut hints = backend.subscribe_hints();

    backend.remote_write("u-1", "goals", record("g-1", 100, "hinted"));
    let hint = hints.recv().await.unwrap();
    assert_eq!(hint.entity_id, "g-1");

    // The hint only schedules a cycle; the data flows through the full
    // pull and resolution path.
    scheduler.fire(tidemark_engine::SyncTrigger::RemoteHint);
    for _ in 0..50 {
        if engine.stats().cycles_completed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(engine.stats().cycles_completed, 1);
    let copy = local(&engine, "goals", "g-1").unwrap();
    assert_eq!(copy.fields["title"], serde_json::json!("hinted"));
}

/// A backend whose pull blocks until released, for overlap tests.
struct GatedBackend {
    inner: MemoryBackend,
    entered: Notify,
    release: Notify,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl BackendClient for GatedBackend {
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        record: &EntityRecord,
    ) -> Result<(), BackendError> {
        self.inner.upsert(user_id, table, record).await
    }

    async fn soft_delete(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
        deleted_at: Timestamp,
    ) -> Result<(), BackendError> {
        self.inner
            .soft_delete(user_id, table, entity_id, deleted_at)
            .await
    }

    async fn changes_since(
        &self,
        user_id: &str,
        cursor: Option<Timestamp>,
    ) -> Result<Vec<RemoteChange>, BackendError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.changes_since(user_id, cursor).await
    }
}

#[tokio::test]
async fn overlapping_trigger_is_dropped_not_queued() {
    init_tracing();
    let engine = Arc::new(SyncEngine::new(
        Arc::new(EntityStore::new()),
        GatedBackend::new(),
        EngineConfig::default().with_pull_retry(PullRetry::no_retry()),
    ));
    engine.set_user("u-1");

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.sync().await })
    };

    // Wait until the first cycle is parked inside its pull.
    engine.backend().entered.notified().await;

    let second = engine.sync().await.unwrap();
    assert_eq!(second, CycleOutcome::Skipped);

    engine.backend().release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, CycleOutcome::Completed(_)));
    assert_eq!(engine.stats().cycles_completed, 1);
}
