//! # Tidemark Sync Engine
//!
//! Local-first synchronization for Tidemark clients.
//!
//! This crate provides:
//! - Transactional outbox queue with exponential-backoff retry
//! - Push-then-pull sync cycles behind a single-flight guard
//! - Whole-record last-write-wins conflict resolution with local-wins
//!   protection for unsynced and just-made changes
//! - Durable per-user pull cursors
//! - Debounced trigger scheduling on a Tokio runtime
//!
//! ## Architecture
//!
//! Every local mutation writes its entity row and an outbox item in one
//! atomic store transaction, so the app works fully offline and the
//! queue can never diverge from the data it describes. A sync cycle
//! first drains the outbox to the backend, then pulls remote rows newer
//! than the persisted cursor and resolves each against local state.
//!
//! ## Key Invariants
//!
//! - Push always happens before pull within a cycle
//! - At most one cycle runs at a time; extra triggers are dropped
//! - An entity with a pending outbox item never loses to a remote copy
//! - The pull cursor only moves forward
//! - Deletes are tombstones; sync never physically removes a record

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod cursor;
mod engine;
mod error;
mod outbox;
mod record;
mod resolver;
mod scheduler;

pub use backend::{classify_push, BackendClient, BackendError, MockBackend, PushOutcome};
pub use config::{EngineConfig, PullRetry};
pub use cursor::{CursorStore, CURSOR_TABLE};
pub use engine::{
    CycleNotice, CycleOutcome, CycleStatus, CycleSummary, SyncEngine, SyncStats,
};
pub use error::{EngineError, EngineResult};
pub use outbox::{backoff, FailureDisposition, OutboxQueue, OUTBOX_TABLE};
pub use record::{EntityRecord, Operation, OutboxItem, RemoteChange, Timestamp};
pub use resolver::{resolve, Decision, RecentWrites, RECENT_WRITE_TTL};
pub use scheduler::{SyncTrigger, TriggerScheduler};
