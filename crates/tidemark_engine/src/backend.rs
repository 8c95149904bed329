//! Backend client abstraction.
//!
//! The engine talks to the remote relational backend through the
//! [`BackendClient`] trait: authenticated upsert, soft-delete, and a
//! cursor-scoped incremental query. Implementations decide the wire
//! protocol; the engine only relies on the error taxonomy below.

use crate::record::{EntityRecord, RemoteChange, Timestamp};
use async_trait::async_trait;
use thiserror::Error;

/// Errors a backend call can produce.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The row already exists (another device synced it first).
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The row does not exist (already deleted remotely).
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transient network failure (timeout, connection refused).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Failure(String),
}

impl BackendError {
    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Failure(_))
    }
}

/// Classification of one push attempt.
///
/// Consumed uniformly by the push loop: `Success` removes the outbox
/// item, `RetryableFailure` bumps its retry counter and moves on, and
/// `PermanentFailure` aborts the whole cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The mutation is durably reflected on the backend.
    Success,
    /// The attempt failed but the item stays queued for a later cycle.
    RetryableFailure(BackendError),
    /// The cycle cannot continue (credentials rejected).
    PermanentFailure(BackendError),
}

/// Classifies the result of a backend upsert or soft-delete.
///
/// Duplicate-key and not-found responses count as success: either way
/// the backend already reflects the mutation, so redelivery is
/// idempotent.
pub fn classify_push(result: Result<(), BackendError>) -> PushOutcome {
    match result {
        Ok(()) => PushOutcome::Success,
        Err(BackendError::DuplicateKey(_)) | Err(BackendError::NotFound(_)) => PushOutcome::Success,
        Err(error @ BackendError::Unauthorized(_)) => PushOutcome::PermanentFailure(error),
        Err(error) => PushOutcome::RetryableFailure(error),
    }
}

/// A client for the remote backend.
///
/// All calls are scoped to the authenticated user; row-level
/// authorization is the backend's concern.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Creates or replaces a whole record.
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        record: &EntityRecord,
    ) -> Result<(), BackendError>;

    /// Soft-deletes a record: sets `deleted = true` and restamps
    /// `updated_at` to `deleted_at`.
    async fn soft_delete(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
        deleted_at: Timestamp,
    ) -> Result<(), BackendError>;

    /// Returns all of the user's records, across tables, with
    /// `updated_at` strictly after `cursor` (everything when `None`).
    /// No ordering is guaranteed.
    async fn changes_since(
        &self,
        user_id: &str,
        cursor: Option<Timestamp>,
    ) -> Result<Vec<RemoteChange>, BackendError>;
}

// Lets several engines (devices) share one backend in tests.
#[async_trait]
impl<T: BackendClient + ?Sized> BackendClient for std::sync::Arc<T> {
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        record: &EntityRecord,
    ) -> Result<(), BackendError> {
        (**self).upsert(user_id, table, record).await
    }

    async fn soft_delete(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
        deleted_at: Timestamp,
    ) -> Result<(), BackendError> {
        (**self)
            .soft_delete(user_id, table, entity_id, deleted_at)
            .await
    }

    async fn changes_since(
        &self,
        user_id: &str,
        cursor: Option<Timestamp>,
    ) -> Result<Vec<RemoteChange>, BackendError> {
        (**self).changes_since(user_id, cursor).await
    }
}

/// A scripted backend for unit tests.
///
/// Calls succeed by default; queue responses with [`MockBackend::script_push`]
/// and [`MockBackend::script_pull`] to exercise failure paths. Every
/// push call is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockBackend {
    push_script: parking_lot::Mutex<std::collections::VecDeque<Result<(), BackendError>>>,
    pull_script:
        parking_lot::Mutex<std::collections::VecDeque<Result<Vec<RemoteChange>, BackendError>>>,
    upserts: parking_lot::Mutex<Vec<(String, EntityRecord)>>,
    deletes: parking_lot::Mutex<Vec<(String, String)>>,
}

impl MockBackend {
    /// Creates a backend where every call succeeds and pulls are empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next unscripted push (upsert or delete).
    pub fn script_push(&self, result: Result<(), BackendError>) {
        self.push_script.lock().push_back(result);
    }

    /// Queues the result of the next pull.
    pub fn script_pull(&self, result: Result<Vec<RemoteChange>, BackendError>) {
        self.pull_script.lock().push_back(result);
    }

    /// Upserts recorded so far, as `(table, record)` pairs.
    pub fn upserts(&self) -> Vec<(String, EntityRecord)> {
        self.upserts.lock().clone()
    }

    /// Soft-deletes recorded so far, as `(table, entity_id)` pairs.
    pub fn deletes(&self) -> Vec<(String, String)> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn upsert(
        &self,
        _user_id: &str,
        table: &str,
        record: &EntityRecord,
    ) -> Result<(), BackendError> {
        self.upserts
            .lock()
            .push((table.to_string(), record.clone()));
        self.push_script.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn soft_delete(
        &self,
        _user_id: &str,
        table: &str,
        entity_id: &str,
        _deleted_at: Timestamp,
    ) -> Result<(), BackendError> {
        self.deletes
            .lock()
            .push((table.to_string(), entity_id.to_string()));
        self.push_script.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn changes_since(
        &self,
        _user_id: &str,
        _cursor: Option<Timestamp>,
    ) -> Result<Vec<RemoteChange>, BackendError> {
        self.pull_script.lock().pop_front().unwrap_or(Ok(Vec::new()))
    }
}
