//! # Tidemark Memory Backend
//!
//! An in-memory implementation of the engine's `BackendClient` trait,
//! used as the reference backend in integration tests and demos.
//!
//! This crate provides:
//! - Per-user, per-table record storage with soft-delete semantics
//! - Cursor-scoped incremental change queries
//! - Scriptable failure injection for exercising retry paths
//! - Change hints over a Tokio channel, standing in for a realtime
//!   subscription

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod memory;

pub use config::BackendConfig;
pub use memory::{ChangeHint, MemoryBackend};
