//! # Tidemark Store
//!
//! Embedded transactional entity store for Tidemark.
//!
//! This crate provides:
//! - Named tables of entity id → payload bytes
//! - Atomic multi-table transactions with a closure API
//! - A post-commit change feed for reactive consumers
//!
//! ## Architecture
//!
//! The store is a single-process, in-memory structure guarded by a
//! `parking_lot` lock. Writes are staged inside a [`Transaction`] and
//! applied atomically on commit; if the transaction closure returns an
//! error, no staged write becomes visible.
//!
//! Tables whose names start with `_` are system tables (outbox rows, sync
//! cursors). They participate in transactions like any other table but do
//! not emit change events, so UI subscribers only ever see domain entities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod error;
mod store;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
pub use error::{StoreError, StoreResult};
pub use store::{EntityStore, Transaction};
