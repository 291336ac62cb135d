//! mapsync core - versioned node store and synchronization engine
//!
//! This crate provides the collaborative mutation engine for mapsync:
//! - Versioned tree store: every mutation is one storage transaction and
//!   bumps the owning map's monotonic version by exactly 1
//! - Append-only change ledger used to compute catch-up sync deltas
//! - Reversible history with subtree snapshots and typed rollback
//! - Advisory TTL-based per-node edit locks
//!
//! Storage backends implement the [`gateway`] traits and live in the
//! `mapsync-storage` crate; the transport layer lives in
//! `mapsync-transport`.

pub mod changes;
pub mod error;
pub mod gateway;
pub mod history;
pub mod locks;
pub mod model;
pub mod store;
pub mod sync;

pub use changes::NodeChanges;
pub use error::{Error, Result};
pub use gateway::{Gateway, StorageError, StoreTx};
pub use history::RollbackOutcome;
pub use locks::{LockManager, LOCK_TTL};
pub use model::{
    now_ms, Actor, ChangeAction, ChangeLogEntry, DeleteOutcome, HistoryEntry, LockInfo, MapMeta,
    Node, SyncDelta,
};
pub use store::NodeStore;
pub use sync::SyncResolver;
