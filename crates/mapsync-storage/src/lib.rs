//! mapsync storage backends
//!
//! Implementations of the `mapsync_core` gateway traits:
//! - Memory (default): fast, volatile, for development and tests
//! - SQLite: embedded persistence
//!
//! Both give the same contract: one transaction per mutation, writes
//! invisible until commit, transactions serialized per gateway.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
