//! Storage gateway - the narrow transactional interface the core calls
//!
//! Backends live in the `mapsync-storage` crate. The core never talks to a
//! database directly: every mutation opens one transaction, performs its
//! row operations through [`StoreTx`], and commits. Dropping a transaction
//! without committing rolls it back, so read-only callers can simply let
//! it fall out of scope.

use crate::model::{ChangeAction, ChangeLogEntry, HistoryEntry, MapMeta, Node};

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// A transactional row store for maps, nodes, change log and history.
pub trait Gateway: Send + Sync {
    /// Open one transaction. For a given gateway, transactions are
    /// serialized: two mutations against the same map cannot interleave.
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>, StorageError>;
}

/// Row operations available inside a single transaction.
///
/// All writes are invisible to other transactions until [`StoreTx::commit`]
/// returns.
pub trait StoreTx {
    // maps
    fn insert_map(&mut self, map: &MapMeta) -> Result<(), StorageError>;
    fn map_meta(&mut self, map_id: &str) -> Result<Option<MapMeta>, StorageError>;
    /// Most recently updated first.
    fn list_maps(&mut self) -> Result<Vec<MapMeta>, StorageError>;
    /// Returns false if the map did not exist.
    fn remove_map(&mut self, map_id: &str) -> Result<bool, StorageError>;
    /// Increment the map's version and `updated_at`, returning the new
    /// version; `None` if the map does not exist.
    fn bump_version(&mut self, map_id: &str, now: i64) -> Result<Option<u64>, StorageError>;

    // nodes
    fn insert_node(&mut self, node: &Node) -> Result<(), StorageError>;
    /// Overwrite every column of an existing node row.
    fn update_node(&mut self, node: &Node) -> Result<(), StorageError>;
    fn remove_node(&mut self, node_id: &str) -> Result<(), StorageError>;
    fn remove_nodes_in_map(&mut self, map_id: &str) -> Result<(), StorageError>;
    fn node(&mut self, node_id: &str) -> Result<Option<Node>, StorageError>;
    fn child_ids(&mut self, parent_id: &str) -> Result<Vec<String>, StorageError>;
    /// Ordered by position (ties unspecified but stable per read).
    fn nodes_in_map(&mut self, map_id: &str) -> Result<Vec<Node>, StorageError>;
    fn nodes_by_ids(&mut self, ids: &[String]) -> Result<Vec<Node>, StorageError>;

    // change log
    fn append_change(
        &mut self,
        map_id: &str,
        version: u64,
        action: ChangeAction,
        node_id: &str,
    ) -> Result<(), StorageError>;
    /// Entries with version strictly greater than `since`, version order.
    fn changes_since(&mut self, map_id: &str, since: u64)
        -> Result<Vec<ChangeLogEntry>, StorageError>;
    fn clear_changes(&mut self, map_id: &str) -> Result<(), StorageError>;

    // history
    /// Appends the row (ignoring `entry.id`) and returns the assigned id.
    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64, StorageError>;
    fn history_entry(&mut self, history_id: i64) -> Result<Option<HistoryEntry>, StorageError>;
    /// Newest first.
    fn node_history(&mut self, node_id: &str, limit: u32)
        -> Result<Vec<HistoryEntry>, StorageError>;
    /// Newest first.
    fn map_history(&mut self, map_id: &str, limit: u32)
        -> Result<Vec<HistoryEntry>, StorageError>;

    /// Commit the transaction. Not calling this discards every write.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
