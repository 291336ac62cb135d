//! Error types for mapsync core

use crate::gateway::StorageError;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Map not found: {0}")]
    MapNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent node not found in map: {0}")]
    ParentNotFound(String),

    #[error("History entry not found: {0}")]
    HistoryNotFound(i64),

    #[error("History entry {id} does not belong to map {map_id}")]
    HistoryMapMismatch { id: i64, map_id: String },

    #[error("History entry {id} does not belong to node {node_id}")]
    HistoryNodeMismatch { id: i64, node_id: String },

    #[error("No snapshot recorded for history entry {0}")]
    SnapshotMissing(i64),

    #[error("Node is being edited by {username}")]
    LockHeld { username: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
