//! Sync resolver - "what changed since version N"
//!
//! Lets a reconnecting or polling client catch up from the change log
//! without replaying the room's transient broadcast stream.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::locks::LockManager;
use crate::model::{ChangeAction, SyncDelta};

pub struct SyncResolver {
    gateway: Arc<dyn Gateway>,
    locks: Arc<LockManager>,
}

impl SyncResolver {
    pub fn new(gateway: Arc<dyn Gateway>, locks: Arc<LockManager>) -> Self {
        Self { gateway, locks }
    }

    /// Compute the delta between `since` and the map's current version.
    ///
    /// Later log entries override earlier ones per node: a node created
    /// then deleted inside the window ends up only in `deleted`, never in
    /// `changed`. `changed` carries full current rows; the live lock
    /// snapshot rides along so the client can initialize lock state too.
    pub fn sync_since(&self, map_id: &str, since: u64) -> Result<SyncDelta> {
        let mut tx = self.gateway.begin()?;
        let meta = tx
            .map_meta(map_id)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))?;

        let locks = self.locks.locks_for_map(map_id);

        if since >= meta.version {
            return Ok(SyncDelta {
                version: meta.version,
                changed: Vec::new(),
                deleted: Vec::new(),
                locks,
            });
        }

        let mut changed_ids: HashSet<String> = HashSet::new();
        let mut deleted_ids: HashSet<String> = HashSet::new();
        for entry in tx.changes_since(map_id, since)? {
            match entry.action {
                ChangeAction::Delete => {
                    deleted_ids.insert(entry.node_id.clone());
                    changed_ids.remove(&entry.node_id);
                }
                ChangeAction::Create | ChangeAction::Update => {
                    changed_ids.insert(entry.node_id.clone());
                    deleted_ids.remove(&entry.node_id);
                }
            }
        }

        let ids: Vec<String> = changed_ids.into_iter().collect();
        let changed = tx.nodes_by_ids(&ids)?;

        Ok(SyncDelta {
            version: meta.version,
            changed,
            deleted: deleted_ids.into_iter().collect(),
            locks,
        })
    }
}
