//! History queries and rollback
//!
//! Every mutation leaves one immutable audit row (a cascading delete
//! leaves a single row keyed on the deleted root, carrying the whole
//! subtree snapshot). Rollback applies the inverse of the recorded action
//! through the regular store operations, so the reversal is itself
//! versioned, logged and auditable.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Actor, ChangeAction, DeleteOutcome, HistoryEntry, Node};
use crate::store::NodeStore;

/// What a successful rollback did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The recorded create was reversed by deleting the node (cascading
    /// to its current children, per store semantics).
    CreateReversed { result: DeleteOutcome },
    /// The recorded update was reversed by re-applying the captured old
    /// field values.
    UpdateReversed { node: Node },
    /// The recorded delete was reversed by re-creating every snapshot
    /// member with its original id.
    DeleteReversed { restored: Vec<Node> },
}

impl NodeStore {
    /// Audit rows for one node, newest first.
    pub fn node_history(&self, node_id: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        let gateway = self.gateway();
        let mut tx = gateway.begin()?;
        Ok(tx.node_history(node_id, limit)?)
    }

    /// Audit rows for one map, newest first.
    pub fn map_history(&self, map_id: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        let gateway = self.gateway();
        let mut tx = gateway.begin()?;
        Ok(tx.map_history(map_id, limit)?)
    }

    /// Reverse a single past mutation.
    ///
    /// The entry must belong to `map_id`, and to `expected_node_id` when
    /// one is given. Failures are typed so the caller can tell "entry not
    /// found" from "wrong scope" from "snapshot missing" from "the inverse
    /// operation itself failed"; there is never a partial silent success.
    pub fn rollback(
        &self,
        history_id: i64,
        map_id: &str,
        actor: &Actor,
        expected_node_id: Option<&str>,
    ) -> Result<RollbackOutcome> {
        let entry = {
            let gateway = self.gateway();
            let mut tx = gateway.begin()?;
            tx.history_entry(history_id)?
                .ok_or(Error::HistoryNotFound(history_id))?
        };

        if entry.map_id != map_id {
            return Err(Error::HistoryMapMismatch {
                id: history_id,
                map_id: map_id.to_string(),
            });
        }
        if let Some(node_id) = expected_node_id {
            if entry.node_id != node_id {
                return Err(Error::HistoryNodeMismatch {
                    id: history_id,
                    node_id: node_id.to_string(),
                });
            }
        }

        match entry.action {
            ChangeAction::Create => {
                let result = self.delete_node(map_id, &entry.node_id, actor)?;
                Ok(RollbackOutcome::CreateReversed { result })
            }
            ChangeAction::Update => {
                let changes = entry.reversal_changes();
                if changes.is_empty() {
                    return Err(Error::Validation(
                        "history entry has no reversible fields".to_string(),
                    ));
                }
                let node = self.update_node(map_id, &entry.node_id, &changes, actor)?;
                Ok(RollbackOutcome::UpdateReversed { node })
            }
            ChangeAction::Delete => {
                let snapshot = entry
                    .snapshot
                    .as_deref()
                    .ok_or(Error::SnapshotMissing(history_id))?;
                let nodes: Vec<Node> = serde_json::from_str(snapshot)
                    .map_err(|e| Error::Validation(format!("corrupt snapshot: {e}")))?;

                // Snapshot order is root first, so parents are recreated
                // before their children.
                let mut restored = Vec::with_capacity(nodes.len());
                for n in &nodes {
                    restored.push(self.create_node(
                        &n.map_id,
                        n.parent_id.as_deref(),
                        &n.content,
                        n.position,
                        &n.style,
                        Some(&n.id),
                        actor,
                    )?);
                }
                Ok(RollbackOutcome::DeleteReversed { restored })
            }
        }
    }
}

impl HistoryEntry {
    /// The field patch that undoes a recorded update: only the fields
    /// whose old value was captured.
    fn reversal_changes(&self) -> crate::changes::NodeChanges {
        crate::changes::NodeChanges {
            content: self.old_content.clone(),
            parent_id: self.old_parent_id.clone(),
            position: self.old_position,
            ..Default::default()
        }
    }
}
