//! Node store - all map/node mutations, version-stamped and transactional
//!
//! Every mutating operation runs as one storage transaction: the version
//! bump, the row mutation(s), the change-log append(s) and the history
//! append commit together or not at all. Concurrent mutations against the
//! same map are serialized by the gateway; the loser simply takes the next
//! version number (fields are last-writer-wins, there is no retry loop).

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::changes::NodeChanges;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, StoreTx};
use crate::model::{now_ms, Actor, ChangeAction, DeleteOutcome, HistoryEntry, MapMeta, Node};

/// The versioned tree store for all maps.
pub struct NodeStore {
    gateway: Arc<dyn Gateway>,
}

impl NodeStore {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        self.gateway.clone()
    }

    /// Create a map with its root node (version 0, parent-less, named
    /// after the map).
    pub fn create_map(&self, name: &str) -> Result<(MapMeta, Node)> {
        let now = now_ms();
        let map = MapMeta {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            version: 0,
            owner_id: None,
            team_id: None,
            created_at: now,
            updated_at: now,
        };
        let root = Node {
            id: Uuid::new_v4().to_string(),
            map_id: map.id.clone(),
            parent_id: None,
            content: name.to_string(),
            position: 0,
            style: "{}".to_string(),
            collapsed: false,
            version: 0,
            last_edited_by: None,
            last_edited_by_name: String::new(),
            last_edited_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.gateway.begin()?;
        tx.insert_map(&map)?;
        tx.insert_node(&root)?;
        tx.commit()?;

        debug!(map = %map.id, name = %map.name, "Map created");
        Ok((map, root))
    }

    /// All maps, most recently updated first.
    pub fn list_maps(&self) -> Result<Vec<MapMeta>> {
        let mut tx = self.gateway.begin()?;
        Ok(tx.list_maps()?)
    }

    pub fn map_meta(&self, map_id: &str) -> Result<MapMeta> {
        let mut tx = self.gateway.begin()?;
        tx.map_meta(map_id)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))
    }

    /// Map metadata plus every node, ordered by position.
    pub fn map_with_nodes(&self, map_id: &str) -> Result<(MapMeta, Vec<Node>)> {
        let mut tx = self.gateway.begin()?;
        let meta = tx
            .map_meta(map_id)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))?;
        let nodes = tx.nodes_in_map(map_id)?;
        Ok((meta, nodes))
    }

    /// Remove a map together with its nodes and change log. History rows
    /// are retained for audit. Returns false if the map did not exist.
    pub fn delete_map(&self, map_id: &str) -> Result<bool> {
        let mut tx = self.gateway.begin()?;
        tx.clear_changes(map_id)?;
        tx.remove_nodes_in_map(map_id)?;
        let removed = tx.remove_map(map_id)?;
        tx.commit()?;
        if removed {
            debug!(map = %map_id, "Map deleted");
        }
        Ok(removed)
    }

    /// Create a node under `parent_id`.
    ///
    /// `parent_id` must resolve to a node in the same map (this is what
    /// prevents cross-map attachment); `None` is reserved for restoring a
    /// parent-less root from a deletion snapshot. `explicit_id` preserves
    /// ids across delete/rollback round trips.
    pub fn create_node(
        &self,
        map_id: &str,
        parent_id: Option<&str>,
        content: &str,
        position: i64,
        style: &str,
        explicit_id: Option<&str>,
        actor: &Actor,
    ) -> Result<Node> {
        let now = now_ms();
        let mut tx = self.gateway.begin()?;

        if let Some(pid) = parent_id {
            match tx.node(pid)? {
                Some(parent) if parent.map_id == map_id => {}
                _ => return Err(Error::ParentNotFound(pid.to_string())),
            }
        }

        let version = tx
            .bump_version(map_id, now)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))?;

        let node = Node {
            id: explicit_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            map_id: map_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            content: content.to_string(),
            position,
            style: style.to_string(),
            collapsed: false,
            version,
            last_edited_by: actor.user_id.clone(),
            last_edited_by_name: actor.username.clone(),
            last_edited_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        tx.insert_node(&node)?;
        tx.append_change(map_id, version, ChangeAction::Create, &node.id)?;
        tx.append_history(&HistoryEntry {
            id: 0,
            node_id: node.id.clone(),
            map_id: map_id.to_string(),
            user_id: actor.user_id.clone(),
            username: actor.username.clone(),
            action: ChangeAction::Create,
            old_content: None,
            new_content: Some(content.to_string()),
            old_parent_id: None,
            new_parent_id: parent_id.map(str::to_string),
            old_position: None,
            new_position: Some(position),
            snapshot: None,
            map_version: version,
            created_at: now,
        })?;
        tx.commit()?;

        debug!(map = %map_id, node = %node.id, version, "Node created");
        Ok(node)
    }

    /// Apply an allow-listed field patch to a node.
    ///
    /// An empty patch is refused without bumping the version. A
    /// `parent_id` change must resolve within the same map. Stamps
    /// `version`, `updated_at` and the actor's identity.
    pub fn update_node(
        &self,
        map_id: &str,
        node_id: &str,
        changes: &NodeChanges,
        actor: &Actor,
    ) -> Result<Node> {
        if changes.is_empty() {
            return Err(Error::Validation("empty change set".to_string()));
        }

        let now = now_ms();
        let mut tx = self.gateway.begin()?;

        let old = tx
            .node(node_id)?
            .filter(|n| n.map_id == map_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        if let Some(pid) = &changes.parent_id {
            match tx.node(pid)? {
                Some(parent) if parent.map_id == map_id => {}
                _ => return Err(Error::ParentNotFound(pid.clone())),
            }
        }

        let version = tx
            .bump_version(map_id, now)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))?;

        let mut node = old.clone();
        if let Some(content) = &changes.content {
            node.content = content.clone();
        }
        if let Some(position) = changes.position {
            node.position = position;
        }
        if let Some(style) = &changes.style {
            node.style = style.clone();
        }
        if let Some(collapsed) = changes.collapsed {
            node.collapsed = collapsed;
        }
        if let Some(parent_id) = &changes.parent_id {
            node.parent_id = Some(parent_id.clone());
        }
        node.version = version;
        node.updated_at = now;
        if actor.user_id.is_some() {
            node.last_edited_by = actor.user_id.clone();
            node.last_edited_by_name = actor.username.clone();
            node.last_edited_at = Some(now);
        }

        tx.update_node(&node)?;
        tx.append_change(map_id, version, ChangeAction::Update, node_id)?;
        tx.append_history(&HistoryEntry {
            id: 0,
            node_id: node_id.to_string(),
            map_id: map_id.to_string(),
            user_id: actor.user_id.clone(),
            username: actor.username.clone(),
            action: ChangeAction::Update,
            old_content: Some(old.content.clone()),
            new_content: Some(node.content.clone()),
            old_parent_id: old.parent_id.clone(),
            new_parent_id: node.parent_id.clone(),
            old_position: Some(old.position),
            new_position: Some(node.position),
            snapshot: None,
            map_version: version,
            created_at: now,
        })?;
        tx.commit()?;

        debug!(map = %map_id, node = %node_id, version, "Node updated");
        Ok(node)
    }

    /// Delete a node and its whole subtree.
    ///
    /// The descendant set is collected with an explicit worklist (no
    /// recursion), snapshotted in full for the history record (root
    /// first), logged one change row per node at a single new version,
    /// and removed in reverse-collected order so children go before their
    /// parents.
    pub fn delete_node(&self, map_id: &str, node_id: &str, actor: &Actor) -> Result<DeleteOutcome> {
        let now = now_ms();
        let mut tx = self.gateway.begin()?;

        let root = tx
            .node(node_id)?
            .filter(|n| n.map_id == map_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let mut deleted_ids = vec![node_id.to_string()];
        let mut worklist = VecDeque::from([node_id.to_string()]);
        while let Some(pid) = worklist.pop_front() {
            for child in tx.child_ids(&pid)? {
                deleted_ids.push(child.clone());
                worklist.push_back(child);
            }
        }

        let mut subtree = Vec::with_capacity(deleted_ids.len());
        for id in &deleted_ids {
            if let Some(node) = tx.node(id)? {
                subtree.push(node);
            }
        }
        let snapshot = serde_json::to_string(&subtree)
            .map_err(|e| Error::Validation(format!("snapshot encoding failed: {e}")))?;

        let version = tx
            .bump_version(map_id, now)?
            .ok_or_else(|| Error::MapNotFound(map_id.to_string()))?;

        for id in &deleted_ids {
            tx.append_change(map_id, version, ChangeAction::Delete, id)?;
        }

        tx.append_history(&HistoryEntry {
            id: 0,
            node_id: node_id.to_string(),
            map_id: map_id.to_string(),
            user_id: actor.user_id.clone(),
            username: actor.username.clone(),
            action: ChangeAction::Delete,
            old_content: Some(root.content.clone()),
            new_content: None,
            old_parent_id: root.parent_id.clone(),
            new_parent_id: None,
            old_position: Some(root.position),
            new_position: None,
            snapshot: Some(snapshot),
            map_version: version,
            created_at: now,
        })?;

        for id in deleted_ids.iter().rev() {
            tx.remove_node(id)?;
        }
        tx.commit()?;

        debug!(
            map = %map_id,
            node = %node_id,
            removed = deleted_ids.len(),
            version,
            "Subtree deleted"
        );
        Ok(DeleteOutcome {
            map_id: map_id.to_string(),
            deleted_ids,
            new_version: version,
        })
    }

    /// Re-parent a node and set its sibling position.
    pub fn move_node(
        &self,
        map_id: &str,
        node_id: &str,
        new_parent_id: &str,
        position: i64,
        actor: &Actor,
    ) -> Result<Node> {
        self.update_node(
            map_id,
            node_id,
            &NodeChanges::reparent(new_parent_id, position),
            actor,
        )
    }
}
