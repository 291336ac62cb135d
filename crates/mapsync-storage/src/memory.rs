//! In-memory storage backend
//!
//! Volatile gateway for development and tests. A transaction clones the
//! current table set, applies its writes to the clone, and swaps the
//! clone back in on commit; the mutex is held for the whole transaction,
//! which serializes mutations exactly like the SQLite backend does.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};

use mapsync_core::gateway::{Gateway, StorageError, StoreTx};
use mapsync_core::model::{ChangeAction, ChangeLogEntry, HistoryEntry, MapMeta, Node};

#[derive(Default, Clone)]
struct Tables {
    maps: HashMap<String, MapMeta>,
    nodes: HashMap<String, Node>,
    changes: Vec<ChangeLogEntry>,
    history: Vec<HistoryEntry>,
    next_history_id: i64,
}

/// In-memory gateway backend. Data is lost when the process exits.
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables {
                next_history_id: 1,
                ..Tables::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>, StorageError> {
        let guard = self.inner.lock();
        let staged = guard.clone();
        Ok(Box::new(MemTx { guard, staged }))
    }
}

struct MemTx<'a> {
    guard: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl StoreTx for MemTx<'_> {
    fn insert_map(&mut self, map: &MapMeta) -> Result<(), StorageError> {
        self.staged.maps.insert(map.id.clone(), map.clone());
        Ok(())
    }

    fn map_meta(&mut self, map_id: &str) -> Result<Option<MapMeta>, StorageError> {
        Ok(self.staged.maps.get(map_id).cloned())
    }

    fn list_maps(&mut self) -> Result<Vec<MapMeta>, StorageError> {
        let mut maps: Vec<MapMeta> = self.staged.maps.values().cloned().collect();
        maps.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(maps)
    }

    fn remove_map(&mut self, map_id: &str) -> Result<bool, StorageError> {
        Ok(self.staged.maps.remove(map_id).is_some())
    }

    fn bump_version(&mut self, map_id: &str, now: i64) -> Result<Option<u64>, StorageError> {
        match self.staged.maps.get_mut(map_id) {
            Some(map) => {
                map.version += 1;
                map.updated_at = now;
                Ok(Some(map.version))
            }
            None => Ok(None),
        }
    }

    fn insert_node(&mut self, node: &Node) -> Result<(), StorageError> {
        self.staged.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn update_node(&mut self, node: &Node) -> Result<(), StorageError> {
        self.staged.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn remove_node(&mut self, node_id: &str) -> Result<(), StorageError> {
        self.staged.nodes.remove(node_id);
        Ok(())
    }

    fn remove_nodes_in_map(&mut self, map_id: &str) -> Result<(), StorageError> {
        self.staged.nodes.retain(|_, node| node.map_id != map_id);
        Ok(())
    }

    fn node(&mut self, node_id: &str) -> Result<Option<Node>, StorageError> {
        Ok(self.staged.nodes.get(node_id).cloned())
    }

    fn child_ids(&mut self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        let mut children: Vec<&Node> = self
            .staged
            .nodes
            .values()
            .filter(|node| node.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(children.into_iter().map(|node| node.id.clone()).collect())
    }

    fn nodes_in_map(&mut self, map_id: &str) -> Result<Vec<Node>, StorageError> {
        let mut nodes: Vec<Node> = self
            .staged
            .nodes
            .values()
            .filter(|node| node.map_id == map_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.position);
        Ok(nodes)
    }

    fn nodes_by_ids(&mut self, ids: &[String]) -> Result<Vec<Node>, StorageError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.staged.nodes.get(id).cloned())
            .collect())
    }

    fn append_change(
        &mut self,
        map_id: &str,
        version: u64,
        action: ChangeAction,
        node_id: &str,
    ) -> Result<(), StorageError> {
        self.staged.changes.push(ChangeLogEntry {
            map_id: map_id.to_string(),
            version,
            action,
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    fn changes_since(
        &mut self,
        map_id: &str,
        since: u64,
    ) -> Result<Vec<ChangeLogEntry>, StorageError> {
        // Appends happen in version order already.
        Ok(self
            .staged
            .changes
            .iter()
            .filter(|entry| entry.map_id == map_id && entry.version > since)
            .cloned()
            .collect())
    }

    fn clear_changes(&mut self, map_id: &str) -> Result<(), StorageError> {
        self.staged.changes.retain(|entry| entry.map_id != map_id);
        Ok(())
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64, StorageError> {
        let id = self.staged.next_history_id;
        self.staged.next_history_id += 1;
        let mut row = entry.clone();
        row.id = id;
        self.staged.history.push(row);
        Ok(id)
    }

    fn history_entry(&mut self, history_id: i64) -> Result<Option<HistoryEntry>, StorageError> {
        Ok(self
            .staged
            .history
            .iter()
            .find(|entry| entry.id == history_id)
            .cloned())
    }

    fn node_history(
        &mut self,
        node_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self
            .staged
            .history
            .iter()
            .rev()
            .filter(|entry| entry.node_id == node_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn map_history(&mut self, map_id: &str, limit: u32) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self
            .staged
            .history
            .iter()
            .rev()
            .filter(|entry| entry.map_id == map_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapsync_core::model::now_ms;

    fn sample_map(id: &str) -> MapMeta {
        let now = now_ms();
        MapMeta {
            id: id.to_string(),
            name: "test".to_string(),
            version: 0,
            owner_id: None,
            team_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_uncommitted_transaction_discards_writes() {
        let store = MemoryStore::new();

        {
            let mut tx = store.begin().unwrap();
            tx.insert_map(&sample_map("m1")).unwrap();
        }

        let mut tx = store.begin().unwrap();
        assert!(tx.map_meta("m1").unwrap().is_none());
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();

        let mut tx = store.begin().unwrap();
        tx.insert_map(&sample_map("m1")).unwrap();
        assert_eq!(tx.bump_version("m1", now_ms()).unwrap(), Some(1));
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.map_meta("m1").unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_history_ids_are_assigned_in_order() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();

        let entry = HistoryEntry {
            id: 0,
            node_id: "n1".to_string(),
            map_id: "m1".to_string(),
            user_id: None,
            username: String::new(),
            action: ChangeAction::Create,
            old_content: None,
            new_content: Some("x".to_string()),
            old_parent_id: None,
            new_parent_id: None,
            old_position: None,
            new_position: Some(0),
            snapshot: None,
            map_version: 1,
            created_at: now_ms(),
        };
        assert_eq!(tx.append_history(&entry).unwrap(), 1);
        assert_eq!(tx.append_history(&entry).unwrap(), 2);
    }
}
