//! Advisory per-node edit locks
//!
//! Locks reduce edit collisions; they never gate the storage layer.
//! Losing the table (process restart) only degrades collision prevention.
//! The whole table sits behind one mutex so acquire/refresh/expire/list
//! are atomic with respect to each other.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::{now_ms, LockInfo};

/// How long a lock survives without a refresh.
pub const LOCK_TTL: Duration = Duration::from_secs(5 * 60);

struct LockRecord {
    map_id: String,
    user_id: String,
    username: String,
    refreshed: Instant,
    locked_at: i64,
}

impl LockRecord {
    fn info(&self, node_id: &str) -> LockInfo {
        LockInfo {
            node_id: node_id.to_string(),
            map_id: self.map_id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            locked_at: self.locked_at,
        }
    }
}

/// TTL-based mutual exclusion hints, one per node.
pub struct LockManager {
    ttl: Duration,
    table: Mutex<HashMap<String, LockRecord>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_ttl(LOCK_TTL)
    }

    /// Custom TTL, for tests exercising expiry.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire or refresh the lock on a node.
    ///
    /// Re-acquisition by the current holder refreshes the TTL. A live
    /// lock held by anyone else fails with [`Error::LockHeld`] carrying
    /// the holder's display name; conflicts are not retried here.
    pub fn acquire(
        &self,
        node_id: &str,
        map_id: &str,
        holder_id: &str,
        holder_name: &str,
    ) -> Result<LockInfo> {
        let mut table = self.table.lock();
        Self::evict_expired(&mut table, self.ttl);

        if let Some(record) = table.get_mut(node_id) {
            if record.user_id == holder_id {
                record.refreshed = Instant::now();
                record.locked_at = now_ms();
                return Ok(record.info(node_id));
            }
            return Err(Error::LockHeld {
                username: record.username.clone(),
            });
        }

        let record = LockRecord {
            map_id: map_id.to_string(),
            user_id: holder_id.to_string(),
            username: holder_name.to_string(),
            refreshed: Instant::now(),
            locked_at: now_ms(),
        };
        let info = record.info(node_id);
        table.insert(node_id.to_string(), record);
        Ok(info)
    }

    /// Release a lock. No-op returning false when the caller does not
    /// hold it (including when it already expired or never existed).
    pub fn release(&self, node_id: &str, holder_id: &str) -> bool {
        let mut table = self.table.lock();
        match table.get(node_id) {
            Some(record) if record.user_id == holder_id => {
                table.remove(node_id);
                true
            }
            _ => false,
        }
    }

    /// Live locks for one map; expired entries are evicted on the way.
    pub fn locks_for_map(&self, map_id: &str) -> Vec<LockInfo> {
        let mut table = self.table.lock();
        Self::evict_expired(&mut table, self.ttl);
        table
            .iter()
            .filter(|(_, record)| record.map_id == map_id)
            .map(|(node_id, record)| record.info(node_id))
            .collect()
    }

    /// Display name of a live holder other than `holder_id`, if any.
    /// This is the pre-mutation gate used by the transport handler.
    pub fn held_by_other(&self, node_id: &str, holder_id: &str) -> Option<String> {
        let table = self.table.lock();
        table
            .get(node_id)
            .filter(|record| record.refreshed.elapsed() < self.ttl)
            .filter(|record| record.user_id != holder_id)
            .map(|record| record.username.clone())
    }

    fn evict_expired(table: &mut HashMap<String, LockRecord>, ttl: Duration) {
        table.retain(|_, record| record.refreshed.elapsed() < ttl);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_conflict() {
        let locks = LockManager::new();

        locks.acquire("n1", "m1", "alice", "Alice").unwrap();

        // Another holder is refused and told who has it.
        match locks.acquire("n1", "m1", "bob", "Bob") {
            Err(Error::LockHeld { username }) => assert_eq!(username, "Alice"),
            other => panic!("expected LockHeld, got {other:?}"),
        }

        // Re-acquire by the holder refreshes instead of conflicting.
        assert!(locks.acquire("n1", "m1", "alice", "Alice").is_ok());
    }

    #[test]
    fn test_release_then_reacquire() {
        let locks = LockManager::new();

        locks.acquire("n1", "m1", "alice", "Alice").unwrap();
        assert!(locks.release("n1", "alice"));
        assert!(locks.acquire("n1", "m1", "bob", "Bob").is_ok());
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let locks = LockManager::new();

        locks.acquire("n1", "m1", "alice", "Alice").unwrap();
        assert!(!locks.release("n1", "bob"));
        assert!(!locks.release("n2", "alice"));

        // Alice still holds it.
        assert!(locks.held_by_other("n1", "bob").is_some());
    }

    #[test]
    fn test_ttl_expiry_observed_lazily() {
        let locks = LockManager::with_ttl(Duration::ZERO);

        locks.acquire("n1", "m1", "alice", "Alice").unwrap();

        // The expired lock is gone by the time anyone looks.
        assert!(locks.locks_for_map("m1").is_empty());
        assert!(locks.acquire("n1", "m1", "bob", "Bob").is_ok());
    }

    #[test]
    fn test_locks_for_map_filters_by_map() {
        let locks = LockManager::new();

        locks.acquire("n1", "m1", "alice", "Alice").unwrap();
        locks.acquire("n2", "m2", "bob", "Bob").unwrap();

        let m1_locks = locks.locks_for_map("m1");
        assert_eq!(m1_locks.len(), 1);
        assert_eq!(m1_locks[0].node_id, "n1");
    }

    #[test]
    fn test_held_by_other() {
        let locks = LockManager::new();

        assert!(locks.held_by_other("n1", "alice").is_none());
        locks.acquire("n1", "m1", "alice", "Alice").unwrap();
        assert!(locks.held_by_other("n1", "alice").is_none());
        assert_eq!(locks.held_by_other("n1", "bob").as_deref(), Some("Alice"));
    }
}
