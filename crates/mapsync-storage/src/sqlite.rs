//! SQLite storage backend

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use mapsync_core::gateway::{Gateway, StorageError, StoreTx};
use mapsync_core::model::{ChangeAction, ChangeLogEntry, HistoryEntry, MapMeta, Node};

fn db(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// SQLite gateway backend.
///
/// Embedded persistence for single-node deployments. The connection sits
/// behind a mutex and every transaction is `BEGIN IMMEDIATE`, so mutations
/// are fully serialized: concurrent edits to one map linearize by commit
/// order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::debug!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// In-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS maps (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                version     INTEGER NOT NULL DEFAULT 0,
                owner_id    TEXT,
                team_id     TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id          TEXT PRIMARY KEY,
                map_id      TEXT NOT NULL,
                parent_id   TEXT,
                content     TEXT NOT NULL,
                position    INTEGER NOT NULL DEFAULT 0,
                style       TEXT NOT NULL DEFAULT '{}',
                collapsed   INTEGER NOT NULL DEFAULT 0,
                version     INTEGER NOT NULL DEFAULT 0,
                last_edited_by      TEXT,
                last_edited_by_name TEXT NOT NULL DEFAULT '',
                last_edited_at      INTEGER,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_map ON nodes(map_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);

            CREATE TABLE IF NOT EXISTS change_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                map_id      TEXT NOT NULL,
                version     INTEGER NOT NULL,
                action      TEXT NOT NULL,
                node_id     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_change_log_map_ver ON change_log(map_id, version);

            CREATE TABLE IF NOT EXISTS node_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id     TEXT NOT NULL,
                map_id      TEXT NOT NULL,
                user_id     TEXT,
                username    TEXT NOT NULL DEFAULT '',
                action      TEXT NOT NULL,
                old_content   TEXT,
                new_content   TEXT,
                old_parent_id TEXT,
                new_parent_id TEXT,
                old_position  INTEGER,
                new_position  INTEGER,
                snapshot    TEXT,
                map_version INTEGER NOT NULL,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_node_history_node ON node_history(node_id);
            CREATE INDEX IF NOT EXISTS idx_node_history_map ON node_history(map_id, created_at);
            "#,
        )
        .map_err(db)?;
        Ok(())
    }
}

impl Gateway for SqliteStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>, StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db)?;
        Ok(Box::new(SqliteTx {
            conn,
            committed: false,
        }))
    }
}

struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn action_from_sql(idx: usize, value: &str) -> rusqlite::Result<ChangeAction> {
    ChangeAction::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown action: {value}").into(),
        )
    })
}

fn map_from_row(row: &Row<'_>) -> rusqlite::Result<MapMeta> {
    Ok(MapMeta {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get::<_, i64>(2)? as u64,
        owner_id: row.get(3)?,
        team_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        map_id: row.get(1)?,
        parent_id: row.get(2)?,
        content: row.get(3)?,
        position: row.get(4)?,
        style: row.get(5)?,
        collapsed: row.get(6)?,
        version: row.get::<_, i64>(7)? as u64,
        last_edited_by: row.get(8)?,
        last_edited_by_name: row.get(9)?,
        last_edited_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let action: String = row.get(5)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        node_id: row.get(1)?,
        map_id: row.get(2)?,
        user_id: row.get(3)?,
        username: row.get(4)?,
        action: action_from_sql(5, &action)?,
        old_content: row.get(6)?,
        new_content: row.get(7)?,
        old_parent_id: row.get(8)?,
        new_parent_id: row.get(9)?,
        old_position: row.get(10)?,
        new_position: row.get(11)?,
        snapshot: row.get(12)?,
        map_version: row.get::<_, i64>(13)? as u64,
        created_at: row.get(14)?,
    })
}

const MAP_COLUMNS: &str = "id, name, version, owner_id, team_id, created_at, updated_at";
const NODE_COLUMNS: &str = "id, map_id, parent_id, content, position, style, collapsed, version, \
     last_edited_by, last_edited_by_name, last_edited_at, created_at, updated_at";
const HISTORY_COLUMNS: &str = "id, node_id, map_id, user_id, username, action, \
     old_content, new_content, old_parent_id, new_parent_id, old_position, new_position, \
     snapshot, map_version, created_at";

impl StoreTx for SqliteTx<'_> {
    fn insert_map(&mut self, map: &MapMeta) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO maps (id, name, version, owner_id, team_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    map.id,
                    map.name,
                    map.version as i64,
                    map.owner_id,
                    map.team_id,
                    map.created_at,
                    map.updated_at
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn map_meta(&mut self, map_id: &str) -> Result<Option<MapMeta>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {MAP_COLUMNS} FROM maps WHERE id = ?1"),
                params![map_id],
                map_from_row,
            )
            .optional()
            .map_err(db)
    }

    fn list_maps(&mut self) -> Result<Vec<MapMeta>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MAP_COLUMNS} FROM maps ORDER BY updated_at DESC"
            ))
            .map_err(db)?;
        let maps = stmt
            .query_map([], map_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(maps)
    }

    fn remove_map(&mut self, map_id: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM maps WHERE id = ?1", params![map_id])
            .map_err(db)?;
        Ok(affected > 0)
    }

    fn bump_version(&mut self, map_id: &str, now: i64) -> Result<Option<u64>, StorageError> {
        let affected = self
            .conn
            .execute(
                "UPDATE maps SET version = version + 1, updated_at = ?1 WHERE id = ?2",
                params![now, map_id],
            )
            .map_err(db)?;
        if affected == 0 {
            return Ok(None);
        }
        let version: i64 = self
            .conn
            .query_row(
                "SELECT version FROM maps WHERE id = ?1",
                params![map_id],
                |row| row.get(0),
            )
            .map_err(db)?;
        Ok(Some(version as u64))
    }

    fn insert_node(&mut self, node: &Node) -> Result<(), StorageError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO nodes ({NODE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    node.id,
                    node.map_id,
                    node.parent_id,
                    node.content,
                    node.position,
                    node.style,
                    node.collapsed,
                    node.version as i64,
                    node.last_edited_by,
                    node.last_edited_by_name,
                    node.last_edited_at,
                    node.created_at,
                    node.updated_at
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn update_node(&mut self, node: &Node) -> Result<(), StorageError> {
        self.conn
            .execute(
                "UPDATE nodes SET map_id = ?2, parent_id = ?3, content = ?4, position = ?5, \
                 style = ?6, collapsed = ?7, version = ?8, last_edited_by = ?9, \
                 last_edited_by_name = ?10, last_edited_at = ?11, created_at = ?12, \
                 updated_at = ?13 WHERE id = ?1",
                params![
                    node.id,
                    node.map_id,
                    node.parent_id,
                    node.content,
                    node.position,
                    node.style,
                    node.collapsed,
                    node.version as i64,
                    node.last_edited_by,
                    node.last_edited_by_name,
                    node.last_edited_at,
                    node.created_at,
                    node.updated_at
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn remove_node(&mut self, node_id: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM nodes WHERE id = ?1", params![node_id])
            .map_err(db)?;
        Ok(())
    }

    fn remove_nodes_in_map(&mut self, map_id: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM nodes WHERE map_id = ?1", params![map_id])
            .map_err(db)?;
        Ok(())
    }

    fn node(&mut self, node_id: &str) -> Result<Option<Node>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![node_id],
                node_from_row,
            )
            .optional()
            .map_err(db)
    }

    fn child_ids(&mut self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM nodes WHERE parent_id = ?1 ORDER BY position, id")
            .map_err(db)?;
        let ids = stmt
            .query_map(params![parent_id], |row| row.get(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(ids)
    }

    fn nodes_in_map(&mut self, map_id: &str) -> Result<Vec<Node>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE map_id = ?1 ORDER BY position"
            ))
            .map_err(db)?;
        let nodes = stmt
            .query_map(params![map_id], node_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(nodes)
    }

    fn nodes_by_ids(&mut self, ids: &[String]) -> Result<Vec<Node>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({placeholders})"
            ))
            .map_err(db)?;
        let nodes = stmt
            .query_map(params_from_iter(ids.iter()), node_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(nodes)
    }

    fn append_change(
        &mut self,
        map_id: &str,
        version: u64,
        action: ChangeAction,
        node_id: &str,
    ) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO change_log (map_id, version, action, node_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![map_id, version as i64, action.as_str(), node_id],
            )
            .map_err(db)?;
        Ok(())
    }

    fn changes_since(
        &mut self,
        map_id: &str,
        since: u64,
    ) -> Result<Vec<ChangeLogEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT map_id, version, action, node_id FROM change_log \
                 WHERE map_id = ?1 AND version > ?2 ORDER BY version, id",
            )
            .map_err(db)?;
        let entries = stmt
            .query_map(params![map_id, since as i64], |row| {
                let action: String = row.get(2)?;
                Ok(ChangeLogEntry {
                    map_id: row.get(0)?,
                    version: row.get::<_, i64>(1)? as u64,
                    action: action_from_sql(2, &action)?,
                    node_id: row.get(3)?,
                })
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(entries)
    }

    fn clear_changes(&mut self, map_id: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM change_log WHERE map_id = ?1", params![map_id])
            .map_err(db)?;
        Ok(())
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64, StorageError> {
        self.conn
            .execute(
                "INSERT INTO node_history (node_id, map_id, user_id, username, action, \
                 old_content, new_content, old_parent_id, new_parent_id, old_position, \
                 new_position, snapshot, map_version, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.node_id,
                    entry.map_id,
                    entry.user_id,
                    entry.username,
                    entry.action.as_str(),
                    entry.old_content,
                    entry.new_content,
                    entry.old_parent_id,
                    entry.new_parent_id,
                    entry.old_position,
                    entry.new_position,
                    entry.snapshot,
                    entry.map_version as i64,
                    entry.created_at
                ],
            )
            .map_err(db)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn history_entry(&mut self, history_id: i64) -> Result<Option<HistoryEntry>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM node_history WHERE id = ?1"),
                params![history_id],
                history_from_row,
            )
            .optional()
            .map_err(db)
    }

    fn node_history(
        &mut self,
        node_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM node_history WHERE node_id = ?1 \
                 ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(db)?;
        let entries = stmt
            .query_map(params![node_id, limit], history_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(entries)
    }

    fn map_history(&mut self, map_id: &str, limit: u32) -> Result<Vec<HistoryEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM node_history WHERE map_id = ?1 \
                 ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(db)?;
        let entries = stmt
            .query_map(params![map_id, limit], history_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(entries)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT").map_err(db)?;
        self.committed = true;
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
    fn test_uncommitted_transaction_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();

        {
            let mut tx = store.begin().unwrap();
            tx.insert_map(&sample_map("m1")).unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().unwrap();
        assert!(tx.map_meta("m1").unwrap().is_none());
    }

    #[test]
    fn test_bump_version_missing_map() {
        let store = SqliteStore::in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.bump_version("nope", now_ms()).unwrap(), None);
    }

    #[test]
    fn test_bump_version_sequence() {
        let store = SqliteStore::in_memory().unwrap();

        let mut tx = store.begin().unwrap();
        tx.insert_map(&sample_map("m1")).unwrap();
        assert_eq!(tx.bump_version("m1", now_ms()).unwrap(), Some(1));
        assert_eq!(tx.bump_version("m1", now_ms()).unwrap(), Some(2));
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.map_meta("m1").unwrap().unwrap().version, 2);
    }
}
