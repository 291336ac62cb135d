//! Data model: maps, nodes, change log, history and lock records

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// The identity stamped onto mutations and history rows.
///
/// `user_id` is `None` for anonymous editors; `username` is the display
/// name surfaced in lock conflicts and audit rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<String>,
    pub username: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            username: username.into(),
        }
    }

    /// Anonymous actor (no user id, empty display name).
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Map metadata row.
///
/// `version` starts at 0 and increases by exactly 1 per successful
/// mutation that touches any of the map's nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMeta {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub owner_id: Option<String>,
    pub team_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One tree element within a map.
///
/// `parent_id` is `None` only for the map's single root. `position` is an
/// arbitrary sibling sort key; the store never renumbers siblings.
/// `style` is an opaque JSON blob the server stores verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub map_id: String,
    pub parent_id: Option<String>,
    pub content: String,
    pub position: i64,
    pub style: String,
    pub collapsed: bool,
    pub version: u64,
    pub last_edited_by: Option<String>,
    pub last_edited_by_name: String,
    pub last_edited_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Kind of mutation recorded in the change log and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeAction::Create),
            "update" => Some(ChangeAction::Update),
            "delete" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only change log row: which node changed at which map version.
///
/// Entries for one map form a total order matching the version ledger. A
/// cascading delete emits one row per removed node, all at the same
/// version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub map_id: String,
    pub version: u64,
    pub action: ChangeAction,
    pub node_id: String,
}

/// Append-only audit row enabling rollback of a single past mutation.
///
/// Written once, never updated. For deletions, `snapshot` carries the full
/// JSON-encoded subtree (root first) so the whole cascade can be reversed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Assigned by the store on append; 0 until then.
    pub id: i64,
    pub node_id: String,
    pub map_id: String,
    pub user_id: Option<String>,
    pub username: String,
    pub action: ChangeAction,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    pub old_parent_id: Option<String>,
    pub new_parent_id: Option<String>,
    pub old_position: Option<i64>,
    pub new_position: Option<i64>,
    pub snapshot: Option<String>,
    pub map_version: u64,
    pub created_at: i64,
}

/// Result of a subtree deletion: every removed node id plus the single
/// version the cascade was stamped with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub map_id: String,
    pub deleted_ids: Vec<String>,
    pub new_version: u64,
}

/// Advisory lock on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub node_id: String,
    pub map_id: String,
    pub user_id: String,
    pub username: String,
    pub locked_at: i64,
}

/// Catch-up delta for a reconnecting or polling client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDelta {
    pub version: u64,
    pub changed: Vec<Node>,
    pub deleted: Vec<String>,
    pub locks: Vec<LockInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_action_round_trip() {
        for action in [ChangeAction::Create, ChangeAction::Update, ChangeAction::Delete] {
            assert_eq!(ChangeAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ChangeAction::parse("rename"), None);
    }

    #[test]
    fn test_node_json_field_names() {
        let node = Node {
            id: "n1".into(),
            map_id: "m1".into(),
            parent_id: None,
            content: "root".into(),
            position: 0,
            style: "{}".into(),
            collapsed: false,
            version: 0,
            last_edited_by: None,
            last_edited_by_name: String::new(),
            last_edited_at: None,
            created_at: 0,
            updated_at: 0,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["map_id"], "m1");
        assert_eq!(json["parent_id"], serde_json::Value::Null);
        assert_eq!(json["collapsed"], false);
    }
}
