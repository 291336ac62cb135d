//! Field-level node patches

use serde::{Deserialize, Serialize};

/// The allow-listed set of updatable node fields.
///
/// Every field is optional; an empty patch is rejected before any storage
/// write. Unrecognized fields fail deserialization rather than being
/// silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl NodeChanges {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.position.is_none()
            && self.style.is_none()
            && self.collapsed.is_none()
            && self.parent_id.is_none()
    }

    /// Patch used by a move: re-parent plus sibling position.
    pub fn reparent(parent_id: impl Into<String>, position: i64) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            position: Some(position),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patch() {
        assert!(NodeChanges::default().is_empty());
        let patch: NodeChanges = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn test_partial_patch() {
        let patch: NodeChanges = serde_json::from_str(r#"{"content":"hi","collapsed":true}"#).unwrap();
        assert_eq!(patch.content.as_deref(), Some("hi"));
        assert_eq!(patch.collapsed, Some(true));
        assert!(patch.position.is_none());
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<NodeChanges, _> = serde_json::from_str(r#"{"color":"red"}"#);
        assert!(result.is_err());
    }
}
