//! Message envelope for the real-time channel
//!
//! Every frame is a JSON object `{type, ...}`. Inbound frames carry their
//! payload under `data`; the closed [`ClientMessage`] enum is the only way
//! in, so an unrecognized tag is a typed error rather than a silently
//! ignored frame. Outbound frames are built by [`ServerMessage::encode`];
//! peer broadcasts reuse the originating message's tag as their own.

use serde::Deserialize;
use serde_json::{json, Value};

use mapsync_core::{LockInfo, NodeChanges, SyncDelta};

use crate::error::{ProtocolError, ProtocolResult};

/// Close codes used before any message exchange.
pub mod close_code {
    /// Credential missing or unusable.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// Authenticated but not allowed on this map.
    pub const ACCESS_DENIED: u16 = 4003;
    /// The map does not exist.
    pub const MAP_NOT_FOUND: u16 = 4004;
}

fn default_style() -> String {
    "{}".to_string()
}

/// `node:create` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePayload {
    pub parent_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default = "default_style")]
    pub style: String,
    /// Client-supplied id, e.g. for optimistic inserts.
    #[serde(default)]
    pub id: Option<String>,
}

/// `node:update` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePayload {
    pub id: String,
    #[serde(default)]
    pub changes: NodeChanges,
}

/// `node:delete`, `node:lock` and `node:unlock` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRefPayload {
    pub id: String,
}

/// `node:move` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MovePayload {
    pub id: String,
    pub parent_id: String,
    #[serde(default)]
    pub position: i64,
}

/// `sync` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub since_version: u64,
}

/// All inbound message kinds, one handler each.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    NodeCreate(CreatePayload),
    NodeUpdate(UpdatePayload),
    NodeDelete(NodeRefPayload),
    NodeMove(MovePayload),
    NodeLock(NodeRefPayload),
    NodeUnlock(NodeRefPayload),
    Sync(SyncPayload),
}

impl ClientMessage {
    /// Parse one inbound frame.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        let data = value.get("data").cloned().unwrap_or_else(|| json!({}));

        fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> ProtocolResult<T> {
            serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                detail: e.to_string(),
            })
        }

        match kind.as_str() {
            "node:create" => Ok(Self::NodeCreate(payload(&kind, data)?)),
            "node:update" => Ok(Self::NodeUpdate(payload(&kind, data)?)),
            "node:delete" => Ok(Self::NodeDelete(payload(&kind, data)?)),
            "node:move" => Ok(Self::NodeMove(payload(&kind, data)?)),
            "node:lock" => Ok(Self::NodeLock(payload(&kind, data)?)),
            "node:unlock" => Ok(Self::NodeUnlock(payload(&kind, data)?)),
            "sync" => Ok(Self::Sync(payload(&kind, data)?)),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// The wire tag, echoed back in acks and peer broadcasts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeCreate(_) => "node:create",
            Self::NodeUpdate(_) => "node:update",
            Self::NodeDelete(_) => "node:delete",
            Self::NodeMove(_) => "node:move",
            Self::NodeLock(_) => "node:lock",
            Self::NodeUnlock(_) => "node:unlock",
            Self::Sync(_) => "sync",
        }
    }
}

/// All outbound frames.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Join reply: the connection's identity plus everything needed to
    /// initialize client state without a separate query.
    Connected {
        client_id: String,
        version: u64,
        user_id: Option<String>,
        locks: Vec<LockInfo>,
    },
    /// Mutation acknowledgment to the sender.
    Ack {
        original_type: &'static str,
        data: Value,
        version: u64,
    },
    /// Mutation broadcast to every other room member; the tag is the
    /// originating message's tag so peers dispatch it like a fresh event.
    Peer {
        kind: &'static str,
        data: Value,
        version: u64,
        client_id: String,
    },
    /// Lock state change, mirrored identically to everyone (sender
    /// included, no ack/broadcast split).
    LockEvent {
        kind: &'static str,
        data: Value,
        client_id: String,
    },
    /// Catch-up delta for an in-band `sync` request.
    SyncState { delta: SyncDelta },
    /// Per-message failure; the connection stays open.
    Error { message: String },
    /// A peer left the room.
    PeerDisconnect { client_id: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Connected {
                client_id,
                version,
                user_id,
                locks,
            } => json!({
                "type": "connected",
                "client_id": client_id,
                "version": version,
                "user_id": user_id,
                "locks": locks,
            }),
            Self::Ack {
                original_type,
                data,
                version,
            } => json!({
                "type": "ack",
                "original_type": original_type,
                "data": data,
                "version": version,
            }),
            Self::Peer {
                kind,
                data,
                version,
                client_id,
            } => json!({
                "type": kind,
                "data": data,
                "version": version,
                "client_id": client_id,
            }),
            Self::LockEvent {
                kind,
                data,
                client_id,
            } => json!({
                "type": kind,
                "data": data,
                "client_id": client_id,
            }),
            Self::SyncState { delta } => json!({
                "type": "sync",
                "data": delta,
            }),
            Self::Error { message } => json!({
                "type": "error",
                "message": message,
            }),
            Self::PeerDisconnect { client_id } => json!({
                "type": "peer:disconnect",
                "client_id": client_id,
            }),
        }
    }

    /// Encode to the wire (one JSON text frame).
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let msg = ClientMessage::parse(
            r#"{"type":"node:create","data":{"parent_id":"p1","content":"hello","position":2}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::NodeCreate(payload) => {
                assert_eq!(payload.parent_id, "p1");
                assert_eq!(payload.content, "hello");
                assert_eq!(payload.position, 2);
                assert_eq!(payload.style, "{}");
                assert!(payload.id.is_none());
            }
            other => panic!("expected NodeCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_with_changes() {
        let msg = ClientMessage::parse(
            r#"{"type":"node:update","data":{"id":"n1","changes":{"content":"x","collapsed":true}}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::NodeUpdate(payload) => {
                assert_eq!(payload.id, "n1");
                assert_eq!(payload.changes.content.as_deref(), Some("x"));
                assert_eq!(payload.changes.collapsed, Some(true));
            }
            other => panic!("expected NodeUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"node:rename","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "node:rename"));
    }

    #[test]
    fn test_parse_missing_type() {
        let err = ClientMessage::parse(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn test_parse_rejects_unknown_change_field() {
        let err = ClientMessage::parse(
            r#"{"type":"node:update","data":{"id":"n1","changes":{"color":"red"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_parse_missing_required_field() {
        let err = ClientMessage::parse(r#"{"type":"node:move","data":{"id":"n1"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_encode_ack_envelope() {
        let msg = ServerMessage::Ack {
            original_type: "node:update",
            data: json!({"id": "n1"}),
            version: 7,
        };
        let value = msg.to_value();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["original_type"], "node:update");
        assert_eq!(value["version"], 7);
        assert_eq!(value["data"]["id"], "n1");
    }

    #[test]
    fn test_encode_peer_broadcast_reuses_tag() {
        let msg = ServerMessage::Peer {
            kind: "node:move",
            data: json!({"id": "n1"}),
            version: 3,
            client_id: "c1".to_string(),
        };
        let value = msg.to_value();
        assert_eq!(value["type"], "node:move");
        assert_eq!(value["client_id"], "c1");
        assert_eq!(value["version"], 3);
    }

    #[test]
    fn test_encode_connected_carries_locks() {
        let msg = ServerMessage::Connected {
            client_id: "c1".to_string(),
            version: 5,
            user_id: Some("u1".to_string()),
            locks: vec![LockInfo {
                node_id: "n1".to_string(),
                map_id: "m1".to_string(),
                user_id: "u2".to_string(),
                username: "Bob".to_string(),
                locked_at: 1,
            }],
        };
        let value = msg.to_value();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["locks"][0]["username"], "Bob");
    }

    #[test]
    fn test_encode_error_and_disconnect() {
        let value = ServerMessage::error("boom").to_value();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "boom");

        let value = ServerMessage::PeerDisconnect {
            client_id: "c9".to_string(),
        }
        .to_value();
        assert_eq!(value["type"], "peer:disconnect");
        assert_eq!(value["client_id"], "c9");
    }
}
