//! Connection handler - dispatches inbound messages to the core
//!
//! One handler per connection. Every inbound frame produces zero or more
//! outbound frames with an explicit destination; the socket loop performs
//! the sends. Failures become one `error` frame to the offending
//! connection and the loop continues - a bad message never closes the
//! socket.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use mapsync_core::{Actor, Error, LockManager, NodeStore, SyncResolver};
use mapsync_protocol::{ClientMessage, ServerMessage};

use crate::auth::{AccessLevel, AccessPolicy};
use crate::room::Room;

/// An outbound frame with its destination.
#[derive(Debug)]
pub enum Outbound {
    /// To the sender only.
    Reply(ServerMessage),
    /// To every other room member.
    Peers(ServerMessage),
    /// To every room member including the sender.
    Everyone(ServerMessage),
}

/// Handles one connection's message loop.
pub struct MessageHandler {
    client_id: String,
    actor: Actor,
    map_id: String,
    store: Arc<NodeStore>,
    locks: Arc<LockManager>,
    resolver: Arc<SyncResolver>,
    policy: Arc<dyn AccessPolicy>,
    room: Arc<Room>,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: String,
        actor: Actor,
        map_id: String,
        store: Arc<NodeStore>,
        locks: Arc<LockManager>,
        resolver: Arc<SyncResolver>,
        policy: Arc<dyn AccessPolicy>,
        room: Arc<Room>,
    ) -> Self {
        Self {
            client_id,
            actor,
            map_id,
            store,
            locks,
            resolver,
            policy,
            room,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Lock holder identity: the user when authenticated, otherwise the
    /// connection itself.
    fn holder_id(&self) -> &str {
        self.actor.user_id.as_deref().unwrap_or(&self.client_id)
    }

    /// Process one inbound frame.
    pub fn handle(&self, text: &str) -> Vec<Outbound> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => return vec![Outbound::Reply(ServerMessage::error(e.to_string()))],
        };

        debug!(client = %self.client_id, kind = message.kind(), "Processing message");

        // Permission is re-checked per node:* message, not just at join.
        if !matches!(message, ClientMessage::Sync(_))
            && !self.policy.can_access(
                self.actor.user_id.as_deref(),
                &self.map_id,
                AccessLevel::Edit,
            )
        {
            return vec![Outbound::Reply(ServerMessage::error("Permission denied"))];
        }

        match message {
            ClientMessage::NodeCreate(payload) => self.mutation("node:create", || {
                let node = self.store.create_node(
                    &self.map_id,
                    Some(&payload.parent_id),
                    &payload.content,
                    payload.position,
                    &payload.style,
                    payload.id.as_deref(),
                    &self.actor,
                )?;
                Ok(json!(node))
            }),
            ClientMessage::NodeUpdate(payload) => {
                if let Some(frames) = self.lock_gate(&payload.id) {
                    return frames;
                }
                self.mutation("node:update", || {
                    let node = self.store.update_node(
                        &self.map_id,
                        &payload.id,
                        &payload.changes,
                        &self.actor,
                    )?;
                    Ok(json!(node))
                })
            }
            ClientMessage::NodeDelete(payload) => {
                if let Some(frames) = self.lock_gate(&payload.id) {
                    return frames;
                }
                self.mutation("node:delete", || {
                    let outcome = self.store.delete_node(&self.map_id, &payload.id, &self.actor)?;
                    Ok(json!({
                        "id": payload.id,
                        "deleted_ids": outcome.deleted_ids,
                    }))
                })
            }
            ClientMessage::NodeMove(payload) => {
                if let Some(frames) = self.lock_gate(&payload.id) {
                    return frames;
                }
                self.mutation("node:move", || {
                    let node = self.store.move_node(
                        &self.map_id,
                        &payload.id,
                        &payload.parent_id,
                        payload.position,
                        &self.actor,
                    )?;
                    Ok(json!(node))
                })
            }
            ClientMessage::NodeLock(payload) => self.handle_lock(&payload.id),
            ClientMessage::NodeUnlock(payload) => self.handle_unlock(&payload.id),
            ClientMessage::Sync(payload) => self.handle_sync(payload.since_version),
        }
    }

    /// Run one store mutation: on success exactly one ack to the sender
    /// and one broadcast to everyone else, both carrying the freshly
    /// incremented room version.
    fn mutation(
        &self,
        kind: &'static str,
        op: impl FnOnce() -> mapsync_core::Result<serde_json::Value>,
    ) -> Vec<Outbound> {
        match op() {
            Ok(data) => {
                let version = self.room.next_version();
                vec![
                    Outbound::Reply(ServerMessage::Ack {
                        original_type: kind,
                        data: data.clone(),
                        version,
                    }),
                    Outbound::Peers(ServerMessage::Peer {
                        kind,
                        data,
                        version,
                        client_id: self.client_id.clone(),
                    }),
                ]
            }
            Err(e) => vec![Outbound::Reply(ServerMessage::error(e.to_string()))],
        }
    }

    /// Advisory pre-mutation gate: reject with a conflict before touching
    /// the store when someone else holds the node's lock.
    fn lock_gate(&self, node_id: &str) -> Option<Vec<Outbound>> {
        self.locks
            .held_by_other(node_id, self.holder_id())
            .map(|username| {
                vec![Outbound::Reply(ServerMessage::error(
                    Error::LockHeld { username }.to_string(),
                ))]
            })
    }

    fn handle_lock(&self, node_id: &str) -> Vec<Outbound> {
        match self.locks.acquire(
            node_id,
            &self.map_id,
            self.holder_id(),
            &self.actor.username,
        ) {
            Ok(info) => vec![Outbound::Everyone(ServerMessage::LockEvent {
                kind: "node:lock",
                data: json!(info),
                client_id: self.client_id.clone(),
            })],
            Err(e) => vec![Outbound::Reply(ServerMessage::error(e.to_string()))],
        }
    }

    fn handle_unlock(&self, node_id: &str) -> Vec<Outbound> {
        // Releasing a lock we don't hold is a silent no-op: broadcasting
        // an unlock here would wrongly clear a live holder's lock on
        // every peer.
        if self.locks.release(node_id, self.holder_id()) {
            vec![Outbound::Everyone(ServerMessage::LockEvent {
                kind: "node:unlock",
                data: json!({ "id": node_id }),
                client_id: self.client_id.clone(),
            })]
        } else {
            Vec::new()
        }
    }

    fn handle_sync(&self, since_version: u64) -> Vec<Outbound> {
        match self.resolver.sync_since(&self.map_id, since_version) {
            Ok(delta) => vec![Outbound::Reply(ServerMessage::SyncState { delta })],
            Err(e) => vec![Outbound::Reply(ServerMessage::error(e.to_string()))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::room::RoomRegistry;
    use mapsync_core::Gateway;
    use mapsync_storage::MemoryStore;
    use tokio::sync::mpsc;

    struct DenyAll;
    impl AccessPolicy for DenyAll {
        fn can_access(&self, _: Option<&str>, _: &str, _: AccessLevel) -> bool {
            false
        }
    }

    struct Fixture {
        store: Arc<NodeStore>,
        locks: Arc<LockManager>,
        resolver: Arc<SyncResolver>,
        registry: RoomRegistry,
        map_id: String,
        root_id: String,
    }

    fn fixture() -> Fixture {
        let gateway: Arc<dyn Gateway> = Arc::new(MemoryStore::new());
        let store = Arc::new(NodeStore::new(gateway.clone()));
        let locks = Arc::new(LockManager::new());
        let resolver = Arc::new(SyncResolver::new(gateway, locks.clone()));
        let (map, root) = store.create_map("test").unwrap();
        Fixture {
            store,
            locks,
            resolver,
            registry: RoomRegistry::new(),
            map_id: map.id,
            root_id: root.id,
        }
    }

    fn handler_for(fx: &Fixture, client_id: &str, actor: Actor) -> MessageHandler {
        let (tx, _rx) = mpsc::unbounded_channel();
        let room = fx.registry.join(&fx.map_id, client_id, 0, tx);
        MessageHandler::new(
            client_id.to_string(),
            actor,
            fx.map_id.clone(),
            fx.store.clone(),
            fx.locks.clone(),
            fx.resolver.clone(),
            Arc::new(AllowAll),
            room,
        )
    }

    fn expect_error(frames: &[Outbound]) -> String {
        match frames {
            [Outbound::Reply(ServerMessage::Error { message })] => message.clone(),
            other => panic!("expected one error reply, got {other:?}"),
        }
    }

    #[test]
    fn test_mutation_acks_sender_and_broadcasts_to_peers() {
        let fx = fixture();
        let handler = handler_for(&fx, "c1", Actor::new("u1", "Alice"));

        let frames = handler.handle(&format!(
            r#"{{"type":"node:create","data":{{"parent_id":"{}","content":"hi"}}}}"#,
            fx.root_id
        ));

        match &frames[..] {
            [Outbound::Reply(ServerMessage::Ack {
                original_type,
                data,
                version,
            }), Outbound::Peers(ServerMessage::Peer {
                kind,
                version: peer_version,
                client_id,
                ..
            })] => {
                assert_eq!(*original_type, "node:create");
                assert_eq!(*kind, "node:create");
                assert_eq!(version, peer_version);
                assert_eq!(client_id, "c1");
                assert_eq!(data["content"], "hi");
            }
            other => panic!("expected ack + peer broadcast, got {other:?}"),
        }
    }

    #[test]
    fn test_move_updates_parent_and_bumps_room_version() {
        let fx = fixture();
        let actor = Actor::new("u1", "Alice");
        let b = fx
            .store
            .create_node(&fx.map_id, Some(&fx.root_id), "b", 0, "{}", None, &actor)
            .unwrap();
        let c = fx
            .store
            .create_node(&fx.map_id, Some(&b.id), "c", 0, "{}", None, &actor)
            .unwrap();

        let handler = handler_for(&fx, "c1", actor);
        let frames = handler.handle(&format!(
            r#"{{"type":"node:move","data":{{"id":"{}","parent_id":"{}","position":0}}}}"#,
            c.id, fx.root_id
        ));

        match &frames[..] {
            [Outbound::Reply(ServerMessage::Ack { data, .. }), Outbound::Peers(_)] => {
                assert_eq!(data["parent_id"], fx.root_id.as_str());
            }
            other => panic!("expected ack + peer broadcast, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_payload_carries_subtree_ids() {
        let fx = fixture();
        let actor = Actor::new("u1", "Alice");
        let a = fx
            .store
            .create_node(&fx.map_id, Some(&fx.root_id), "a", 0, "{}", None, &actor)
            .unwrap();
        fx.store
            .create_node(&fx.map_id, Some(&a.id), "child", 0, "{}", None, &actor)
            .unwrap();

        let handler = handler_for(&fx, "c1", actor);
        let frames = handler.handle(&format!(
            r#"{{"type":"node:delete","data":{{"id":"{}"}}}}"#,
            a.id
        ));

        match &frames[..] {
            [Outbound::Reply(ServerMessage::Ack { data, .. }), Outbound::Peers(_)] => {
                assert_eq!(data["id"], a.id.as_str());
                assert_eq!(data["deleted_ids"].as_array().unwrap().len(), 2);
            }
            other => panic!("expected ack + peer broadcast, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error_reply() {
        let fx = fixture();
        let handler = handler_for(&fx, "c1", Actor::anonymous());

        let message = expect_error(&handler.handle(r#"{"type":"node:paint","data":{}}"#));
        assert!(message.contains("node:paint"), "got: {message}");
    }

    #[test]
    fn test_store_failure_is_an_error_reply() {
        let fx = fixture();
        let handler = handler_for(&fx, "c1", Actor::anonymous());

        let message = expect_error(&handler.handle(
            r#"{"type":"node:update","data":{"id":"ghost","changes":{"content":"x"}}}"#,
        ));
        assert!(message.contains("ghost"), "got: {message}");
    }

    #[test]
    fn test_lock_conflict_blocks_update_and_names_holder() {
        let fx = fixture();
        fx.locks
            .acquire(&fx.root_id, &fx.map_id, "u2", "Bob")
            .unwrap();

        let handler = handler_for(&fx, "c1", Actor::new("u1", "Alice"));
        let message = expect_error(&handler.handle(&format!(
            r#"{{"type":"node:update","data":{{"id":"{}","changes":{{"content":"x"}}}}}}"#,
            fx.root_id
        )));
        assert!(message.contains("Bob"), "got: {message}");

        // The store was never touched.
        assert_eq!(fx.store.map_meta(&fx.map_id).unwrap().version, 0);
    }

    #[test]
    fn test_lock_broadcasts_to_everyone_and_conflicts_reply() {
        let fx = fixture();
        let alice = handler_for(&fx, "c1", Actor::new("u1", "Alice"));
        let bob = handler_for(&fx, "c2", Actor::new("u2", "Bob"));

        let lock_frame = format!(r#"{{"type":"node:lock","data":{{"id":"{}"}}}}"#, fx.root_id);

        match &alice.handle(&lock_frame)[..] {
            [Outbound::Everyone(ServerMessage::LockEvent { kind, data, client_id })] => {
                assert_eq!(*kind, "node:lock");
                assert_eq!(client_id, "c1");
                assert_eq!(data["username"], "Alice");
            }
            other => panic!("expected lock broadcast, got {other:?}"),
        }

        let message = expect_error(&bob.handle(&lock_frame));
        assert!(message.contains("Alice"), "got: {message}");
    }

    #[test]
    fn test_unlock_by_non_holder_is_silent() {
        let fx = fixture();
        let alice = handler_for(&fx, "c1", Actor::new("u1", "Alice"));
        let bob = handler_for(&fx, "c2", Actor::new("u2", "Bob"));

        let lock_frame = format!(r#"{{"type":"node:lock","data":{{"id":"{}"}}}}"#, fx.root_id);
        let unlock_frame = format!(r#"{{"type":"node:unlock","data":{{"id":"{}"}}}}"#, fx.root_id);

        alice.handle(&lock_frame);
        assert!(bob.handle(&unlock_frame).is_empty());

        // Alice's lock is still live.
        assert_eq!(
            fx.locks.held_by_other(&fx.root_id, "u2").as_deref(),
            Some("Alice")
        );

        match &alice.handle(&unlock_frame)[..] {
            [Outbound::Everyone(ServerMessage::LockEvent { kind, .. })] => {
                assert_eq!(*kind, "node:unlock");
            }
            other => panic!("expected unlock broadcast, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_replies_with_delta() {
        let fx = fixture();
        let actor = Actor::new("u1", "Alice");
        fx.store
            .create_node(&fx.map_id, Some(&fx.root_id), "a", 0, "{}", None, &actor)
            .unwrap();

        let handler = handler_for(&fx, "c1", actor);
        let frames = handler.handle(r#"{"type":"sync","data":{"since_version":0}}"#);
        match &frames[..] {
            [Outbound::Reply(ServerMessage::SyncState { delta })] => {
                assert_eq!(delta.version, 1);
                assert_eq!(delta.changed.len(), 1);
            }
            other => panic!("expected sync reply, got {other:?}"),
        }
    }

    #[test]
    fn test_permission_denied_for_mutations_but_not_sync() {
        let fx = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let room = fx.registry.join(&fx.map_id, "c1", 0, tx);
        let handler = MessageHandler::new(
            "c1".to_string(),
            Actor::new("u1", "Alice"),
            fx.map_id.clone(),
            fx.store.clone(),
            fx.locks.clone(),
            fx.resolver.clone(),
            Arc::new(DenyAll),
            room,
        );

        let message = expect_error(&handler.handle(&format!(
            r#"{{"type":"node:create","data":{{"parent_id":"{}"}}}}"#,
            fx.root_id
        )));
        assert!(message.contains("Permission denied"), "got: {message}");

        // sync is a read against a map the connection already joined.
        let frames = handler.handle(r#"{"type":"sync","data":{}}"#);
        assert!(matches!(
            &frames[..],
            [Outbound::Reply(ServerMessage::SyncState { .. })]
        ));
    }
}
