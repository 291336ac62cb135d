//! WebSocket transport - one channel per map
//!
//! Clients connect to `/ws/{map_id}` (optionally `?token=...`). The
//! handshake is followed by auth and permission checks; failures close
//! the socket with a distinguishing code before any message exchange.
//! Each accepted connection gets one task running a select loop over its
//! socket and its room queue.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};
use uuid::Uuid;

use mapsync_core::{LockManager, NodeStore, SyncResolver};
use mapsync_protocol::{close_code, ServerMessage};

use crate::auth::{AccessLevel, AccessPolicy, Authenticator, AllowAll};
use crate::handler::{MessageHandler, Outbound};
use crate::room::RoomRegistry;

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
struct ConnectionContext {
    store: Arc<NodeStore>,
    locks: Arc<LockManager>,
    resolver: Arc<SyncResolver>,
    registry: Arc<RoomRegistry>,
    auth: Arc<dyn Authenticator>,
    policy: Arc<dyn AccessPolicy>,
}

/// WebSocket server for mapsync.
pub struct WebSocketServer {
    ctx: ConnectionContext,
    addr: SocketAddr,
}

impl WebSocketServer {
    pub fn new(
        store: Arc<NodeStore>,
        locks: Arc<LockManager>,
        resolver: Arc<SyncResolver>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            ctx: ConnectionContext {
                store,
                locks,
                resolver,
                registry: Arc::new(RoomRegistry::new()),
                auth: Arc::new(AllowAll),
                policy: Arc::new(AllowAll),
            },
            addr,
        }
    }

    /// Replace the credential resolver.
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.ctx.auth = auth;
        self
    }

    /// Replace the permission policy.
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.ctx.policy = policy;
        self
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "mapsync WebSocket server listening");
        Self::accept_loop(listener, self.ctx.clone()).await;
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, ctx: ConnectionContext) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, ctx).await {
                            error!(peer = %peer_addr, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        ctx: ConnectionContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut target = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            target = Some(req.uri().clone());
            Ok(resp)
        })
        .await?;

        let Some((map_id, token)) = target.as_ref().and_then(parse_target) else {
            return close_with(ws, close_code::MAP_NOT_FOUND, "unknown path").await;
        };

        let Some(actor) = ctx.auth.authenticate(token.as_deref()) else {
            return close_with(ws, close_code::AUTH_REQUIRED, "authentication required").await;
        };
        if !ctx
            .policy
            .can_access(actor.user_id.as_deref(), &map_id, AccessLevel::View)
        {
            return close_with(ws, close_code::ACCESS_DENIED, "access denied").await;
        }
        let Ok(meta) = ctx.store.map_meta(&map_id) else {
            return close_with(ws, close_code::MAP_NOT_FOUND, "map not found").await;
        };

        let client_id = Uuid::new_v4().to_string();
        let (sender, mut queue) = mpsc::unbounded_channel();
        let room = ctx
            .registry
            .join(&map_id, &client_id, meta.version, sender);

        info!(client = %client_id, map = %map_id, "WebSocket client connected");

        let (mut write, mut read) = ws.split();

        // Join reply: identity, current room version and live locks, so
        // the client can initialize without a separate query.
        let connected = ServerMessage::Connected {
            client_id: client_id.clone(),
            version: room.version(),
            user_id: actor.user_id.clone(),
            locks: ctx.locks.locks_for_map(&map_id),
        };
        write.send(Message::Text(connected.encode())).await?;

        let handler = MessageHandler::new(
            client_id.clone(),
            actor,
            map_id.clone(),
            ctx.store.clone(),
            ctx.locks.clone(),
            ctx.resolver.clone(),
            ctx.policy.clone(),
            room.clone(),
        );

        loop {
            tokio::select! {
                // Inbound frames from this client.
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for outbound in handler.handle(&text) {
                                match outbound {
                                    Outbound::Reply(message) => {
                                        write.send(Message::Text(message.encode())).await?;
                                    }
                                    Outbound::Peers(message) => {
                                        room.broadcast(&message, Some(&client_id));
                                    }
                                    Outbound::Everyone(message) => {
                                        room.broadcast(&message, None);
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(client = %client_id, "WebSocket client disconnected");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ignore other frame types.
                        }
                        Some(Err(e)) => {
                            error!(client = %client_id, error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }

                // Frames queued by peers (broadcasts) for this client.
                queued = queue.recv() => {
                    match queued {
                        Some(message) => {
                            if let Err(e) = write.send(Message::Text(message.encode())).await {
                                error!(client = %client_id, error = %e, "WebSocket write error");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Graceful or abrupt, teardown is the same; a repeat disconnect
        // for an already-removed connection notifies nobody.
        if ctx.registry.disconnect(&map_id, &client_id) {
            if let Some(room) = ctx.registry.get(&map_id) {
                room.broadcast(
                    &ServerMessage::PeerDisconnect {
                        client_id: client_id.clone(),
                    },
                    None,
                );
            }
        }
        debug!(client = %client_id, map = %map_id, "Connection torn down");
        Ok(())
    }
}

/// Extract `(map_id, token)` from a `/ws/{map_id}?token=...` request URI.
fn parse_target(uri: &Uri) -> Option<(String, Option<String>)> {
    let map_id = uri.path().strip_prefix("/ws/")?.trim_end_matches('/');
    if map_id.is_empty() {
        return None;
    }
    let token = uri.query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
    });
    Some((map_id.to_string(), token))
}

async fn close_with(
    mut ws: WebSocketStream<TcpStream>,
    code: u16,
    reason: &'static str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Library(code),
        reason: reason.into(),
    })))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapsync_core::{Actor, Gateway};
    use mapsync_storage::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (SocketAddr, Arc<NodeStore>) {
        let gateway: Arc<dyn Gateway> = Arc::new(MemoryStore::new());
        let store = Arc::new(NodeStore::new(gateway.clone()));
        let locks = Arc::new(LockManager::new());
        let resolver = Arc::new(SyncResolver::new(gateway, locks.clone()));
        let server = WebSocketServer::new(
            store.clone(),
            locks,
            resolver,
            "127.0.0.1:0".parse().unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(WebSocketServer::accept_loop(listener, server.ctx.clone()));
        (addr, store)
    }

    async fn connect(addr: SocketAddr, map_id: &str) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{addr}/ws/{map_id}"))
            .await
            .unwrap();
        ws
    }

    async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_map_closes_with_code() {
        let (addr, _store) = start_server().await;
        let mut ws = connect(addr, "no-such-map").await;

        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Library(close_code::MAP_NOT_FOUND));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_is_acked_and_broadcast() {
        let (addr, store) = start_server().await;
        let actor = Actor::new("u1", "Alice");

        // A(root) -> B -> C
        let (map, a) = store.create_map("plan").unwrap();
        let b = store
            .create_node(&map.id, Some(&a.id), "b", 0, "{}", None, &actor)
            .unwrap();
        let c = store
            .create_node(&map.id, Some(&b.id), "c", 0, "{}", None, &actor)
            .unwrap();

        let mut client1 = connect(addr, &map.id).await;
        let connected1 = recv_json(&mut client1).await;
        assert_eq!(connected1["type"], "connected");
        // Room version mirrors the persisted map version (two creates).
        assert_eq!(connected1["version"], 2);
        let client1_id = connected1["client_id"].as_str().unwrap().to_string();

        let mut client2 = connect(addr, &map.id).await;
        let connected2 = recv_json(&mut client2).await;
        assert_eq!(connected2["type"], "connected");

        client1
            .send(Message::Text(
                serde_json::json!({
                    "type": "node:move",
                    "data": { "id": c.id, "parent_id": a.id, "position": 0 },
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let ack = recv_json(&mut client1).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["original_type"], "node:move");
        assert_eq!(ack["version"], 3);
        assert_eq!(ack["data"]["parent_id"], a.id.as_str());

        let broadcast = recv_json(&mut client2).await;
        assert_eq!(broadcast["type"], "node:move");
        assert_eq!(broadcast["version"], 3);
        assert_eq!(broadcast["client_id"], client1_id.as_str());
        assert_eq!(broadcast["data"]["parent_id"], a.id.as_str());

        // The persisted version moved by exactly one.
        assert_eq!(store.map_meta(&map.id).unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_bad_message_keeps_connection_open() {
        let (addr, store) = start_server().await;
        let (map, _root) = store.create_map("plan").unwrap();

        let mut ws = connect(addr, &map.id).await;
        recv_json(&mut ws).await; // connected

        ws.send(Message::Text(
            r#"{"type":"node:paint","data":{}}"#.to_string(),
        ))
        .await
        .unwrap();
        let err = recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");

        // Still alive: a sync request round-trips.
        ws.send(Message::Text(
            r#"{"type":"sync","data":{"since_version":0}}"#.to_string(),
        ))
        .await
        .unwrap();
        let sync = recv_json(&mut ws).await;
        assert_eq!(sync["type"], "sync");
        assert_eq!(sync["data"]["version"], 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_notice() {
        let (addr, store) = start_server().await;
        let (map, _root) = store.create_map("plan").unwrap();

        let mut client1 = connect(addr, &map.id).await;
        recv_json(&mut client1).await;

        let mut client2 = connect(addr, &map.id).await;
        let connected2 = recv_json(&mut client2).await;
        let client2_id = connected2["client_id"].as_str().unwrap().to_string();

        client2.close(None).await.unwrap();

        let notice = recv_json(&mut client1).await;
        assert_eq!(notice["type"], "peer:disconnect");
        assert_eq!(notice["client_id"], client2_id.as_str());
    }
}
