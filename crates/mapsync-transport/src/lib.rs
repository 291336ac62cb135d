//! mapsync transport layer
//!
//! Real-time channel between maps and their connected clients:
//! - WebSocket: one channel per map at `/ws/{map_id}`
//! - Rooms: live connection sets with exclude-sender broadcast
//! - Handler: per-connection message dispatch with permission re-checks
//!   and the advisory lock gate
//! - Auth: the interface-only authentication/permission collaborators

pub mod auth;
pub mod handler;
pub mod room;
pub mod websocket;

pub use auth::{AccessLevel, AccessPolicy, AllowAll, Authenticator};
pub use handler::{MessageHandler, Outbound};
pub use room::{Room, RoomRegistry};
pub use websocket::WebSocketServer;
