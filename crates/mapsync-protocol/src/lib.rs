//! mapsync wire protocol
//!
//! JSON message envelopes for the per-map real-time channel.
//!
//! ## Inbound
//! ```text
//! {"type": "node:create" | "node:update" | "node:delete" | "node:move"
//!        | "node:lock" | "node:unlock" | "sync",
//!  "data": {...}}
//! ```
//!
//! ## Outbound
//! ```text
//! {"type":"connected", "client_id", "version", "user_id", "locks"}
//! {"type":"ack", "original_type", "data", "version"}      # to the sender
//! {"type":<original_type>, "data", "version", "client_id"} # to peers
//! {"type":"node:lock"|"node:unlock", "data", "client_id"}  # to everyone
//! {"type":"error", "message"}
//! {"type":"peer:disconnect", "client_id"}
//! ```

pub mod error;
pub mod message;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    close_code, ClientMessage, CreatePayload, MovePayload, NodeRefPayload, ServerMessage,
    SyncPayload, UpdatePayload,
};
