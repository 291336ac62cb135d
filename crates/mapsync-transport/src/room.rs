//! Rooms - live connection sets, one per map
//!
//! A room exists while at least one connection is joined to its map. The
//! room's broadcast version counter orders messages within a live session;
//! it is seeded from the map's persisted version when the room is created
//! but is not durable and resets when the room is recreated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use mapsync_protocol::ServerMessage;

/// Outbound queue handle for one connection.
pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

/// One map's set of live connections.
pub struct Room {
    map_id: String,
    version: AtomicU64,
    connections: Mutex<HashMap<String, ConnectionSender>>,
}

impl Room {
    fn new(map_id: &str, initial_version: u64) -> Self {
        Self {
            map_id: map_id.to_string(),
            version: AtomicU64::new(initial_version),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    /// Current broadcast version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Bump and return the broadcast version for one mutation event.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn member_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Queue a message to every member except `exclude`. A member whose
    /// queue is gone (its task ended) is silently dropped from the room;
    /// the failure is never surfaced to the sender.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        let mut connections = self.connections.lock();
        let mut dead = Vec::new();
        for (client_id, sender) in connections.iter() {
            if exclude == Some(client_id.as_str()) {
                continue;
            }
            if sender.send(message.clone()).is_err() {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            debug!(room = %self.map_id, client = %client_id, "Dropping dead connection");
            connections.remove(&client_id);
        }
    }
}

/// The registry of live rooms, keyed by map id.
///
/// Supports concurrent join/disconnect from many connection tasks; a room
/// with zero connections is torn down.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection, creating the room on first member.
    /// `current_version` seeds a newly created room's broadcast counter;
    /// an existing room keeps its own.
    pub fn join(
        &self,
        map_id: &str,
        client_id: &str,
        current_version: u64,
        sender: ConnectionSender,
    ) -> Arc<Room> {
        let entry = self
            .rooms
            .entry(map_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(map_id, current_version)));
        let room = entry.value().clone();
        // Holding the entry guard keeps teardown out until the member is in.
        room.connections
            .lock()
            .insert(client_id.to_string(), sender);
        drop(entry);
        debug!(room = %map_id, client = %client_id, "Connection joined");
        room
    }

    pub fn get(&self, map_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(map_id).map(|entry| entry.value().clone())
    }

    /// Remove a connection. Returns true only if it was actually a member,
    /// so callers notify peers exactly once; repeating the call is a
    /// harmless no-op.
    pub fn disconnect(&self, map_id: &str, client_id: &str) -> bool {
        let Some(room) = self.get(map_id) else {
            return false;
        };
        let removed = room.connections.lock().remove(client_id).is_some();
        self.rooms
            .remove_if(map_id, |_, room| room.connections.lock().is_empty());
        if removed {
            debug!(room = %map_id, client = %client_id, "Connection left");
        }
        removed
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
