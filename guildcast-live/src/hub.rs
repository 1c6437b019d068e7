//! In-memory fan-out of signaling events to connected browsers.
//!
//! Each WebSocket connection registers one sender; rooms are groups of
//! connection ids. A connection may be in any number of rooms at once
//! (a broadcaster sits in its own room while previewing another, a
//! viewer can watch and lurk), so membership lives per room rather
//! than per connection.

use dashmap::DashMap;
use guildcast_core::models::{RoomId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::ServerEvent;
use crate::registry::ConnectionId;

/// One connected browser tab.
#[derive(Debug, Clone)]
struct Subscriber {
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Hub routing server events to connections, per room or globally.
#[derive(Default)]
pub struct StreamHub {
    /// connection id -> subscriber (every connection, room member or not)
    connections: DashMap<ConnectionId, Subscriber>,
    /// room id -> member connection ids
    rooms: DashMap<RoomId, Vec<ConnectionId>>,
}

impl StreamHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns the receiving half the socket
    /// writer drains.
    pub fn connect(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id.clone(),
            Subscriber {
                user_id: user_id.clone(),
                sender: tx,
            },
        );

        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            "Signaling connection registered"
        );

        rx
    }

    /// Drop a connection and its room memberships.
    pub fn disconnect(&self, connection_id: &str) {
        let removed = self.connections.remove(connection_id);

        let member_of: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().iter().any(|c| c == connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        for room_id in member_of {
            self.leave(&room_id, connection_id);
        }

        if let Some((_, subscriber)) = removed {
            info!(
                connection_id = %connection_id,
                user_id = %subscriber.user_id,
                "Signaling connection removed"
            );
        }
    }

    /// Add a connection to a room's fan-out group. Idempotent: a
    /// connection appears at most once per room.
    pub fn join(&self, room_id: RoomId, connection_id: &str) {
        let mut members = self.rooms.entry(room_id.clone()).or_default();
        if !members.iter().any(|c| c == connection_id) {
            members.push(connection_id.to_string());
            debug!(room_id = %room_id, connection_id = %connection_id, "Joined room group");
        }
    }

    /// Remove a connection from a room's group; unknown memberships
    /// are a no-op.
    pub fn leave(&self, room_id: &RoomId, connection_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room_id) {
            members.retain(|c| c != connection_id);
            if members.is_empty() {
                drop(members); // release the guard before removing the entry
                self.rooms.remove(room_id);
                debug!(room_id = %room_id, "Room group empty, removed");
            }
        }
    }

    /// Whether a connection is currently in a room's group.
    #[must_use]
    pub fn in_room(&self, room_id: &RoomId, connection_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.iter().any(|c| c == connection_id))
    }

    /// Send one event to one connection.
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        let Some(subscriber) = self.connections.get(connection_id) else {
            return false;
        };
        if subscriber.sender.send(event).is_err() {
            drop(subscriber);
            self.disconnect(connection_id);
            return false;
        }
        true
    }

    /// Broadcast an event to every connection in a room. Dead senders
    /// are pruned. Returns the number of connections reached.
    pub fn broadcast(&self, room_id: &RoomId, event: &ServerEvent) -> usize {
        let members: Vec<ConnectionId> = self
            .rooms
            .get(room_id)
            .map(|m| m.clone())
            .unwrap_or_default();

        let mut sent = 0;
        let mut dead = Vec::new();
        for connection_id in members {
            match self.connections.get(&connection_id) {
                Some(subscriber) => {
                    if subscriber.sender.send(event.clone()).is_ok() {
                        sent += 1;
                    } else {
                        dead.push(connection_id);
                    }
                }
                None => dead.push(connection_id),
            }
        }

        for connection_id in dead {
            warn!(
                room_id = %room_id,
                connection_id = %connection_id,
                "Pruning dead room member"
            );
            self.disconnect(&connection_id);
        }

        if sent > 0 {
            debug!(
                room_id = %room_id,
                sent,
                event_type = event.event_type(),
                "Room broadcast complete"
            );
        }

        sent
    }

    /// Broadcast an event to every connection (global notifications
    /// such as `new-stream`).
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let mut sent = 0;
        let mut dead = Vec::new();
        for entry in &self.connections {
            if entry.value().sender.send(event.clone()).is_ok() {
                sent += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }

        for connection_id in dead {
            self.disconnect(&connection_id);
        }

        sent
    }

    /// Number of connections in a room's group.
    #[must_use]
    pub fn room_size(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |m| m.len())
    }

    /// Total registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
