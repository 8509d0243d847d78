use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type ConnectionId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// Live client channels per room code.
///
/// The hub only serialises and forwards payloads; it never looks inside them.
/// Sends never wait: a channel that is closed or whose queue is full is
/// dropped from the room and the remaining channels still receive the event.
#[derive(Default)]
pub struct BroadcastHub {
    rooms: DashMap<String, HashMap<ConnectionId, mpsc::Sender<OutboundMessage>>>,
    next_connection_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns `false` when the id was already connected to the room; the
    /// stored channel is replaced either way.
    pub fn connect(
        &self,
        room_code: &str,
        connection_id: ConnectionId,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> bool {
        let mut entry = self.rooms.entry(room_code.to_string()).or_default();
        let fresh = entry.insert(connection_id, sender).is_none();
        debug!(room = room_code, connection_id, fresh, "connection registered");
        fresh
    }

    pub fn disconnect(&self, room_code: &str, connection_id: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room_code) {
            Some(mut entry) => entry.remove(&connection_id).is_some(),
            None => false,
        };
        self.rooms
            .remove_if(room_code, |_, connections| connections.is_empty());
        if removed {
            debug!(room = room_code, connection_id, "connection removed");
        }
        removed
    }

    pub fn connection_count(&self, room_code: &str) -> usize {
        self.rooms
            .get(room_code)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Delivers `event` to every connection of the room and returns how many
    /// channels accepted it.
    pub fn publish<E: Serialize>(&self, room_code: &str, event: &E) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(error) => {
                warn!(room = room_code, %error, "failed to serialise room event");
                return 0;
            }
        };
        self.publish_text(room_code, payload)
    }

    pub fn publish_text(&self, room_code: &str, payload: String) -> usize {
        let mut delivered = 0;
        if let Some(mut entry) = self.rooms.get_mut(room_code) {
            entry.retain(|connection_id, sender| {
                match sender.try_send(OutboundMessage::Text(payload.clone())) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(room = room_code, connection_id, "outbound queue full, dropping connection");
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(room = room_code, connection_id, "pruning closed connection");
                        false
                    }
                }
            });
        }
        self.rooms
            .remove_if(room_code, |_, connections| connections.is_empty());
        delivered
    }

    /// Direct reply to a single connection, e.g. a snapshot or a rejection.
    pub fn send_to<E: Serialize>(
        &self,
        room_code: &str,
        connection_id: ConnectionId,
        message: &E,
    ) -> bool {
        let payload = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(error) => {
                warn!(room = room_code, %error, "failed to serialise direct message");
                return false;
            }
        };
        let sender = self
            .rooms
            .get(room_code)
            .and_then(|entry| entry.get(&connection_id).cloned());
        let Some(sender) = sender else {
            return false;
        };
        if sender.try_send(OutboundMessage::Text(payload)).is_ok() {
            return true;
        }
        self.disconnect(room_code, connection_id);
        false
    }

    /// Sends a close frame to every connection of the room and forgets them.
    pub fn close_room(&self, room_code: &str, reason: &str) -> usize {
        let Some((_, connections)) = self.rooms.remove(room_code) else {
            return 0;
        };
        let count = connections.len();
        for sender in connections.into_values() {
            let _ = sender.try_send(OutboundMessage::Close {
                code: 1000,
                reason: reason.to_string(),
            });
        }
        count
    }
}
