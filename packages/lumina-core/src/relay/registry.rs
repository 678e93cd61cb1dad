//! In-process room registry: session → role-tagged connection sets.
//!
//! A `Room` is exclusively owned by this process; the same session may have
//! rooms on several relay instances at once, stitched together by the
//! cross-process channel. Membership changes are synchronous map edits,
//! never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::{Role, ServerMessage};

/// Transport-agnostic outbound item. The WebSocket endpoint converts these
/// into actual socket messages; tests consume them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame, forwarded or server-originated.
    Frame(String),
    /// Close the connection with the given code.
    Close { code: u16, reason: String },
}

/// One live client connection, owned by exactly one room.
///
/// `tx` feeds the connection's writer task; sends never block, so fan-out to
/// a room is atomic with respect to membership.
pub struct ClientConnection {
    pub id: u64,
    pub role: Role,
    pub session_id: String,
    pub kiosk: bool,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    /// Queues a raw text frame. Errors (client gone) are ignored; the close
    /// handler will detach the connection shortly.
    pub fn send_raw(&self, payload: &str) {
        let _ = self.tx.send(Outbound::Frame(payload.to_string()));
    }

    /// Queues a server-originated message.
    pub fn send_message(&self, msg: &ServerMessage) {
        let _ = self.tx.send(Outbound::Frame(msg.to_json()));
    }

    /// Queues a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("kiosk", &self.kiosk)
            .finish()
    }
}

#[derive(Default)]
struct Room {
    members: HashMap<u64, Arc<ClientConnection>>,
}

/// Process-local registry of rooms and their reap timers.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    reap_timers: DashMap<String, JoinHandle<()>>,
    next_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            reap_timers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a connection bound to a session.
    pub fn make_connection(
        &self,
        role: Role,
        session_id: &str,
        kiosk: bool,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<ClientConnection> {
        Arc::new(ClientConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            role,
            session_id: session_id.to_string(),
            kiosk,
            tx,
        })
    }

    /// Inserts a connection into its room and cancels any pending reap.
    pub fn attach(&self, conn: &Arc<ClientConnection>) {
        self.cancel_reap(&conn.session_id);
        self.rooms
            .entry(conn.session_id.clone())
            .or_default()
            .members
            .insert(conn.id, Arc::clone(conn));
        log::debug!(
            "[Rooms] {} {} joined {} ({} members)",
            conn.role.as_str(),
            conn.id,
            conn.session_id,
            self.member_count(&conn.session_id)
        );
    }

    /// Removes a connection. Returns true if the room is now empty (the
    /// caller schedules the reap).
    pub fn detach(&self, conn: &ClientConnection) -> bool {
        let Some(mut room) = self.rooms.get_mut(&conn.session_id) else {
            return false;
        };
        room.members.remove(&conn.id);
        room.members.is_empty()
    }

    /// Live connections of one role in a session's room.
    pub fn by_role(&self, session_id: &str, role: Role) -> Vec<Arc<ClientConnection>> {
        self.rooms
            .get(session_id)
            .map(|room| {
                room.members
                    .values()
                    .filter(|c| c.role == role)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_by_role(&self, session_id: &str, role: Role) -> usize {
        self.rooms
            .get(session_id)
            .map(|room| room.members.values().filter(|c| c.role == role).count())
            .unwrap_or(0)
    }

    pub fn member_count(&self, session_id: &str) -> usize {
        self.rooms
            .get(session_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// Whether the room exists with zero members (detached but not reaped).
    pub fn is_empty_room(&self, session_id: &str) -> bool {
        self.rooms
            .get(session_id)
            .map(|room| room.members.is_empty())
            .unwrap_or(true)
    }

    /// Drops the room outright. Called by the reap timer after re-checking
    /// emptiness.
    pub fn remove_room(&self, session_id: &str) {
        self.rooms.remove(session_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reap Timers
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancels a pending reap, if any.
    pub fn cancel_reap(&self, session_id: &str) {
        if let Some((_, handle)) = self.reap_timers.remove(session_id) {
            handle.abort();
        }
    }

    /// Stores a reap timer handle unless one is already pending (the second
    /// scheduling request is a no-op; its task is aborted here).
    pub fn store_reap(&self, session_id: &str, handle: JoinHandle<()>) -> bool {
        match self.reap_timers.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.abort();
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    /// Whether a reap timer is pending for the session.
    pub fn reap_pending(&self, session_id: &str) -> bool {
        self.reap_timers.contains_key(session_id)
    }

    /// Removes the fired timer's own handle.
    pub fn clear_reap_handle(&self, session_id: &str) {
        self.reap_timers.remove(session_id);
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
