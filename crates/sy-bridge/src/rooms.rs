//! Per-project websocket rooms.
//!
//! A room is the set of live sockets attached to one project. Sockets are
//! modelled as message senders; the transport layer pumps the paired
//! receiver into the actual websocket. A socket belongs to at most one room,
//! dead sockets are removed eagerly, and closing the last socket of a room
//! clears the project's active-agent marker and presence flag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

use sy_core::store::ProjectStore;

pub type SocketId = Uuid;

type Room = HashMap<SocketId, flume::Sender<String>>;

pub struct ProjectRooms {
    rooms: DashMap<Uuid, Arc<Mutex<Room>>>,
    socket_to_project: DashMap<SocketId, Uuid>,
    projects: ProjectStore,
}

impl ProjectRooms {
    pub fn new(projects: ProjectStore) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            socket_to_project: DashMap::new(),
            projects,
        })
    }

    /// Attach a new socket to a project room. Returns the socket id and the
    /// receiver the transport pumps to the wire.
    pub fn connect(&self, project_id: Uuid) -> (SocketId, flume::Receiver<String>) {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = flume::unbounded();

        let room = self
            .rooms
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone();
        let count = {
            let mut room = room.lock().unwrap();
            room.insert(socket_id, tx);
            room.len()
        };
        self.socket_to_project.insert(socket_id, project_id);
        let _ = self.projects.set_socket_presence(project_id, true);

        tracing::info!(project = %project_id, socket = %socket_id, total = count, "websocket connected");
        (socket_id, rx)
    }

    /// Detach a socket, cleaning up its room when it was the last one.
    pub fn disconnect(&self, socket_id: SocketId) {
        let Some((_, project_id)) = self.socket_to_project.remove(&socket_id) else {
            return;
        };

        let mut emptied = false;
        if let Some(room) = self.rooms.get(&project_id) {
            let mut room = room.lock().unwrap();
            room.remove(&socket_id);
            emptied = room.is_empty();
        }

        if emptied {
            self.rooms.remove(&project_id);
            // Last client left: drop presence and the active-agent marker.
            let _ = self.projects.set_socket_presence(project_id, false);
            let _ = self.projects.set_active_agent(project_id, None);
            tracing::info!(project = %project_id, "room closed (no connections)");
        }
    }

    /// Broadcast to every socket in a project room. Best-effort: sockets
    /// that fail to send are dropped from the room without affecting the
    /// rest. Returns the number of successful sends.
    pub fn broadcast(&self, project_id: Uuid, message: &serde_json::Value) -> usize {
        let Some(room) = self.rooms.get(&project_id).map(|r| r.clone()) else {
            return 0;
        };
        let payload = message.to_string();

        let mut dead = Vec::new();
        let sent = {
            let room = room.lock().unwrap();
            let mut sent = 0;
            for (socket_id, tx) in room.iter() {
                if tx.send(payload.clone()).is_ok() {
                    sent += 1;
                } else {
                    dead.push(*socket_id);
                }
            }
            sent
        };

        for socket_id in dead {
            tracing::debug!(socket = %socket_id, "dropping dead socket");
            self.disconnect(socket_id);
        }
        sent
    }

    /// Send to one socket. A failed send disconnects it.
    pub fn send_personal(&self, socket_id: SocketId, message: &serde_json::Value) -> bool {
        let Some(project_id) = self.socket_to_project.get(&socket_id).map(|p| *p) else {
            return false;
        };
        let Some(room) = self.rooms.get(&project_id).map(|r| r.clone()) else {
            return false;
        };

        let sent = {
            let room = room.lock().unwrap();
            room.get(&socket_id)
                .map(|tx| tx.send(message.to_string()).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.disconnect(socket_id);
        }
        sent
    }

    pub fn room_size(&self, project_id: Uuid) -> usize {
        self.rooms
            .get(&project_id)
            .map(|room| room.lock().unwrap().len())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
