use crate::common::models::UserId;
use crate::server::error::{ChatError, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type ClientId = String;

struct LocalSession {
    user_id: UserId,
    sender: mpsc::UnboundedSender<String>,
}

/// Sessions connected to this instance, grouped by room.
#[derive(Clone)]
pub struct SessionHub {
    // room_id -> client_id -> session
    rooms: Arc<Mutex<HashMap<String, HashMap<ClientId, LocalSession>>>>,
    max_clients: usize,
}

impl SessionHub {
    pub fn new(max_clients: usize) -> Self {
        Self { rooms: Arc::new(Mutex::new(HashMap::new())), max_clients }
    }

    pub async fn register(&self, room_id: &str, user_id: UserId) -> Result<(ClientId, mpsc::UnboundedReceiver<String>)> {
        let mut rooms = self.rooms.lock().await;
        let total: usize = rooms.values().map(|r| r.len()).sum();
        if total >= self.max_clients {
            return Err(ChatError::invalid_message(format!("server full ({} sessions)", self.max_clients)));
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.clone(), LocalSession { user_id, sender });
        info!("[HUB] Session {} of user {} joined room {}", client_id, user_id, room_id);
        Ok((client_id, receiver))
    }

    pub async fn unregister(&self, room_id: &str, client_id: &str) -> Option<UserId> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get_mut(room_id)?;
        let session = room.remove(client_id);
        if room.is_empty() {
            rooms.remove(room_id);
        }
        if let Some(session) = &session {
            info!("[HUB] Session {} of user {} left room {}", client_id, session.user_id, room_id);
        }
        session.map(|s| s.user_id)
    }

    /// Push a frame to every local session of the room; returns how many took it.
    pub async fn deliver(&self, room_id: &str, payload: &str) -> usize {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return 0;
        };
        let before = room.len();
        room.retain(|_, session| session.sender.send(payload.to_string()).is_ok());
        let delivered = room.len();
        if delivered < before {
            debug!("[HUB] Dropped {} closed sessions in room {}", before - delivered, room_id);
        }
        if room.is_empty() {
            rooms.remove(room_id);
        }
        delivered
    }

    pub async fn session_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).map(|r| r.len()).unwrap_or(0)
    }
}
