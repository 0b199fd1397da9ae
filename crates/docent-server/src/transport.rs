//! Room transport seam.
//!
//! The SFU is an external collaborator: from the core's point of view it is
//! a reliable, ordered broadcast of byte payloads to every participant of a
//! room, plus room lifecycle. `LocalRoomHub` is the in-process
//! implementation backing tests and single-box deployments; an SFU-backed
//! transport implements the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("room is gone")]
    RoomGone,
    #[error("transport failure: {0}")]
    Other(String),
}

/// What a freshly created room hands back to the client: where to connect
/// and the capability token that admits it.
#[derive(Debug, Clone)]
pub struct RoomGrant {
    pub url: String,
    pub room_name: String,
    pub token: String,
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn create_room(&self, kiosk_id: &str) -> anyhow::Result<RoomGrant>;

    /// Broadcast a payload to every participant. Payloads published from one
    /// task in sequence arrive in sequence.
    async fn publish(&self, room_name: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn delete_room(&self, room_name: &str) -> anyhow::Result<()>;
}

struct Room {
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

/// In-process reliable-ordered broadcast hub.
pub struct LocalRoomHub {
    url: String,
    rooms: Mutex<HashMap<String, Room>>,
}

impl LocalRoomHub {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Join a room as a participant; messages arrive in publish order.
    pub fn subscribe(&self, room_name: &str) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.get_mut(room_name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        room.subscribers.push(tx);
        Some(rx)
    }

    pub fn room_exists(&self, room_name: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(room_name)
    }
}

#[async_trait]
impl RoomTransport for LocalRoomHub {
    async fn create_room(&self, kiosk_id: &str) -> anyhow::Result<RoomGrant> {
        let room_name = format!("kiosk-{}-{}", kiosk_id, Uuid::new_v4().simple());
        let token = format!("cap_{}", Uuid::new_v4().simple());
        self.rooms.lock().unwrap().insert(
            room_name.clone(),
            Room {
                subscribers: Vec::new(),
            },
        );
        Ok(RoomGrant {
            url: self.url.clone(),
            room_name,
            token,
        })
    }

    async fn publish(&self, room_name: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.get_mut(room_name).ok_or(TransportError::RoomGone)?;
        room.subscribers
            .retain(|subscriber| subscriber.send(payload.to_vec()).is_ok());
        Ok(())
    }

    async fn delete_room(&self, room_name: &str) -> anyhow::Result<()> {
        self.rooms.lock().unwrap().remove(room_name);
        Ok(())
    }
}
