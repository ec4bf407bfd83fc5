//! Relay-side rooms: fan-out of sealed frames to every connected peer.
//!
//! Each room owns one tokio broadcast channel. Frames are encoded once and
//! shared as `Arc<Vec<u8>>`; a peer that falls more than `capacity` frames
//! behind loses the oldest ones. Skipping the sender's own frames is the
//! connection task's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Room {room_id} is full ({max_peers} peers)")]
    Full { room_id: String, max_peers: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    /// Frames handed to the broadcast channel.
    pub messages_sent: u64,
    /// Frames a lagging receiver skipped.
    pub messages_dropped: u64,
    /// Peers currently joined.
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicRoomStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One room's peers and broadcast channel.
pub struct RoomGroup {
    sender: broadcast::Sender<Frame>,
    /// Peers in join order.
    peers: RwLock<Vec<PeerInfo>>,
    stats: AtomicRoomStats,
}

impl RoomGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(Vec::new()),
            stats: AtomicRoomStats::default(),
        }
    }

    /// Add a peer and subscribe it. Rejoining with a known id replaces the
    /// old entry.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.retain(|p| p.peer_id != info.peer_id);
        peers.push(info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        let index = peers.iter().position(|p| &p.peer_id == peer_id)?;
        Some(peers.remove(index))
    }

    /// Encode and send to every subscriber, sender included.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Send pre-encoded bytes. Lock-free.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.clone()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.iter().any(|p| &p.peer_id == peer_id)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }
}

/// Result of joining a room.
pub struct Joined {
    pub room: Arc<RoomGroup>,
    pub receiver: broadcast::Receiver<Frame>,
    /// Nobody else was in the room.
    pub first: bool,
}

/// Room id → room. Joins and leaves hold the registry write lock so a room
/// is never removed while someone is joining it.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    pub async fn join(&self, room_id: &str, info: PeerInfo) -> Result<Joined, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(RoomGroup::new(self.capacity)))
            .clone();

        let count = room.peer_count().await;
        let rejoin = room.has_peer(&info.peer_id).await;
        if !rejoin && count >= self.max_peers {
            if count == 0 {
                rooms.remove(room_id);
            }
            return Err(RoomError::Full {
                room_id: room_id.to_string(),
                max_peers: self.max_peers,
            });
        }
        let first = count == 0 || (rejoin && count == 1);
        let receiver = room.add_peer(info).await;
        Ok(Joined {
            room,
            receiver,
            first,
        })
    }

    /// Remove a peer. Returns the remaining roster, or `None` if the room
    /// is gone (unknown, or removed because it became empty).
    pub async fn leave(&self, room_id: &str, peer_id: &Uuid) -> Option<Vec<PeerInfo>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(room_id)?.clone();
        room.remove_peer(peer_id).await;
        let remaining = room.peers().await;
        if remaining.is_empty() {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
            return None;
        }
        Some(remaining)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
