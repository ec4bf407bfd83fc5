//! WebSocket room relay.
//!
//! ```text
//! Peer A ──┐                          ┌──► Peer B
//!          ├── join-room ──► RoomRegistry ──► RoomGroup (broadcast)
//! Peer C ──┘                          └──► Peer C
//! ```
//!
//! The relay never opens room payloads. It tracks membership, announces
//! `first-in-room`, `new-user` and the roster, forwards sealed broadcasts to
//! everyone else in the room, and answers pings.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{Frame, RoomError, RoomGroup, RoomRegistry};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: String,
    /// Joins beyond this are refused.
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before a slow peer starts losing them.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Connections currently open.
    pub active_connections: u64,
    /// Binary frames received from peers.
    pub total_messages: u64,
    /// Bytes received in those frames.
    pub total_bytes: u64,
    /// Rooms with at least one peer.
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Room(#[from] RoomError),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// A peer's room membership, held by its connection task.
struct Membership {
    peer: PeerInfo,
    room_id: String,
    room: Arc<RoomGroup>,
    receiver: broadcast::Receiver<Frame>,
}

pub struct RoomRelay {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RoomRelay {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Room relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership = None;
        let outcome = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &registry,
            &stats,
            &mut membership,
        )
        .await;

        // Leave the room even when the connection failed.
        if let Some(m) = membership {
            Self::leave(&registry, m).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }
        outcome
    }

    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        registry: &RoomRegistry,
        stats: &RwLock<RelayStats>,
        membership: &mut Option<Membership>,
    ) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        match SyncMessage::decode(&bytes) {
                            Ok(msg) => {
                                Self::on_message(msg, bytes, ws_sender, registry, stats, membership)
                                    .await?;
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        return Ok(());
                    }
                    _ => {}
                },

                frame = async {
                    match membership.as_mut() {
                        Some(m) => m.receiver.recv().await,
                        None => std::future::pending().await,
                    }
                } => match frame {
                    Ok(frame) => {
                        let Some(m) = membership.as_ref() else { continue };
                        if let Ok(msg) = SyncMessage::decode(&frame) {
                            // Don't echo a peer's own broadcasts or its own arrival.
                            let own = msg.peer_id == m.peer.peer_id;
                            if own && (msg.is_broadcast() || msg.msg_type == MessageType::NewUser) {
                                continue;
                            }
                        }
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if let Some(m) = membership.as_ref() {
                            log::warn!("Peer {} lagged by {n} frames", m.peer.peer_id);
                            m.room.record_dropped(n);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn on_message(
        msg: SyncMessage,
        bytes: Vec<u8>,
        ws_sender: &mut WsSink,
        registry: &RoomRegistry,
        stats: &RwLock<RelayStats>,
        membership: &mut Option<Membership>,
    ) -> Result<(), RelayError> {
        match msg.msg_type {
            MessageType::JoinRoom => {
                if let Some(m) = membership.as_ref() {
                    log::warn!(
                        "Peer {} already in room {}, ignoring join",
                        m.peer.peer_id,
                        m.room_id
                    );
                    return Ok(());
                }
                let info = msg
                    .peer_info()
                    .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));
                let joined = registry.join(&msg.room_id, info.clone()).await?;
                stats.write().await.active_rooms = registry.room_count().await;

                if joined.first {
                    let encoded = SyncMessage::first_in_room(msg.room_id.clone()).encode()?;
                    ws_sender.send(Message::Binary(encoded.into())).await?;
                } else {
                    joined
                        .room
                        .broadcast(&SyncMessage::new_user(info.peer_id, msg.room_id.clone()))?;
                }
                let roster = joined.room.peers().await;
                joined
                    .room
                    .broadcast(&SyncMessage::room_user_change(msg.room_id.clone(), &roster)?)?;

                log::info!(
                    "Peer {} ({}) joined room {} ({} peers)",
                    info.name,
                    info.peer_id,
                    msg.room_id,
                    roster.len()
                );
                *membership = Some(Membership {
                    peer: info,
                    room_id: msg.room_id,
                    room: joined.room,
                    receiver: joined.receiver,
                });
            }

            MessageType::Broadcast | MessageType::VolatileBroadcast => {
                let Some(m) = membership.as_ref() else {
                    log::debug!("Dropping broadcast from {} before join", msg.peer_id);
                    return Ok(());
                };
                if msg.room_id != m.room_id || msg.peer_id != m.peer.peer_id {
                    log::warn!(
                        "Dropping broadcast for room {} from {} (member of {} as {})",
                        msg.room_id,
                        msg.peer_id,
                        m.room_id,
                        m.peer.peer_id
                    );
                    return Ok(());
                }
                m.room.broadcast_raw(Arc::new(bytes));
            }

            MessageType::Ping => {
                let peer_id = membership
                    .as_ref()
                    .map_or(Uuid::nil(), |m| m.peer.peer_id);
                let encoded = SyncMessage::pong(peer_id).encode()?;
                ws_sender.send(Message::Binary(encoded.into())).await?;
            }

            other => log::debug!("Unhandled message type: {other:?}"),
        }
        Ok(())
    }

    async fn leave(registry: &RoomRegistry, m: Membership) {
        log::info!("Peer {} left room {}", m.peer.peer_id, m.room_id);
        if let Some(roster) = registry.leave(&m.room_id, &m.peer.peer_id).await {
            match SyncMessage::room_user_change(m.room_id.clone(), &roster) {
                Ok(msg) => {
                    if let Err(e) = m.room.broadcast(&msg) {
                        log::error!("Failed to broadcast roster for room {}: {e}", m.room_id);
                    }
                }
                Err(e) => log::error!("Failed to encode roster for room {}: {e}", m.room_id),
            }
        }
    }
}
