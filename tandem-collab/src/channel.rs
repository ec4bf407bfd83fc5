//! Connection to one collaboration room.
//!
//! The channel turns transport events into room-level [`ChannelEvent`]s,
//! seals outbound room messages, and owns the connection timers: the initial
//! scene timeout and the reconnect delay. The fallback initialization notice
//! is emitted at most once per opened session, whichever of connect error,
//! init timeout or `first-in-room` comes first.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{
    MessageType, PayloadCipher, PeerInfo, Plaintext, ProtocolError, RoomMessage, SyncMessage,
};
use crate::timer::{earliest, Timer};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Room identity. The key is only ever handed to the payload cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLink {
    pub room_id: String,
    pub room_key: String,
}

impl RoomLink {
    pub fn new(room_id: impl Into<String>, room_key: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            room_key: room_key.into(),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Joining,
    Active,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Between `open` and `close`.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }
}

/// Room-level events produced by the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport is up and `join-room` went out. `resumed` is set when the
    /// session had already been initialized before the drop.
    Connected { resumed: bool },
    Disconnected,
    /// Initialize without a peer-provided scene. Emitted at most once.
    FallbackInit,
    /// Someone joined and needs the current scene.
    NewUser(Uuid),
    RoomUsers(Vec<PeerInfo>),
    Message { from: Uuid, message: RoomMessage },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel is not connected (state {0:?})")]
    NotConnected(ConnectionState),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct ConnectionChannel<T> {
    transport: T,
    cipher: Box<dyn PayloadCipher>,
    local: PeerInfo,
    link: RoomLink,
    state: ConnectionState,
    initialized: bool,
    fallback_fired: bool,
    init_timer: Timer,
    reconnect_timer: Timer,
    init_timeout: Duration,
    reconnect_delay: Duration,
}

impl<T: Transport> ConnectionChannel<T> {
    pub fn new(
        transport: T,
        local: PeerInfo,
        link: RoomLink,
        init_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            transport,
            cipher: Box::new(Plaintext),
            local,
            link,
            state: ConnectionState::Idle,
            initialized: false,
            fallback_fired: false,
            init_timer: Timer::new(),
            reconnect_timer: Timer::new(),
            init_timeout,
            reconnect_delay,
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn PayloadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn room(&self) -> &RoomLink {
        &self.link
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Begin a fresh session: connect and arm the initial scene timeout.
    pub fn open(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.initialized = false;
        self.fallback_fired = false;
        self.reconnect_timer.cancel();
        self.init_timer.arm(now, self.init_timeout);
        log::info!(
            "Opening room {} as {}",
            self.link.room_id,
            self.local.peer_id
        );
        self.transport.open();
    }

    /// The session has a scene: stop waiting for one.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
        self.init_timer.cancel();
        if self.state == ConnectionState::Joining {
            self.state = ConnectionState::Active;
        }
    }

    pub fn close(&mut self) {
        if !self.state.is_live() {
            return;
        }
        self.init_timer.cancel();
        self.reconnect_timer.cancel();
        self.transport.close();
        self.state = ConnectionState::Closed;
        log::info!("Closed room {}", self.link.room_id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.state.is_live() {
            return None;
        }
        earliest([self.init_timer.deadline(), self.reconnect_timer.deadline()])
    }

    /// Fire due timers.
    pub fn poll(&mut self, now: Instant) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if !self.state.is_live() {
            return events;
        }
        if self.init_timer.fire_if_due(now) {
            log::warn!(
                "No initial scene for room {} within {:?}",
                self.link.room_id,
                self.init_timeout
            );
            self.fire_fallback(&mut events);
        }
        if self.reconnect_timer.fire_if_due(now) {
            log::info!("Reconnecting to room {}", self.link.room_id);
            self.transport.open();
        }
        events
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if !self.state.is_live() {
            log::debug!("Ignoring transport event on closed channel: {event:?}");
            return events;
        }
        match event {
            TransportEvent::Connected => self.on_connected(&mut events),
            TransportEvent::ConnectError(reason) => {
                log::error!("Connect to room {} failed: {reason}", self.link.room_id);
                self.fire_fallback(&mut events);
                self.schedule_reconnect(now);
            }
            TransportEvent::Disconnected => {
                if self.state != ConnectionState::Reconnecting {
                    log::warn!("Lost connection to room {}", self.link.room_id);
                    self.schedule_reconnect(now);
                    events.push(ChannelEvent::Disconnected);
                }
            }
            TransportEvent::Frame(bytes) => self.on_frame(&bytes, &mut events),
        }
        events
    }

    /// Seal and send a room message to every other peer.
    pub fn send(&mut self, message: &RoomMessage, volatile: bool) -> Result<(), ChannelError> {
        if !matches!(self.state, ConnectionState::Joining | ConnectionState::Active) {
            return Err(ChannelError::NotConnected(self.state));
        }
        let plain = message.encode()?;
        let sealed = self.cipher.seal(&self.link.room_key, &plain)?;
        let frame = SyncMessage::broadcast(self.local.peer_id, self.link.room_id.clone(), sealed, volatile)
            .encode()?;
        self.transport.send(frame)?;
        if volatile {
            log::trace!("Sent volatile {}", message.kind());
        } else {
            log::debug!("Sent {} to room {}", message.kind(), self.link.room_id);
        }
        Ok(())
    }

    fn on_connected(&mut self, events: &mut Vec<ChannelEvent>) {
        self.reconnect_timer.cancel();
        let join = SyncMessage::join_room(&self.local, self.link.room_id.clone())
            .and_then(|msg| msg.encode());
        match join {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame) {
                    log::error!("Failed to send join-room: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode join-room: {e}"),
        }
        let resumed = self.initialized;
        self.state = if resumed {
            ConnectionState::Active
        } else {
            ConnectionState::Joining
        };
        log::info!(
            "Connected to room {} ({})",
            self.link.room_id,
            if resumed { "resumed" } else { "joining" }
        );
        events.push(ChannelEvent::Connected { resumed });
    }

    fn on_frame(&mut self, bytes: &[u8], events: &mut Vec<ChannelEvent>) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        if msg.peer_id == self.local.peer_id && msg.is_broadcast() {
            return;
        }
        match msg.msg_type {
            MessageType::FirstInRoom => {
                log::info!("First in room {}", self.link.room_id);
                self.fire_fallback(events);
            }
            MessageType::NewUser => {
                if msg.peer_id != self.local.peer_id {
                    events.push(ChannelEvent::NewUser(msg.peer_id));
                }
            }
            MessageType::RoomUserChange => match msg.room_users() {
                Ok(peers) => events.push(ChannelEvent::RoomUsers(peers)),
                Err(e) => log::warn!("Dropping malformed roster: {e}"),
            },
            MessageType::Broadcast | MessageType::VolatileBroadcast => {
                match RoomMessage::open(self.cipher.as_ref(), &self.link.room_key, &msg.payload) {
                    RoomMessage::InvalidResponse => {
                        log::warn!("Dropping invalid payload from {}", msg.peer_id);
                    }
                    message => events.push(ChannelEvent::Message {
                        from: msg.peer_id,
                        message,
                    }),
                }
            }
            MessageType::Ping => {
                let pong = SyncMessage::pong(self.local.peer_id).encode();
                if let Ok(frame) = pong {
                    let _ = self.transport.send(frame);
                }
            }
            MessageType::Pong => log::trace!("Pong from relay"),
            MessageType::JoinRoom => {
                log::debug!("Ignoring join-room frame from {}", msg.peer_id);
            }
        }
    }

    fn fire_fallback(&mut self, events: &mut Vec<ChannelEvent>) {
        if self.initialized || self.fallback_fired {
            return;
        }
        self.fallback_fired = true;
        self.init_timer.cancel();
        events.push(ChannelEvent::FallbackInit);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.state = ConnectionState::Reconnecting;
        self.transport.close();
        self.reconnect_timer.arm(now, self.reconnect_delay);
    }
}
