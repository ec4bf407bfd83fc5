//! Wire protocol.
//!
//! Two layers travel over one WebSocket:
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬───────────────────────────────┐
//! │ msg_type │ peer_id   │ room_id   │ payload                       │
//! │ 1 byte   │ 16 bytes  │ len + str │ len + bytes                   │
//! └──────────┴───────────┴───────────┴───────────────────────────────┘
//!   bincode envelope, read by the relay
//!
//!   broadcast payload = cipher.seal(JSON { "type": ..., "payload": ... })
//! ```
//!
//! The relay routes on the envelope only. Room messages are JSON so that
//! element attributes the engine does not model survive unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Element, ElementId};
use thiserror::Error;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Envelope message types understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join `room_id`. Payload: [`PeerInfo`].
    JoinRoom = 1,
    /// Relay tells a joiner that nobody else is in the room.
    FirstInRoom = 2,
    /// Relay tells existing members that `peer_id` joined.
    NewUser = 3,
    /// Relay sends the full roster. Payload: `Vec<PeerInfo>`.
    RoomUserChange = 4,
    /// Reliable room broadcast. Payload: sealed [`RoomMessage`].
    Broadcast = 5,
    /// Droppable room broadcast (pointer, idle status).
    VolatileBroadcast = 6,
    /// Liveness check, answered by the other side.
    Ping = 7,
    /// Reply to [`MessageType::Ping`].
    Pong = 8,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// Identifies the peer within a room.
    pub peer_id: Uuid,
    /// Display name, may be empty.
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Relay-facing frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Message type discriminator.
    pub msg_type: MessageType,
    /// Sender, or the subject of a relay notice. Nil for relay-originated
    /// frames that concern nobody in particular.
    pub peer_id: Uuid,
    /// Target room. Empty for ping and pong.
    pub room_id: String,
    /// Opaque to the relay except for join and roster frames.
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.into(),
            payload,
        }
    }

    pub fn join_room(info: &PeerInfo, room_id: impl Into<String>) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::JoinRoom, info.peer_id, room_id, payload))
    }

    /// Relay notice: the joiner is alone.
    pub fn first_in_room(room_id: impl Into<String>) -> Self {
        Self::new(MessageType::FirstInRoom, Uuid::nil(), room_id, Vec::new())
    }

    /// Relay notice: `peer_id` joined.
    pub fn new_user(peer_id: Uuid, room_id: impl Into<String>) -> Self {
        Self::new(MessageType::NewUser, peer_id, room_id, Vec::new())
    }

    pub fn room_user_change(room_id: impl Into<String>, peers: &[PeerInfo]) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(peers, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::RoomUserChange, Uuid::nil(), room_id, payload))
    }

    /// Wrap an already sealed room payload.
    pub fn broadcast(peer_id: Uuid, room_id: impl Into<String>, sealed: Vec<u8>, volatile: bool) -> Self {
        let msg_type = if volatile {
            MessageType::VolatileBroadcast
        } else {
            MessageType::Broadcast
        };
        Self::new(msg_type, peer_id, room_id, sealed)
    }

    /// Create a heartbeat ping.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), Vec::new())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Broadcast | MessageType::VolatileBroadcast
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the joiner identity of a `JoinRoom` frame.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::JoinRoom {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }

    /// Parse the roster of a `RoomUserChange` frame.
    pub fn room_users(&self) -> Result<Vec<PeerInfo>, ProtocolError> {
        if self.msg_type != MessageType::RoomUserChange {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (peers, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(peers)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Cipher error: {0}")]
    Cipher(String),
}

// ───────────────────────────────────────────────────────────────────
// Room messages
// ───────────────────────────────────────────────────────────────────

/// Primary button state at the time of a pointer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    /// Released.
    Up,
    /// Pressed.
    Down,
}

/// How a remote pointer should be drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerTool {
    /// Regular cursor.
    Pointer,
    /// Laser trail.
    Laser,
}

/// Pointer position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerCoords {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<PointerTool>,
}

impl PointerCoords {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, tool: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserIdleState {
    /// Pointer moved recently.
    Active,
    /// No pointer movement for the idle threshold.
    Idle,
    /// Page hidden.
    Away,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerPayload {
    #[serde(alias = "socketID")]
    pub socket_id: Uuid,
    pub pointer: PointerCoords,
    pub button: PointerButton,
    #[serde(default)]
    pub selected_element_ids: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleStatusPayload {
    #[serde(alias = "socketID")]
    pub socket_id: Uuid,
    pub user_state: UserIdleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Application payload carried inside room broadcasts.
///
/// Elements stay as raw JSON values until
/// [`tandem_core::decode_remote_elements`] validates them one by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomMessage {
    SceneInit {
        elements: Vec<Value>,
    },
    SceneUpdate {
        elements: Vec<Value>,
        #[serde(rename = "syncAll", default)]
        sync_all: bool,
    },
    #[serde(alias = "MOUSE_LOCATION")]
    PointerUpdate(PointerPayload),
    IdleStatus(IdleStatusPayload),
    /// Stand-in for any payload that failed to open or parse.
    InvalidResponse,
}

impl RoomMessage {
    pub fn scene_init(elements: &[Element]) -> Self {
        Self::SceneInit {
            elements: to_values(elements),
        }
    }

    pub fn scene_update(elements: &[Element], sync_all: bool) -> Self {
        Self::SceneUpdate {
            elements: to_values(elements),
            sync_all,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SceneInit { .. } => "SCENE_INIT",
            Self::SceneUpdate { .. } => "SCENE_UPDATE",
            Self::PointerUpdate(_) => "POINTER_UPDATE",
            Self::IdleStatus(_) => "IDLE_STATUS",
            Self::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a room payload. Never fails: garbage becomes `InvalidResponse`.
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Undecodable room payload ({} bytes): {e}", bytes.len());
                Self::InvalidResponse
            }
        }
    }

    /// Open a sealed payload and parse it.
    pub fn open(cipher: &dyn PayloadCipher, key: &str, sealed: &[u8]) -> Self {
        match cipher.open(key, sealed) {
            Ok(plain) => Self::decode(&plain),
            Err(e) => {
                log::warn!("Failed to open room payload: {e}");
                Self::InvalidResponse
            }
        }
    }
}

fn to_values(elements: &[Element]) -> Vec<Value> {
    elements
        .iter()
        .filter_map(|e| serde_json::to_value(e).ok())
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Payload cipher
// ───────────────────────────────────────────────────────────────────

/// Seals and opens room payloads with the room key.
pub trait PayloadCipher: Send + Sync {
    fn seal(&self, key: &str, plain: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    fn open(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// Identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl PayloadCipher for Plaintext {
    fn seal(&self, _key: &str, plain: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(plain.to_vec())
    }

    fn open(&self, _key: &str, sealed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(sealed.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_roundtrip() {
        let info = PeerInfo::new("Alice");
        let msg = SyncMessage::join_room(&info, "room-1").unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::JoinRoom);
        assert_eq!(decoded.room_id, "room-1");
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_room_user_change_roundtrip() {
        let peers = vec![PeerInfo::new("Alice"), PeerInfo::new("Bob")];
        let msg = SyncMessage::room_user_change("r", &peers).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_id, Uuid::nil());
        assert_eq!(decoded.room_users().unwrap(), peers);
    }

    #[test]
    fn test_wrong_type_accessors() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        );
        assert!(msg.room_users().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_broadcast_volatility() {
        let peer = Uuid::new_v4();
        assert_eq!(
            SyncMessage::broadcast(peer, "r", vec![1], true).msg_type,
            MessageType::VolatileBroadcast
        );
        let reliable = SyncMessage::broadcast(peer, "r", vec![1], false);
        assert_eq!(reliable.msg_type, MessageType::Broadcast);
        assert!(reliable.is_broadcast());
        assert!(!SyncMessage::first_in_room("r").is_broadcast());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::JoinRoom as u8, 1);
        assert_eq!(MessageType::RoomUserChange as u8, 4);
        assert_eq!(MessageType::Pong as u8, 8);
    }

    #[test]
    fn test_scene_update_json_shape() {
        let msg = RoomMessage::scene_update(&[Element::new("a")], true);
        let json: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "SCENE_UPDATE");
        assert_eq!(json["payload"]["syncAll"], true);
        assert_eq!(json["payload"]["elements"][0]["id"], "a");
    }

    #[test]
    fn test_pointer_update_accepts_legacy_name() {
        let peer = Uuid::new_v4();
        let raw = json!({
            "type": "MOUSE_LOCATION",
            "payload": {
                "socketID": peer,
                "pointer": {"x": 1.5, "y": 2.0, "tool": "laser"},
                "button": "down",
                "selectedElementIds": ["a"],
                "username": "Bob"
            }
        });
        let msg = RoomMessage::decode(raw.to_string().as_bytes());
        match msg {
            RoomMessage::PointerUpdate(p) => {
                assert_eq!(p.socket_id, peer);
                assert_eq!(p.pointer.tool, Some(PointerTool::Laser));
                assert_eq!(p.button, PointerButton::Down);
                assert_eq!(p.selected_element_ids, vec!["a".to_string()]);
            }
            other => panic!("Expected PointerUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_idle_status_shape() {
        let msg = RoomMessage::IdleStatus(IdleStatusPayload {
            socket_id: Uuid::nil(),
            user_state: UserIdleState::Away,
            username: None,
        });
        let json: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "IDLE_STATUS");
        assert_eq!(json["payload"]["userState"], "away");
        assert!(json["payload"].get("username").is_none());
    }

    #[test]
    fn test_garbage_becomes_invalid_response() {
        assert_eq!(RoomMessage::decode(b"not json"), RoomMessage::InvalidResponse);
        assert_eq!(
            RoomMessage::decode(br#"{"type":"NO_SUCH_TYPE","payload":{}}"#),
            RoomMessage::InvalidResponse
        );
        assert_eq!(
            RoomMessage::decode(br#"{"type":"SCENE_INIT","payload":{"elements":7}}"#),
            RoomMessage::InvalidResponse
        );
    }

    #[test]
    fn test_scene_payload_keeps_malformed_elements_raw() {
        let raw = br#"{"type":"SCENE_UPDATE","payload":{"elements":[{"id":"a","version":1},{"nope":true}]}}"#;
        match RoomMessage::decode(raw) {
            RoomMessage::SceneUpdate { elements, sync_all } => {
                assert_eq!(elements.len(), 2);
                assert!(!sync_all);
            }
            other => panic!("Expected SceneUpdate, got {other:?}"),
        }
    }

    struct Failing;

    impl PayloadCipher for Failing {
        fn seal(&self, _key: &str, plain: &[u8]) -> Result<Vec<u8>, ProtocolError> {
            Ok(plain.to_vec())
        }

        fn open(&self, _key: &str, _sealed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
            Err(ProtocolError::Cipher("bad key".into()))
        }
    }

    #[test]
    fn test_open_failure_becomes_invalid_response() {
        let sealed = RoomMessage::scene_init(&[]).encode().unwrap();
        assert_eq!(
            RoomMessage::open(&Failing, "k", &sealed),
            RoomMessage::InvalidResponse
        );
        assert_eq!(
            RoomMessage::open(&Plaintext, "k", &sealed),
            RoomMessage::SceneInit { elements: vec![] }
        );
    }
}
