//! # tandem-collab — Room sessions and relay for live canvas editing
//!
//! Keeps every peer's element set converging through a relay that only
//! forwards sealed payloads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐  WebSocket (bincode)  ┌──────────────┐
//! │ CollabSession       │ ◄───────────────────► │ RoomRelay    │
//! │  ConnectionChannel  │  sealed JSON payload  │ RoomRegistry │
//! │  BroadcastScheduler │                       │ RoomGroup    │
//! │  PresenceTracker    │                       │ (fan-out)    │
//! └──────────┬──────────┘                       └──────────────┘
//!            │ SceneHost
//!            ▼
//! ┌─────────────────────┐
//! │ editor / LocalScene │
//! └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Relay envelope, room messages, payload sealing
//! - [`transport`] — Transport seam and the WebSocket implementation
//! - [`channel`] — Room connection state machine and its timers
//! - [`scheduler`] — Scene diffing, full resync and pointer throttling
//! - [`presence`] — Remote collaborators and local idle detection
//! - [`session`] — The per-document orchestrator
//! - [`driver`] — Async task wrapping a session
//! - [`room`] / [`relay`] — Relay server

pub mod channel;
pub mod driver;
pub mod host;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod timer;
pub mod transport;

pub use channel::{ChannelError, ChannelEvent, ConnectionChannel, ConnectionState, RoomLink};
pub use driver::{spawn_session, CollabHandle, DriverError};
pub use host::{LocalScene, Notice, SceneHost};
pub use presence::{Collaborator, IdleDetector, PresenceTracker, PresenceUpdate};
pub use protocol::{
    IdleStatusPayload, MessageType, PayloadCipher, PeerInfo, Plaintext, PointerButton,
    PointerCoords, PointerPayload, PointerTool, ProtocolError, RoomMessage, SyncMessage,
    UserIdleState,
};
pub use relay::{RelayConfig, RelayError, RelayStats, RoomRelay};
pub use room::{RoomError, RoomGroup, RoomRegistry, RoomStats};
pub use scheduler::{BroadcastScheduler, PointerSample};
pub use session::{CollabSession, InitialScene, SessionConfig};
pub use storage::{MemorySnapshotStore, SnapshotStore, StoreError};
pub use timer::{Throttle, Timer};
pub use transport::{Transport, TransportError, TransportEvent, WebSocketTransport};
