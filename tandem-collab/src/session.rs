//! Collaboration session orchestrator.
//!
//! A [`CollabSession`] ties one room connection to one document. It is a
//! plain state machine: every input carries `now`, every timer is reported
//! through [`CollabSession::next_deadline`], and all outbound traffic goes
//! through the owned [`ConnectionChannel`]. The async wrapper lives in
//! [`crate::driver`].
//!
//! ```text
//!  Idle ──start──► Connecting ──connect──► Joining ──SCENE_INIT / fallback──► Active
//!                      │                      │                                  │
//!                      └── connect error ─────┴──────► Reconnecting ◄─ drop ─────┘
//!                                                          │ reconnect
//!                                                          ▼
//!                                               Joining (not yet initialized)
//!                                               Active  (initialized: full sync)
//!
//!  any live state ──stop / unload──► Closed
//! ```

use serde_json::Value;
use std::time::Duration;
use tandem_core::{decode_remote_elements, demote_saved_files, reconcile, scene_version, Element};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::{ChannelEvent, ConnectionChannel, ConnectionState, RoomLink};
use crate::host::{Notice, SceneHost};
use crate::presence::{IdleDetector, PresenceTracker, PresenceUpdate};
use crate::protocol::{
    IdleStatusPayload, PayloadCipher, PeerInfo, PointerButton, PointerCoords, PointerPayload,
    RoomMessage, UserIdleState,
};
use crate::scheduler::{BroadcastScheduler, PointerSample};
use crate::storage::SnapshotStore;
use crate::timer::earliest;
use crate::transport::{Transport, TransportEvent};

/// Session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a peer to hand over the scene.
    pub init_timeout: Duration,
    /// Trailing interval of the full-scene resync.
    pub full_sync_interval: Duration,
    /// Pointer broadcast interval (leading + trailing).
    pub pointer_interval: Duration,
    /// Inactivity before the local user is reported idle.
    pub idle_threshold: Duration,
    /// Delay before reopening a dropped connection.
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_millis(5_000),
            full_sync_interval: Duration::from_millis(20_000),
            pointer_interval: Duration::from_millis(33),
            idle_threshold: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Scene handed over when the session initializes, if any.
pub type InitialScene = Option<Vec<Element>>;

pub struct CollabSession<H, T> {
    host: H,
    channel: ConnectionChannel<T>,
    scheduler: BroadcastScheduler,
    presence: PresenceTracker,
    idle: IdleDetector,
    store: Option<Box<dyn SnapshotStore>>,
    username: Option<String>,
    init_tx: Option<oneshot::Sender<InitialScene>>,
}

impl<H: SceneHost, T: Transport> CollabSession<H, T> {
    pub fn new(host: H, transport: T, local: PeerInfo, room: RoomLink, config: SessionConfig) -> Self {
        let local_id = local.peer_id;
        let username = Some(local.name.clone()).filter(|n| !n.is_empty());
        Self {
            host,
            channel: ConnectionChannel::new(
                transport,
                local,
                room,
                config.init_timeout,
                config.reconnect_delay,
            ),
            scheduler: BroadcastScheduler::new(config.full_sync_interval, config.pointer_interval),
            presence: PresenceTracker::new(local_id),
            idle: IdleDetector::new(config.idle_threshold),
            store: None,
            username,
            init_tx: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn with_cipher(mut self, cipher: Box<dyn PayloadCipher>) -> Self {
        self.channel = self.channel.with_cipher(cipher);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.channel.is_initialized()
    }

    pub fn local_peer(&self) -> &PeerInfo {
        self.channel.local_peer()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn idle_state(&self) -> UserIdleState {
        self.idle.state()
    }

    pub fn marker(&self) -> Option<tandem_core::SceneVersion> {
        self.scheduler.marker()
    }

    pub fn set_username(&mut self, name: impl Into<String>) {
        self.username = Some(name.into());
    }

    /// Join the room.
    ///
    /// Returns a receiver that resolves once the session has a scene: the
    /// reconciled peer scene, the reconciled snapshot, or `None`. Starting a
    /// live session does nothing and returns `None`.
    pub fn start(&mut self, now: Instant) -> Option<oneshot::Receiver<InitialScene>> {
        if self.channel.state().is_live() {
            log::warn!("Session already running in state {:?}", self.channel.state());
            return None;
        }
        self.host.pause_save();

        let mut elements: Vec<Element> = self
            .host
            .elements_including_deleted()
            .into_iter()
            .filter(|e| !e.is_deleted)
            .collect();
        let demoted = demote_saved_files(&mut elements);
        if demoted > 0 {
            log::debug!("Marked {demoted} saved files pending");
        }
        self.host.clear_history();
        self.host.update_elements(elements, true);

        self.scheduler.reset();
        self.presence.clear();
        let (tx, rx) = oneshot::channel();
        self.init_tx = Some(tx);
        self.channel.open(now);
        self.idle.start(now);
        Some(rx)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        for event in self.channel.on_transport_event(event, now) {
            self.on_channel_event(event, now);
        }
    }

    /// Local scene changed.
    pub fn sync_elements(&mut self, elements: &[Element], now: Instant) {
        if self.channel.state() != ConnectionState::Active {
            log::trace!("Not syncing in state {:?}", self.channel.state());
            return;
        }
        if let Some(diff) = self.scheduler.on_local_change(elements, now) {
            self.broadcast(RoomMessage::scene_update(&diff, false), false);
        }
    }

    pub fn on_pointer_update(
        &mut self,
        pointer: PointerCoords,
        button: PointerButton,
        active_pointers: usize,
        now: Instant,
    ) {
        if self.channel.state() != ConnectionState::Active {
            return;
        }
        let sample = PointerSample {
            pointer,
            button,
            active_pointers,
        };
        if let Some(sample) = self.scheduler.queue_pointer(now, sample) {
            self.send_pointer(sample);
        }
    }

    pub fn on_pointer_move(&mut self, now: Instant) {
        if !self.channel.state().is_live() {
            return;
        }
        if let Some(state) = self.idle.on_pointer_move(now) {
            self.send_idle_status(state);
        }
    }

    pub fn on_visibility_change(&mut self, hidden: bool, now: Instant) {
        if !self.channel.state().is_live() {
            return;
        }
        if let Some(state) = self.idle.on_visibility_change(hidden, now) {
            self.send_idle_status(state);
        }
    }

    /// Fire every timer that is due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        if !self.channel.state().is_live() {
            return;
        }
        for event in self.channel.poll(now) {
            self.on_channel_event(event, now);
        }
        if self.scheduler.poll_full_sync(now) {
            self.send_full_sync();
        }
        if let Some(sample) = self.scheduler.poll_pointer(now) {
            self.send_pointer(sample);
        }
        if let Some(state) = self.idle.poll(now) {
            self.send_idle_status(state);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.channel.state().is_live() {
            return None;
        }
        earliest([
            self.channel.next_deadline(),
            self.scheduler.next_deadline(),
            self.idle.next_deadline(),
        ])
    }

    /// Leave the room.
    ///
    /// Unless `keep_remote_state` is set, elements with a `saved` external
    /// file go back to `pending`.
    pub fn stop(&mut self, keep_remote_state: bool) {
        if !self.channel.state().is_live() {
            return;
        }
        let elements = self.host.elements_including_deleted();
        if let Err(e) = self.teardown(&elements) {
            self.host.notify(Notice::SnapshotSaveFailed(e));
        }
        self.host.update_collaborators(self.presence.collaborators());
        self.host.resume_save();

        if !keep_remote_state {
            let mut elements = elements;
            if demote_saved_files(&mut elements) > 0 {
                self.host.update_elements(elements, false);
            }
        }
        log::info!("Stopped collaboration in room {}", self.channel.room().room_id);
    }

    /// Teardown on page unload: same cleanup as `stop`, no host callbacks.
    pub fn unload(&mut self) {
        if !self.channel.state().is_live() {
            return;
        }
        let elements = self.host.elements_including_deleted();
        let _ = self.teardown(&elements);
    }

    fn teardown(&mut self, elements: &[Element]) -> Result<(), String> {
        self.scheduler.cancel_timers();
        self.idle.stop();
        let saved = if self.channel.is_initialized() {
            self.save_snapshot(elements)
        } else {
            Ok(())
        };
        self.channel.close();
        self.scheduler.reset();
        self.presence.clear();
        if let Some(tx) = self.init_tx.take() {
            let _ = tx.send(None);
        }
        saved
    }

    fn save_snapshot(&mut self, elements: &[Element]) -> Result<(), String> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        store.save(self.channel.room(), elements).map_err(|e| {
            log::error!("Failed to save snapshot for room {}: {e}", self.channel.room().room_id);
            e.to_string()
        })
    }

    fn on_channel_event(&mut self, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::Connected { resumed } => {
                if resumed {
                    self.host.notify(Notice::Reconnected);
                    self.send_full_sync();
                }
            }
            ChannelEvent::Disconnected => {
                self.scheduler.cancel_timers();
                self.host.notify(Notice::ConnectionLost);
            }
            ChannelEvent::FallbackInit => self.fallback_init(now),
            ChannelEvent::NewUser(peer_id) => self.on_new_user(peer_id),
            ChannelEvent::RoomUsers(peers) => {
                self.presence.replace_roster(peers.iter().map(|p| p.peer_id));
                self.host.update_collaborators(self.presence.collaborators());
            }
            ChannelEvent::Message { from, message } => self.on_room_message(from, message, now),
        }
    }

    fn on_room_message(&mut self, from: Uuid, message: RoomMessage, now: Instant) {
        match message {
            RoomMessage::SceneInit { elements } if !self.channel.is_initialized() => {
                let merged = self.reconcile_remote(elements);
                log::info!("Initialized from {from} with {} elements", merged.len());
                self.install(merged.clone(), true);
                self.finish_init(Some(merged), now);
            }
            RoomMessage::SceneInit { elements } | RoomMessage::SceneUpdate { elements, .. } => {
                let merged = self.reconcile_remote(elements);
                log::debug!("Applied scene from {from} ({} elements)", merged.len());
                self.install(merged, false);
            }
            RoomMessage::PointerUpdate(payload) => {
                log::trace!("Pointer from {}", payload.socket_id);
                self.apply_presence(payload.socket_id, PresenceUpdate::from(&payload));
            }
            RoomMessage::IdleStatus(payload) => {
                self.apply_presence(payload.socket_id, PresenceUpdate::from(&payload));
            }
            RoomMessage::InvalidResponse => {}
        }
    }

    fn reconcile_remote(&self, raw: Vec<Value>) -> Vec<Element> {
        let remote = decode_remote_elements(raw);
        let local = self.host.elements_including_deleted();
        reconcile(&local, &remote.elements)
    }

    /// Install a reconciled scene and mark what the host now holds as seen
    /// before anything else can observe it.
    fn install(&mut self, merged: Vec<Element>, commit_to_history: bool) {
        self.host.update_elements(merged, commit_to_history);
        self.host.clear_history();
        let installed = self.host.elements_including_deleted();
        self.scheduler.record_received(scene_version(&installed));
    }

    fn fallback_init(&mut self, now: Instant) {
        let loaded = match self.store.as_mut() {
            Some(store) => store.load(self.channel.room()),
            None => Ok(None),
        };
        let initial = match loaded {
            Ok(Some(snapshot)) => {
                let local = self.host.elements_including_deleted();
                let merged = reconcile(&local, &snapshot);
                log::info!("Initialized from snapshot with {} elements", merged.len());
                self.install(merged.clone(), false);
                Some(merged)
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to load snapshot: {e}");
                self.host.notify(Notice::SnapshotLoadFailed(e.to_string()));
                None
            }
        };
        self.finish_init(initial, now);
    }

    fn finish_init(&mut self, initial: InitialScene, now: Instant) {
        self.channel.mark_initialized();
        if let Some(tx) = self.init_tx.take() {
            let _ = tx.send(initial);
        }
        // Local edits made while waiting for the scene.
        if self.channel.state() == ConnectionState::Active {
            let elements = self.host.elements_including_deleted();
            self.sync_elements(&elements, now);
        }
    }

    fn on_new_user(&mut self, peer_id: Uuid) {
        if self.channel.state() != ConnectionState::Active {
            log::debug!("Not sending scene to {peer_id}: not active");
            return;
        }
        let elements = self.host.elements_including_deleted();
        let payload = self.scheduler.scene_init(&elements);
        log::info!("Sending scene ({} elements) to new user {peer_id}", payload.len());
        self.broadcast(RoomMessage::scene_init(&payload), false);
    }

    fn send_full_sync(&mut self) {
        if self.channel.state() != ConnectionState::Active {
            return;
        }
        let elements = self.host.elements_including_deleted();
        let payload = self.scheduler.full_sync(&elements);
        self.broadcast(RoomMessage::scene_update(&payload, true), false);
    }

    fn send_pointer(&mut self, sample: PointerSample) {
        let payload = PointerPayload {
            socket_id: self.channel.local_peer().peer_id,
            pointer: sample.pointer,
            button: sample.button,
            selected_element_ids: self.host.selected_element_ids(),
            username: self.username.clone(),
        };
        self.broadcast(RoomMessage::PointerUpdate(payload), true);
    }

    fn send_idle_status(&mut self, user_state: UserIdleState) {
        let payload = IdleStatusPayload {
            socket_id: self.channel.local_peer().peer_id,
            user_state,
            username: self.username.clone(),
        };
        self.broadcast(RoomMessage::IdleStatus(payload), true);
    }

    fn apply_presence(&mut self, peer_id: Uuid, update: PresenceUpdate) {
        if self.presence.apply_remote_presence(peer_id, update) {
            self.host.update_collaborators(self.presence.collaborators());
        }
    }

    fn broadcast(&mut self, message: RoomMessage, volatile: bool) {
        if self.channel.state() != ConnectionState::Active {
            return;
        }
        if let Err(e) = self.channel.send(&message, volatile) {
            log::warn!("Failed to send {}: {e}", message.kind());
        }
    }
}
