//! Presence: who else is in the room, and whether the local user is around.
//!
//! ## Architecture
//!
//! ```text
//! POINTER_UPDATE / IDLE_STATUS ──► PresenceTracker::apply_remote_presence()
//! room-user-change             ──► PresenceTracker::replace_roster()
//!                                        │
//!                                        ▼
//!                              SceneHost::update_collaborators()
//!
//! pointer move / visibility ──► IdleDetector ──(transition)──► IDLE_STATUS
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tandem_core::ElementId;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{IdleStatusPayload, PointerButton, PointerCoords, PointerPayload, UserIdleState};
use crate::timer::Timer;

// ───────────────────────────────────────────────────────────────────
// Remote collaborators
// ───────────────────────────────────────────────────────────────────

/// Last known presence of one remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collaborator {
    pub pointer: Option<PointerCoords>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Option<Vec<ElementId>>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
}

/// Partial presence update. `None` fields leave the record untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub pointer: Option<PointerCoords>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Option<Vec<ElementId>>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
}

impl From<&PointerPayload> for PresenceUpdate {
    fn from(p: &PointerPayload) -> Self {
        Self {
            pointer: Some(p.pointer),
            button: Some(p.button),
            selected_element_ids: Some(p.selected_element_ids.clone()),
            username: p.username.clone(),
            user_state: None,
        }
    }
}

impl From<&IdleStatusPayload> for PresenceUpdate {
    fn from(p: &IdleStatusPayload) -> Self {
        Self {
            user_state: Some(p.user_state),
            username: p.username.clone(),
            ..Self::default()
        }
    }
}

impl Collaborator {
    fn merge(&mut self, update: PresenceUpdate) {
        if update.pointer.is_some() {
            self.pointer = update.pointer;
        }
        if update.button.is_some() {
            self.button = update.button;
        }
        if update.selected_element_ids.is_some() {
            self.selected_element_ids = update.selected_element_ids;
        }
        if update.username.is_some() {
            self.username = update.username;
        }
        if update.user_state.is_some() {
            self.user_state = update.user_state;
        }
    }
}

/// Roster of remote peers. Records are only dropped by a roster replacement.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_id: Uuid,
    collaborators: HashMap<Uuid, Collaborator>,
}

impl PresenceTracker {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            collaborators: HashMap::new(),
        }
    }

    /// Merge a partial update, creating the record for an unseen peer.
    ///
    /// Returns `false` for updates about the local peer, which are ignored.
    pub fn apply_remote_presence(&mut self, peer_id: Uuid, update: PresenceUpdate) -> bool {
        if peer_id == self.local_id {
            return false;
        }
        self.collaborators.entry(peer_id).or_default().merge(update);
        true
    }

    /// Replace the roster: known peers keep their record, new ones start
    /// empty, absent ones are dropped.
    pub fn replace_roster<I>(&mut self, peer_ids: I)
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut next = HashMap::new();
        for id in peer_ids {
            if id == self.local_id {
                continue;
            }
            let record = self.collaborators.remove(&id).unwrap_or_default();
            next.insert(id, record);
        }
        if !self.collaborators.is_empty() {
            log::debug!("Dropping {} departed collaborators", self.collaborators.len());
        }
        self.collaborators = next;
    }

    pub fn collaborators(&self) -> &HashMap<Uuid, Collaborator> {
        &self.collaborators
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&Collaborator> {
        self.collaborators.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    pub fn clear(&mut self) {
        self.collaborators.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Local idle detection
// ───────────────────────────────────────────────────────────────────

/// Tracks the local user's idle state. Every method that changes the state
/// returns the new state exactly once.
#[derive(Debug, Clone)]
pub struct IdleDetector {
    threshold: Duration,
    state: UserIdleState,
    idle_timer: Timer,
}

impl IdleDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: UserIdleState::Active,
            idle_timer: Timer::new(),
        }
    }

    pub fn state(&self) -> UserIdleState {
        self.state
    }

    /// Begin watching as an active user.
    pub fn start(&mut self, now: Instant) {
        self.state = UserIdleState::Active;
        self.idle_timer.arm(now, self.threshold);
    }

    pub fn stop(&mut self) {
        self.idle_timer.cancel();
    }

    pub fn on_pointer_move(&mut self, now: Instant) -> Option<UserIdleState> {
        self.idle_timer.arm(now, self.threshold);
        self.transition(UserIdleState::Active)
    }

    pub fn on_visibility_change(&mut self, hidden: bool, now: Instant) -> Option<UserIdleState> {
        if hidden {
            self.idle_timer.cancel();
            self.transition(UserIdleState::Away)
        } else {
            self.idle_timer.arm(now, self.threshold);
            self.transition(UserIdleState::Active)
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<UserIdleState> {
        if self.idle_timer.fire_if_due(now) && self.state == UserIdleState::Active {
            return self.transition(UserIdleState::Idle);
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.idle_timer.deadline()
    }

    fn transition(&mut self, next: UserIdleState) -> Option<UserIdleState> {
        if self.state == next {
            return None;
        }
        log::debug!("Idle state {:?} -> {:?}", self.state, next);
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── PresenceTracker tests ────────────────────────────────────

    #[test]
    fn test_unseen_peer_created_on_first_message() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let bob = Uuid::new_v4();
        assert!(tracker.apply_remote_presence(
            bob,
            PresenceUpdate {
                username: Some("Bob".into()),
                ..PresenceUpdate::default()
            }
        ));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(&bob).unwrap().username.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_partial_merge_keeps_other_fields() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let bob = Uuid::new_v4();
        let pointer = PointerPayload {
            socket_id: bob,
            pointer: PointerCoords::new(3.0, 4.0),
            button: PointerButton::Down,
            selected_element_ids: vec!["a".into()],
            username: Some("Bob".into()),
        };
        tracker.apply_remote_presence(bob, PresenceUpdate::from(&pointer));
        tracker.apply_remote_presence(
            bob,
            PresenceUpdate::from(&IdleStatusPayload {
                socket_id: bob,
                user_state: UserIdleState::Idle,
                username: None,
            }),
        );

        let record = tracker.get(&bob).unwrap();
        assert_eq!(record.pointer, Some(PointerCoords::new(3.0, 4.0)));
        assert_eq!(record.username.as_deref(), Some("Bob"));
        assert_eq!(record.user_state, Some(UserIdleState::Idle));
    }

    #[test]
    fn test_local_peer_ignored() {
        let me = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(me);
        assert!(!tracker.apply_remote_presence(me, PresenceUpdate::default()));
        tracker.replace_roster([me]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_replace_roster_keeps_drops_and_creates() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        tracker.apply_remote_presence(
            a,
            PresenceUpdate {
                username: Some("A".into()),
                ..PresenceUpdate::default()
            },
        );
        tracker.apply_remote_presence(b, PresenceUpdate::default());

        tracker.replace_roster([a, c]);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.get(&a).unwrap().username.as_deref(), Some("A"));
        assert!(tracker.get(&b).is_none());
        assert_eq!(tracker.get(&c), Some(&Collaborator::default()));
    }

    // ── IdleDetector tests ───────────────────────────────────────

    const THRESHOLD: Duration = Duration::from_secs(60);

    #[test]
    fn test_idle_after_threshold_exactly_once() {
        let t0 = Instant::now();
        let mut idle = IdleDetector::new(THRESHOLD);
        idle.start(t0);
        assert_eq!(idle.poll(t0 + THRESHOLD / 2), None);
        assert_eq!(idle.poll(t0 + THRESHOLD), Some(UserIdleState::Idle));
        assert_eq!(idle.poll(t0 + THRESHOLD * 2), None);
        assert_eq!(idle.state(), UserIdleState::Idle);
    }

    #[test]
    fn test_pointer_move_resets_and_reactivates() {
        let t0 = Instant::now();
        let mut idle = IdleDetector::new(THRESHOLD);
        idle.start(t0);
        assert_eq!(idle.on_pointer_move(t0 + THRESHOLD / 2), None);
        assert_eq!(idle.poll(t0 + THRESHOLD), None);
        assert_eq!(idle.poll(t0 + THRESHOLD * 3 / 2), Some(UserIdleState::Idle));
        assert_eq!(
            idle.on_pointer_move(t0 + THRESHOLD * 2),
            Some(UserIdleState::Active)
        );
    }

    #[test]
    fn test_hidden_goes_away_immediately() {
        let t0 = Instant::now();
        let mut idle = IdleDetector::new(THRESHOLD);
        idle.start(t0);
        assert_eq!(idle.on_visibility_change(true, t0), Some(UserIdleState::Away));
        assert_eq!(idle.next_deadline(), None);
        assert_eq!(idle.on_visibility_change(true, t0), None);
        assert_eq!(
            idle.on_visibility_change(false, t0 + THRESHOLD),
            Some(UserIdleState::Active)
        );
    }

    #[test]
    fn test_stop_cancels_timer() {
        let t0 = Instant::now();
        let mut idle = IdleDetector::new(THRESHOLD);
        idle.start(t0);
        idle.stop();
        assert_eq!(idle.poll(t0 + THRESHOLD), None);
    }
}
