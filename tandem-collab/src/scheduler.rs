//! Outbound traffic decisions.
//!
//! ```text
//! local change ──► supersedes marker? ──no──► drop
//!                        │ yes
//!                        ├──► SCENE_UPDATE (only elements newer than last sent)
//!                        └──► full-sync throttle ──(trailing)──► SCENE_UPDATE syncAll
//!
//! pointer sample ──► leading+trailing throttle ──► POINTER_UPDATE (single pointer only)
//! ```
//!
//! The marker is the highest scene version this peer has broadcast or
//! received. It only moves forward until [`BroadcastScheduler::reset`].

use std::collections::HashMap;
use std::time::Duration;
use tandem_core::{scene_version, Element, ElementId, SceneVersion};
use tokio::time::Instant;

use crate::protocol::{PointerButton, PointerCoords};
use crate::timer::{earliest, Throttle};

/// One local pointer observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerSample {
    pub pointer: PointerCoords,
    pub button: PointerButton,
    /// Number of pointers currently down (multi-touch).
    pub active_pointers: usize,
}

pub struct BroadcastScheduler {
    marker: Option<SceneVersion>,
    /// Last version broadcast per element id.
    sent_versions: HashMap<ElementId, u64>,
    full_sync: Throttle<()>,
    pointer: Throttle<PointerSample>,
}

impl BroadcastScheduler {
    pub fn new(full_sync_interval: Duration, pointer_interval: Duration) -> Self {
        Self {
            marker: None,
            sent_versions: HashMap::new(),
            full_sync: Throttle::trailing(full_sync_interval),
            pointer: Throttle::leading(pointer_interval),
        }
    }

    pub fn marker(&self) -> Option<SceneVersion> {
        self.marker
    }

    /// Whether `elements` hold changes not yet covered by the marker.
    pub fn has_unsent_changes(&self, elements: &[Element]) -> bool {
        scene_version(elements).supersedes(self.marker)
    }

    /// React to a local scene change.
    ///
    /// Returns the diff to broadcast, or `None` when nothing new needs to go
    /// out. An accepted change always queues a trailing full sync.
    pub fn on_local_change(&mut self, elements: &[Element], now: Instant) -> Option<Vec<Element>> {
        let version = scene_version(elements);
        if !version.supersedes(self.marker) {
            return None;
        }
        let diff: Vec<Element> = elements
            .iter()
            .filter(|e| {
                self.sent_versions
                    .get(&e.id)
                    .map_or(true, |&sent| e.version > sent)
            })
            .cloned()
            .collect();
        self.record_sent(&diff);
        self.advance(version);
        self.full_sync.call(now, ());
        if diff.is_empty() {
            log::debug!("Scene {version} has no unsent elements");
            None
        } else {
            Some(diff)
        }
    }

    /// Whether the trailing full sync is due now.
    pub fn poll_full_sync(&mut self, now: Instant) -> bool {
        self.full_sync.poll(now).is_some()
    }

    /// Payload for a full sync (`SCENE_UPDATE` with `syncAll`).
    ///
    /// Every element goes out, tombstones included, regardless of marker.
    pub fn full_sync(&mut self, elements: &[Element]) -> Vec<Element> {
        self.record_sent(elements);
        self.advance(scene_version(elements));
        elements.to_vec()
    }

    /// Payload for `SCENE_INIT` towards a new joiner.
    pub fn scene_init(&mut self, elements: &[Element]) -> Vec<Element> {
        self.full_sync(elements)
    }

    /// Note a reconciled remote scene as already seen.
    pub fn record_received(&mut self, version: SceneVersion) {
        self.advance(version);
    }

    /// Offer a pointer sample; returns one to send on a leading edge.
    pub fn queue_pointer(&mut self, now: Instant, sample: PointerSample) -> Option<PointerSample> {
        self.pointer.call(now, sample).and_then(single_pointer)
    }

    /// Trailing pointer sample, if due.
    pub fn poll_pointer(&mut self, now: Instant) -> Option<PointerSample> {
        self.pointer.poll(now).and_then(single_pointer)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.full_sync.deadline(), self.pointer.deadline()])
    }

    pub fn cancel_timers(&mut self) {
        self.full_sync.cancel();
        self.pointer.cancel();
    }

    /// Forget everything. Used on teardown.
    pub fn reset(&mut self) {
        self.cancel_timers();
        self.marker = None;
        self.sent_versions.clear();
    }

    fn advance(&mut self, version: SceneVersion) {
        self.marker = Some(self.marker.map_or(version, |m| m.max(version)));
    }

    fn record_sent(&mut self, elements: &[Element]) {
        for e in elements {
            let sent = self.sent_versions.entry(e.id.clone()).or_insert(e.version);
            *sent = (*sent).max(e.version);
        }
    }
}

fn single_pointer(sample: PointerSample) -> Option<PointerSample> {
    if sample.active_pointers >= 2 {
        log::trace!("Suppressing pointer update with {} pointers", sample.active_pointers);
        None
    } else {
        Some(sample)
    }
}
