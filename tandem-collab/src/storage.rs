//! Durable room snapshots.
//!
//! The session saves the scene when it stops and, when nobody else can hand
//! over a scene, loads the last snapshot to reconcile into the local one.
//! Backends live outside this crate; [`MemorySnapshotStore`] covers tests and
//! single-process setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tandem_core::Element;
use thiserror::Error;

use crate::channel::RoomLink;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub trait SnapshotStore: Send {
    fn save(&mut self, room: &RoomLink, elements: &[Element]) -> Result<(), StoreError>;

    /// `Ok(None)` when the room has never been saved.
    fn load(&mut self, room: &RoomLink) -> Result<Option<Vec<Element>>, StoreError>;
}

/// In-process store keeping JSON snapshots per room id.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw snapshot bytes for a room.
    pub fn raw(&self, room_id: &str) -> Option<Vec<u8>> {
        self.snapshots.lock().ok()?.get(room_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&mut self, room: &RoomLink, elements: &[Element]) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(elements).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        log::debug!(
            "Saved {} elements ({} bytes) for room {}",
            elements.len(),
            bytes.len(),
            room.room_id
        );
        snapshots.insert(room.room_id.clone(), bytes);
        Ok(())
    }

    fn load(&mut self, room: &RoomLink) -> Result<Option<Vec<Element>>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match snapshots.get(&room.room_id) {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomLink {
        RoomLink::new(id, "key")
    }

    #[test]
    fn test_save_then_load() {
        let mut store = MemorySnapshotStore::new();
        let elements = vec![Element::new("a").with_prop("x", 1), Element::new("b")];
        store.save(&room("r1"), &elements).unwrap();
        assert_eq!(store.load(&room("r1")).unwrap(), Some(elements));
        assert_eq!(store.load(&room("r2")).unwrap(), None);
    }

    #[test]
    fn test_clones_share_snapshots() {
        let store = MemorySnapshotStore::new();
        let mut writer = store.clone();
        writer.save(&room("r1"), &[Element::new("a")]).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.raw("r1").is_some());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let mut store = MemorySnapshotStore::new();
        store
            .snapshots
            .lock()
            .unwrap()
            .insert("r1".into(), b"garbage".to_vec());
        assert!(matches!(
            store.load(&room("r1")),
            Err(StoreError::Deserialization(_))
        ));
    }
}
