//! Document elements and the local element store.
//!
//! The sync engine only interprets identity and versioning fields. Geometry,
//! styling and every other drawable attribute ride along opaquely in
//! [`Element::props`] and are flattened into the element on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::scene::{scene_version, SceneVersion};

/// Stable element identifier, assigned at creation and never reused.
pub type ElementId = String;

/// Highest version an element may carry. Remote elements above it are
/// treated as malformed, which keeps version sums from overflowing.
pub const MAX_VERSION: u64 = u32::MAX as u64;

/// Upload state of an element that references an externally hosted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Not yet uploaded, or needs uploading again.
    Pending,
    /// Uploaded to the file store.
    Saved,
    /// Upload failed.
    Error,
}

/// A single drawable element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Stable identity.
    pub id: ElementId,
    /// Incremented on every local mutation.
    pub version: u64,
    /// Random tie-breaker for equal versions. Not a measure of recency.
    #[serde(default)]
    pub version_nonce: i64,
    /// Wall-clock millis of the last local mutation.
    #[serde(default)]
    pub updated: u64,
    /// Soft tombstone. Deleted elements stay in the set.
    #[serde(default)]
    pub is_deleted: bool,
    /// External file this element renders, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Upload state of `file_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    /// Opaque drawable attributes.
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Element {
    /// Create a fresh element at version 1.
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: random_nonce(),
            updated: now_millis(),
            is_deleted: false,
            file_id: None,
            status: None,
            props: Map::new(),
        }
    }

    /// Builder-style helper for attaching an opaque attribute.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Attach an external file reference with the given upload status.
    pub fn with_file(mut self, file_id: impl Into<String>, status: FileStatus) -> Self {
        self.file_id = Some(file_id.into());
        self.status = Some(status);
        self
    }

    /// Record a local mutation: new version, new nonce, new timestamp.
    ///
    /// Saturates at [`MAX_VERSION`].
    pub fn bump(&mut self) {
        self.version = self.version.saturating_add(1).min(MAX_VERSION);
        self.version_nonce = random_nonce();
        self.updated = now_millis();
    }

    /// Whether this element points at a resource hosted outside the scene.
    pub fn references_external_file(&self) -> bool {
        self.file_id.is_some()
    }

    /// Copy of this element with a `saved` file reference demoted to
    /// `pending`, or `None` if nothing needs to change.
    pub fn demoted_to_pending(&self) -> Option<Element> {
        if !self.references_external_file() || self.status != Some(FileStatus::Saved) {
            return None;
        }
        let mut next = self.clone();
        next.status = Some(FileStatus::Pending);
        next.bump();
        Some(next)
    }
}

/// Demote every `saved` external-file element in `elements` to `pending`.
///
/// Returns the number of elements that changed.
pub fn demote_saved_files(elements: &mut [Element]) -> usize {
    let mut changed = 0;
    for element in elements.iter_mut() {
        if let Some(next) = element.demoted_to_pending() {
            *element = next;
            changed += 1;
        }
    }
    changed
}

fn random_nonce() -> i64 {
    (Uuid::new_v4().as_u128() & 0x7fff_ffff) as i64
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Element store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElementError {
    #[error("Element id must not be empty")]
    EmptyId,
    #[error("Duplicate element id: {0}")]
    DuplicateId(ElementId),
    #[error("Element not found: {0}")]
    NotFound(ElementId),
}

/// Ordered element collection, tombstones included.
///
/// The version of an id held in the store never goes down. An id that
/// leaves the set is forgotten, so a later copy of it is adopted as new.
#[derive(Debug, Clone, Default)]
pub struct ElementStore {
    elements: Vec<Element>,
    index: HashMap<ElementId, usize>,
}

impl ElementStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an element sequence, applying the same rules as
    /// [`ElementStore::replace_all`].
    pub fn from_elements(elements: Vec<Element>) -> Self {
        let mut store = Self::new();
        store.replace_all(elements);
        store
    }

    /// Number of elements, tombstones included.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the store holds no elements at all.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Look up an element by id.
    pub fn get(&self, id: &str) -> Option<&Element> {
        self.index.get(id).map(|&i| &self.elements[i])
    }

    /// All elements in z-order, including tombstones.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Version of the whole set, see [`scene_version`].
    pub fn scene_version(&self) -> SceneVersion {
        scene_version(&self.elements)
    }

    /// Append a new element on top of the z-order.
    pub fn insert(&mut self, element: Element) -> Result<(), ElementError> {
        if element.id.is_empty() {
            return Err(ElementError::EmptyId);
        }
        if self.index.contains_key(&element.id) {
            return Err(ElementError::DuplicateId(element.id));
        }
        self.index.insert(element.id.clone(), self.elements.len());
        self.elements.push(element);
        Ok(())
    }

    /// Apply a local mutation and bump the element's version.
    pub fn mutate<F>(&mut self, id: &str, f: F) -> Result<&Element, ElementError>
    where
        F: FnOnce(&mut Element),
    {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| ElementError::NotFound(id.to_string()))?;
        let element = &mut self.elements[i];
        f(element);
        // Identity is not mutable.
        element.id = id.to_string();
        element.bump();
        Ok(&self.elements[i])
    }

    /// Soft-delete an element.
    pub fn delete(&mut self, id: &str) -> Result<&Element, ElementError> {
        self.mutate(id, |e| e.is_deleted = true)
    }

    /// Replace the whole set in one step.
    ///
    /// An incoming element older than the copy currently held is rejected
    /// and the current copy stays in its place. Ids missing from `incoming`
    /// leave the store. Empty and repeated ids are rejected too. Returns the
    /// number of rejected entries.
    pub fn replace_all(&mut self, incoming: Vec<Element>) -> usize {
        let mut previous: HashMap<ElementId, Element> = self
            .elements
            .drain(..)
            .map(|e| (e.id.clone(), e))
            .collect();
        self.index.clear();

        let mut rejected = 0;
        for element in incoming {
            if element.id.is_empty() || self.index.contains_key(&element.id) {
                rejected += 1;
                continue;
            }
            let kept = match previous.remove(&element.id) {
                Some(current) if element.version < current.version => {
                    rejected += 1;
                    current
                }
                _ => element,
            };
            self.index.insert(kept.id.clone(), self.elements.len());
            self.elements.push(kept);
        }

        if rejected > 0 {
            log::debug!("replace_all rejected {rejected} stale or invalid elements");
        }
        rejected
    }

    /// Drop tombstones from the set.
    pub fn strip_deleted(&mut self) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| !e.is_deleted);
        self.rebuild_index();
        before - self.elements.len()
    }

    /// Owned copy of every element in z-order.
    pub fn to_vec(&self) -> Vec<Element> {
        self.elements.clone()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }
}
