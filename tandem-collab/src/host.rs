//! The document side of a collaboration session.
//!
//! A session never owns the element set. It reads and replaces it through
//! [`SceneHost`], which is implemented by whatever editor embeds the engine.

use std::collections::HashMap;
use tandem_core::{Element, ElementId, ElementStore};
use uuid::Uuid;

use crate::presence::Collaborator;

/// Non-fatal conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ConnectionLost,
    Reconnected,
    SnapshotLoadFailed(String),
    SnapshotSaveFailed(String),
}

pub trait SceneHost: Send {
    /// Every element in z-order, tombstones included.
    fn elements_including_deleted(&self) -> Vec<Element>;

    fn selected_element_ids(&self) -> Vec<ElementId>;

    /// Replace the whole element set.
    fn update_elements(&mut self, elements: Vec<Element>, commit_to_history: bool);

    fn clear_history(&mut self);

    fn update_collaborators(&mut self, collaborators: &HashMap<Uuid, Collaborator>);

    /// Suspend local autosave while a room owns the document.
    fn pause_save(&mut self);

    fn resume_save(&mut self);

    fn notify(&mut self, notice: Notice);
}

/// Headless [`SceneHost`] backed by an [`ElementStore`].
#[derive(Debug, Clone, Default)]
pub struct LocalScene {
    store: ElementStore,
    selection: Vec<ElementId>,
    history: Vec<Vec<Element>>,
    collaborators: HashMap<Uuid, Collaborator>,
    save_paused: bool,
    notices: Vec<Notice>,
}

impl LocalScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Element>) -> Self {
        Self {
            store: ElementStore::from_elements(elements),
            ..Self::default()
        }
    }

    pub fn store(&self) -> &ElementStore {
        &self.store
    }

    /// Direct access for local edits.
    pub fn store_mut(&mut self) -> &mut ElementStore {
        &mut self.store
    }

    pub fn select(&mut self, ids: Vec<ElementId>) {
        self.selection = ids;
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Committed scenes, oldest first.
    pub fn history(&self) -> &[Vec<Element>] {
        &self.history
    }

    pub fn collaborators(&self) -> &HashMap<Uuid, Collaborator> {
        &self.collaborators
    }

    pub fn is_save_paused(&self) -> bool {
        self.save_paused
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }
}

impl SceneHost for LocalScene {
    fn elements_including_deleted(&self) -> Vec<Element> {
        self.store.to_vec()
    }

    fn selected_element_ids(&self) -> Vec<ElementId> {
        self.selection.clone()
    }

    fn update_elements(&mut self, elements: Vec<Element>, commit_to_history: bool) {
        let rejected = self.store.replace_all(elements);
        if rejected > 0 {
            log::warn!("Scene update kept {rejected} newer local elements");
        }
        if commit_to_history {
            self.history.push(self.store.to_vec());
        }
    }

    fn clear_history(&mut self) {
        self.history.clear();
    }

    fn update_collaborators(&mut self, collaborators: &HashMap<Uuid, Collaborator>) {
        self.collaborators = collaborators.clone();
    }

    fn pause_save(&mut self) {
        self.save_paused = true;
    }

    fn resume_save(&mut self) {
        self.save_paused = false;
    }

    fn notify(&mut self, notice: Notice) {
        log::info!("Notice: {notice:?}");
        self.notices.push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_commit_and_clear() {
        let mut scene = LocalScene::from_elements(vec![Element::new("a")]);
        let mut next = scene.elements_including_deleted();
        next[0].bump();
        scene.update_elements(next.clone(), true);
        assert_eq!(scene.history_len(), 1);
        assert_eq!(scene.history()[0], next);
        scene.update_elements(next, false);
        assert_eq!(scene.history_len(), 1);
        scene.clear_history();
        assert_eq!(scene.history_len(), 0);
    }

    #[test]
    fn test_update_never_regresses() {
        let mut scene = LocalScene::new();
        scene.store_mut().insert(Element::new("a")).unwrap();
        scene.store_mut().mutate("a", |e| e.is_deleted = true).unwrap();
        let stale = Element::new("a");
        scene.update_elements(vec![stale], false);
        assert!(scene.store().get("a").unwrap().is_deleted);
    }

    #[test]
    fn test_save_pause_and_notices() {
        let mut scene = LocalScene::new();
        scene.pause_save();
        assert!(scene.is_save_paused());
        scene.resume_save();
        assert!(!scene.is_save_paused());
        scene.notify(Notice::ConnectionLost);
        assert_eq!(scene.notices(), &[Notice::ConnectionLost]);
    }
}
