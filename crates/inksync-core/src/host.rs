//! The document host: the editor the session synchronizes.
//!
//! The session never owns the scene. It reads and writes it through
//! [`DocumentHost`], passed in on every call.

use crate::element::{Element, ElementId, FileId};
use crate::files::BinaryFileData;
use crate::presence::{Collaborators, SocketId};
use kurbo::Rect;
use std::collections::{HashMap, HashSet};

/// Editor state the sync layer needs to read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    /// Elements being dragged, resized or text-edited right now.
    pub editing_element_ids: HashSet<ElementId>,
    pub selected_element_ids: Vec<ElementId>,
    /// Socket id of the user whose viewport we follow.
    pub user_to_follow: Option<SocketId>,
    /// Socket ids of users following us.
    pub followed_by: HashSet<SocketId>,
    /// Visible part of the scene, in scene coordinates.
    pub visible_scene_bounds: Rect,
}

pub trait DocumentHost {
    /// Every element in z-order, tombstones included.
    fn elements_including_deleted(&self) -> Vec<Element>;

    /// Live elements in z-order.
    fn elements(&self) -> Vec<Element> {
        self.elements_including_deleted()
            .into_iter()
            .filter(|el| !el.is_deleted)
            .collect()
    }

    /// Replace the scene. Must not be recorded as an undoable local edit.
    fn apply_elements(&mut self, elements: Vec<Element>);

    fn add_files(&mut self, files: Vec<BinaryFileData>);

    fn files(&self) -> HashMap<FileId, BinaryFileData>;

    fn app_state(&self) -> AppState;

    /// Scroll and zoom so `bounds` fills the viewport.
    fn zoom_to_fit_bounds(&mut self, bounds: Rect);

    fn set_followed_by(&mut self, followed_by: Vec<SocketId>);

    fn set_collaborators(&mut self, collaborators: &Collaborators);

    /// Pause or resume the host's own local persistence while collaborating.
    fn set_local_persistence_paused(&mut self, _paused: bool) {}
}

/// Headless document host keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryDocument {
    pub elements: Vec<Element>,
    pub files: HashMap<FileId, BinaryFileData>,
    pub app_state: AppState,
    /// Socket ids of the last roster pushed by the session.
    pub collaborator_ids: Vec<SocketId>,
    /// Last bounds the session asked to zoom to.
    pub zoomed_to: Option<Rect>,
    pub persistence_paused: bool,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(elements: Vec<Element>) -> Self {
        Self {
            elements,
            ..Self::default()
        }
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|el| el.id == id)
    }

    /// Append a new element, as a local edit.
    pub fn add(&mut self, element: Element) {
        self.elements.push(element);
    }

    /// Mutate an element in place through [`Element::mutated`], as a local edit.
    pub fn mutate(&mut self, id: &str, update: impl FnOnce(&mut Element)) -> bool {
        match self.elements.iter_mut().find(|el| el.id == id) {
            Some(el) => {
                *el = el.mutated(update);
                true
            }
            None => false,
        }
    }
}

impl DocumentHost for MemoryDocument {
    fn elements_including_deleted(&self) -> Vec<Element> {
        self.elements.clone()
    }

    fn apply_elements(&mut self, elements: Vec<Element>) {
        self.elements = elements;
    }

    fn add_files(&mut self, files: Vec<BinaryFileData>) {
        self.files.extend(files.into_iter().map(|file| (file.id.clone(), file)));
    }

    fn files(&self) -> HashMap<FileId, BinaryFileData> {
        self.files.clone()
    }

    fn app_state(&self) -> AppState {
        self.app_state.clone()
    }

    fn zoom_to_fit_bounds(&mut self, bounds: Rect) {
        self.zoomed_to = Some(bounds);
    }

    fn set_followed_by(&mut self, followed_by: Vec<SocketId>) {
        self.app_state.followed_by = followed_by.into_iter().collect();
    }

    fn set_collaborators(&mut self, collaborators: &Collaborators) {
        let mut ids: Vec<SocketId> = collaborators.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        self.collaborator_ids = ids;
    }

    fn set_local_persistence_paused(&mut self, paused: bool) {
        self.persistence_paused = paused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elements_hides_tombstones() {
        let live = Element::new("rectangle");
        let gone = Element::new("ellipse").deleted();
        let doc = MemoryDocument::with_elements(vec![live.clone(), gone]);
        assert_eq!(doc.elements(), vec![live]);
        assert_eq!(doc.elements_including_deleted().len(), 2);
    }

    #[test]
    fn test_mutate_bumps_version() {
        let el = Element::new("rectangle");
        let mut doc = MemoryDocument::with_elements(vec![el.clone()]);
        assert!(doc.mutate(&el.id, |e| e.is_deleted = true));
        let updated = doc.element(&el.id).unwrap();
        assert_eq!(updated.version, el.version + 1);
        assert!(updated.is_deleted);
        assert!(!doc.mutate("missing", |_| {}));
    }
}
