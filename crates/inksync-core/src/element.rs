//! Versioned scene elements.
//!
//! The sync layer only cares about an element's identity and version fields.
//! Geometry and style travel along as opaque JSON in [`Element::data`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable element identifier, assigned at creation and never reused.
pub type ElementId = String;

/// Identifier of a binary attachment referenced by an image element.
pub type FileId = String;

/// Element type tag used for image elements.
pub const IMAGE_ELEMENT_TYPE: &str = "image";

/// Storage status of an image element's attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Referenced but not yet confirmed stored remotely.
    Pending,
    /// Confirmed persisted remotely; peers may fetch it.
    Saved,
    /// Fetch or upload failed.
    Error,
}

/// A drawable unit of the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub kind: String,
    /// Incremented on every mutation by any party.
    pub version: u32,
    /// Random tie-breaker for equal versions. Lower wins.
    pub version_nonce: u32,
    /// Milliseconds since the Unix epoch of the last mutation.
    pub updated: i64,
    /// Tombstone flag. Deleted elements stay in the collection.
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    /// Type-specific fields, opaque to synchronization.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Element {
    /// Create a new element of the given type at version 1.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            version: 1,
            version_nonce: random_nonce(),
            updated: now_millis(),
            is_deleted: false,
            file_id: None,
            status: None,
            data: Map::new(),
        }
    }

    /// Create an image element referencing `file_id`, pending upload.
    pub fn image(file_id: impl Into<FileId>) -> Self {
        let mut element = Self::new(IMAGE_ELEMENT_TYPE);
        element.file_id = Some(file_id.into());
        element.status = Some(FileStatus::Pending);
        element
    }

    /// Builder-style setter for an opaque attribute.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn is_image(&self) -> bool {
        self.kind == IMAGE_ELEMENT_TYPE
    }

    /// An image element that already references an attachment.
    pub fn is_initialized_image(&self) -> bool {
        self.is_image() && self.file_id.is_some()
    }

    /// Return a mutated copy: applies `update`, then bumps version, nonce and timestamp.
    ///
    /// Every change that should reach peers must go through here.
    pub fn mutated(&self, update: impl FnOnce(&mut Element)) -> Element {
        let mut next = self.clone();
        update(&mut next);
        next.id = self.id.clone();
        next.version = self.version.saturating_add(1);
        next.version_nonce = random_nonce();
        next.updated = now_millis();
        next
    }

    /// Return a copy with a new attachment status.
    pub fn with_status(&self, status: FileStatus) -> Element {
        self.mutated(|el| el.status = Some(status))
    }

    /// Return a tombstoned copy.
    pub fn deleted(&self) -> Element {
        self.mutated(|el| el.is_deleted = true)
    }
}

/// Choose the winning variant of one element id.
///
/// Higher version wins, then lower nonce. Identical candidates keep `a`.
pub fn pick_version<'a>(a: &'a Element, b: &'a Element) -> &'a Element {
    if a.version != b.version {
        if a.version > b.version { a } else { b }
    } else if a.version_nonce != b.version_nonce {
        if a.version_nonce < b.version_nonce { a } else { b }
    } else {
        a
    }
}

/// Derived scene version: the sum of all element versions, tombstones included.
pub fn scene_version(elements: &[Element]) -> u64 {
    elements.iter().map(|el| u64::from(el.version)).sum()
}

/// Whether an element should be broadcast and persisted.
///
/// Tombstones stop syncing once they are older than `deleted_timeout_ms`.
pub fn is_syncable_element(element: &Element, now_ms: i64, deleted_timeout_ms: i64) -> bool {
    if element.is_deleted {
        return element.updated > now_ms - deleted_timeout_ms;
    }
    true
}

/// Filter a scene down to its syncable elements, preserving order.
pub fn syncable_elements(elements: &[Element], now_ms: i64, deleted_timeout_ms: i64) -> Vec<Element> {
    elements
        .iter()
        .filter(|el| is_syncable_element(el, now_ms, deleted_timeout_ms))
        .cloned()
        .collect()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn random_nonce() -> u32 {
    rand::thread_rng().r#gen()
}
