//! Attachment (binary file) tracking, upload and download.
//!
//! Each attachment is stored under `{files_prefix}/{file_id}` as
//! `[12-byte IV][ciphertext]`, the ciphertext being the JSON-encoded
//! [`BinaryFileData`] encrypted with the room key.

use crate::crypto::{self, IV_LENGTH_BYTES};
use crate::element::{Element, FileId, FileStatus};
use crate::room::RoomLinkData;
use crate::storage::{RemoteStore, StorageError, StorageResult};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A binary attachment as the host holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFileData {
    pub id: FileId,
    pub mime_type: String,
    /// `data:` URL with the file contents.
    pub data_url: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub created: i64,
}

/// Outcome of [`FileManager::get_files`].
#[derive(Debug, Default)]
pub struct LoadedFiles {
    pub loaded: Vec<BinaryFileData>,
    pub errored: HashSet<FileId>,
}

/// Outcome of [`FileManager::save_files`].
#[derive(Debug, Default)]
pub struct SavedFiles {
    pub saved: Vec<FileId>,
    pub errored: Vec<FileId>,
}

/// Storage key of one attachment.
pub fn file_key(room: &RoomLinkData, id: &str) -> String {
    format!("{}/{}", room.files_prefix(), id)
}

fn encode_file(room: &RoomLinkData, file: &BinaryFileData) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(file)?;
    let encrypted = crypto::encrypt(&room.room_key, &json)?;
    let mut blob = encrypted.iv;
    blob.extend_from_slice(&encrypted.ciphertext);
    Ok(blob)
}

fn decode_file(room: &RoomLinkData, blob: &[u8]) -> StorageResult<BinaryFileData> {
    if blob.len() < IV_LENGTH_BYTES {
        return Err(StorageError::Corrupt("attachment shorter than its IV".to_string()));
    }
    let (iv, ciphertext) = blob.split_at(IV_LENGTH_BYTES);
    let plaintext = crypto::decrypt(&room.room_key, iv, ciphertext)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

async fn fetch_file<R: RemoteStore>(store: &R, room: &RoomLinkData, id: &str) -> StorageResult<BinaryFileData> {
    let blob = store.get(&file_key(room, id)).await?;
    decode_file(room, &blob)
}

/// Tracks which attachments are in flight, stored or failed.
pub struct FileManager<R> {
    store: Arc<R>,
    max_bytes: usize,
    fetching: HashSet<FileId>,
    saving: HashSet<FileId>,
    /// Known to be stored remotely (uploaded by us or fetched).
    saved: HashSet<FileId>,
    errored: HashSet<FileId>,
}

impl<R: RemoteStore> FileManager<R> {
    pub fn new(store: Arc<R>, max_bytes: usize) -> Self {
        Self {
            store,
            max_bytes,
            fetching: HashSet::new(),
            saving: HashSet::new(),
            saved: HashSet::new(),
            errored: HashSet::new(),
        }
    }

    /// Whether the manager already knows about an attachment in any state.
    pub fn is_file_handled(&self, id: &str) -> bool {
        self.fetching.contains(id) || self.saving.contains(id) || self.saved.contains(id) || self.errored.contains(id)
    }

    pub fn is_file_saved(&self, id: &str) -> bool {
        self.saved.contains(id)
    }

    /// Fetch attachments concurrently. Duplicate ids and ids already being
    /// fetched are skipped; failures are reported per id.
    pub async fn get_files(&mut self, room: &RoomLinkData, ids: &[FileId]) -> LoadedFiles {
        let mut seen = HashSet::new();
        let ids: Vec<FileId> = ids
            .iter()
            .filter(|id| !self.fetching.contains(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return LoadedFiles::default();
        }
        self.fetching.extend(ids.iter().cloned());

        let store = Arc::clone(&self.store);
        let results = join_all(ids.iter().map(|id| fetch_file(&*store, room, id))).await;

        let mut outcome = LoadedFiles::default();
        for (id, result) in ids.into_iter().zip(results) {
            self.fetching.remove(&id);
            match result {
                Ok(file) => {
                    self.saved.insert(id);
                    outcome.loaded.push(file);
                }
                Err(e) => {
                    log::warn!("Failed to load attachment {}: {}", id, e);
                    self.errored.insert(id.clone());
                    outcome.errored.insert(id);
                }
            }
        }
        outcome
    }

    /// Upload every attachment referenced by an image element that the
    /// manager has not handled yet.
    ///
    /// Files over the size ceiling are marked errored without being uploaded.
    pub async fn save_files(
        &mut self,
        room: &RoomLinkData,
        elements: &[Element],
        files: &HashMap<FileId, BinaryFileData>,
    ) -> SavedFiles {
        let mut added: Vec<&BinaryFileData> = Vec::new();
        let mut seen = HashSet::new();
        for element in elements.iter().filter(|el| el.is_initialized_image()) {
            let Some(file_id) = element.file_id.as_deref() else {
                continue;
            };
            if self.is_file_handled(file_id) || !seen.insert(file_id) {
                continue;
            }
            if let Some(file) = files.get(file_id) {
                added.push(file);
            }
        }
        if added.is_empty() {
            return SavedFiles::default();
        }
        self.saving.extend(added.iter().map(|file| file.id.clone()));

        let mut outcome = SavedFiles::default();
        let mut uploads = Vec::new();
        for file in added {
            match encode_file(room, file) {
                Ok(blob) if blob.len() > self.max_bytes => {
                    log::warn!(
                        "Attachment {} is {} bytes, over the {} byte limit",
                        file.id,
                        blob.len(),
                        self.max_bytes
                    );
                    outcome.errored.push(file.id.clone());
                }
                Ok(blob) => uploads.push((file.id.clone(), blob)),
                Err(e) => {
                    log::warn!("Failed to encode attachment {}: {}", file.id, e);
                    outcome.errored.push(file.id.clone());
                }
            }
        }

        let store = Arc::clone(&self.store);
        let results = join_all(
            uploads
                .into_iter()
                .map(|(id, blob)| {
                    let key = file_key(room, &id);
                    let store = &store;
                    async move { (id, store.put(&key, blob).await) }
                }),
        )
        .await;

        for (id, result) in results {
            match result {
                Ok(()) => outcome.saved.push(id),
                Err(e) => {
                    log::warn!("Failed to upload attachment {}: {}", id, e);
                    outcome.errored.push(id);
                }
            }
        }

        for id in &outcome.saved {
            self.saving.remove(id);
            self.saved.insert(id.clone());
        }
        for id in &outcome.errored {
            self.saving.remove(id);
            self.errored.insert(id.clone());
        }
        outcome
    }

    /// A pending image whose attachment is now stored should flip to `saved`.
    pub fn should_update_image_element_status(&self, element: &Element) -> bool {
        element.is_initialized_image()
            && element.status == Some(FileStatus::Pending)
            && element.file_id.as_deref().is_some_and(|id| self.saved.contains(id))
    }

    /// Whether leaving now could lose attachments: some live image is still
    /// uploading or waiting to be uploaded.
    pub fn should_prevent_unload(&self, elements: &[Element]) -> bool {
        elements.iter().any(|el| {
            if el.is_deleted || !el.is_initialized_image() {
                return false;
            }
            let Some(id) = el.file_id.as_deref() else {
                return false;
            };
            self.saving.contains(id) || (el.status == Some(FileStatus::Pending) && !self.saved.contains(id))
        })
    }

    /// Image attachments that should be fetched.
    ///
    /// Normally only `saved` images are fetched. With `force`, anything not
    /// `pending` is fetched too, as is a `pending` image older than `grace_ms`.
    pub fn unfetched_image_ids(&self, elements: &[Element], force: bool, now_ms: i64, grace_ms: i64) -> Vec<FileId> {
        elements
            .iter()
            .filter(|el| el.is_initialized_image() && !el.is_deleted)
            .filter(|el| {
                if force {
                    el.status != Some(FileStatus::Pending) || now_ms - el.updated > grace_ms
                } else {
                    el.status == Some(FileStatus::Saved)
                }
            })
            .filter_map(|el| el.file_id.clone())
            .filter(|id| !self.is_file_handled(id))
            .collect()
    }

    /// Forget everything; used when leaving a room.
    pub fn reset(&mut self) {
        self.fetching.clear();
        self.saving.clear();
        self.saved.clear();
        self.errored.clear();
    }
}

/// Mark image elements whose attachment failed to load as `error`.
///
/// Returns the updated scene, or `None` when nothing changed.
pub fn update_stale_image_statuses(elements: &[Element], errored: &HashSet<FileId>) -> Option<Vec<Element>> {
    if errored.is_empty() {
        return None;
    }
    let mut changed = false;
    let updated: Vec<Element> = elements
        .iter()
        .map(|el| {
            let failed = el.is_initialized_image()
                && el.status != Some(FileStatus::Error)
                && el.file_id.as_ref().is_some_and(|id| errored.contains(id));
            if failed {
                changed = true;
                log::debug!("Marking image {} as errored", el.id);
                el.with_status(FileStatus::Error)
            } else {
                el.clone()
            }
        })
        .collect();
    changed.then_some(updated)
}
