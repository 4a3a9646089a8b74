//! Encrypted scene records with optimistic read-modify-write.
//!
//! Record layout: `[u32 BE scene version][12-byte IV][ciphertext]`, where the
//! ciphertext is the JSON element array encrypted with the room key.

use super::{RemoteStore, StorageError, StorageResult};
use crate::crypto::{self, EncryptedData, IV_LENGTH_BYTES, RoomKey};
use crate::element::{Element, now_millis, scene_version, syncable_elements};
use crate::reconcile::{ReconcileContext, reconcile};
use crate::room::RoomLinkData;
use std::collections::HashMap;
use std::sync::Arc;

/// Bytes before the ciphertext: version prefix plus IV.
pub const RECORD_HEADER_BYTES: usize = 4 + IV_LENGTH_BYTES;

/// Build a stored record.
pub fn encode_record(version: u64, encrypted: &EncryptedData) -> Vec<u8> {
    let version = u32::try_from(version).unwrap_or(u32::MAX);
    let mut record = Vec::with_capacity(RECORD_HEADER_BYTES + encrypted.ciphertext.len());
    record.extend_from_slice(&version.to_be_bytes());
    record.extend_from_slice(&encrypted.iv);
    record.extend_from_slice(&encrypted.ciphertext);
    record
}

/// Split a stored record into `(version, iv, ciphertext)`.
pub fn decode_record(record: &[u8]) -> StorageResult<(u32, &[u8], &[u8])> {
    if record.len() < RECORD_HEADER_BYTES {
        return Err(StorageError::Corrupt(format!(
            "record of {} bytes is shorter than its header",
            record.len()
        )));
    }
    let (prefix, rest) = record.split_at(4);
    let (iv, ciphertext) = rest.split_at(IV_LENGTH_BYTES);
    let mut version = [0u8; 4];
    version.copy_from_slice(prefix);
    Ok((u32::from_be_bytes(version), iv, ciphertext))
}

fn encrypt_elements(key: &RoomKey, elements: &[Element]) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(elements)?;
    let encrypted = crypto::encrypt(key, &json)?;
    Ok(encode_record(scene_version(elements), &encrypted))
}

fn decrypt_payload(key: &RoomKey, iv: &[u8], ciphertext: &[u8]) -> StorageResult<Vec<Element>> {
    let plaintext = crypto::decrypt(key, iv, ciphertext)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

fn decrypt_elements(key: &RoomKey, record: &[u8]) -> StorageResult<Vec<Element>> {
    let (_, iv, ciphertext) = decode_record(record)?;
    decrypt_payload(key, iv, ciphertext)
}

/// Result of [`SceneStore::save`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Nothing changed since the last save or load.
    AlreadySaved,
    /// The stored record carries a newer scene version; nothing was written.
    RemoteNewer { version: u32 },
    /// Written; holds the local scene reconciled with the stored one.
    Stored(Vec<Element>),
}

/// Persists room scenes to a [`RemoteStore`].
pub struct SceneStore<R> {
    store: Arc<R>,
    deleted_element_timeout_ms: i64,
    /// Scene key -> scene version last written or read.
    saved_versions: HashMap<String, u64>,
}

impl<R: RemoteStore> SceneStore<R> {
    pub fn new(store: Arc<R>, deleted_element_timeout_ms: i64) -> Self {
        Self {
            store,
            deleted_element_timeout_ms,
            saved_versions: HashMap::new(),
        }
    }

    /// Whether `elements` is exactly what we last saved or loaded for the room.
    pub fn is_saved(&self, room: &RoomLinkData, elements: &[Element]) -> bool {
        self.saved_versions.get(&room.scene_key()) == Some(&scene_version(elements))
    }

    /// Save the local scene.
    ///
    /// The stored version is read from the record prefix before anything is
    /// decrypted. A strictly newer record is left alone and reported as
    /// [`SaveOutcome::RemoteNewer`]; the caller pulls it and saves again.
    /// Otherwise the local scene is reconciled with the stored one and written.
    pub async fn save(
        &mut self,
        room: &RoomLinkData,
        elements: &[Element],
        ctx: &ReconcileContext,
    ) -> StorageResult<SaveOutcome> {
        if self.is_saved(room, elements) {
            return Ok(SaveOutcome::AlreadySaved);
        }
        let key = room.scene_key();
        let local_version = scene_version(elements);

        let to_store = match self.store.get(&key).await {
            Err(StorageError::NotFound(_)) => elements.to_vec(),
            Err(e) => return Err(e),
            Ok(record) => {
                let (stored_version, iv, ciphertext) = decode_record(&record)?;
                if u64::from(stored_version) > local_version {
                    log::debug!(
                        "Stored scene for {} is newer ({} > {}), skipping save",
                        room.room_id,
                        stored_version,
                        local_version
                    );
                    return Ok(SaveOutcome::RemoteNewer {
                        version: stored_version,
                    });
                }
                let remote = decrypt_payload(&room.room_key, iv, ciphertext)?;
                let reconciled = reconcile(elements, &remote, ctx);
                syncable_elements(&reconciled, now_millis(), self.deleted_element_timeout_ms)
            }
        };

        let record = encrypt_elements(&room.room_key, &to_store)?;
        self.store.put(&key, record).await?;
        self.saved_versions.insert(key, scene_version(&to_store));
        log::debug!("Saved {} elements to room {}", to_store.len(), room.room_id);
        Ok(SaveOutcome::Stored(to_store))
    }

    /// Load the stored scene without merging. `None` when the room has no scene.
    pub async fn load(&mut self, room: &RoomLinkData) -> StorageResult<Option<Vec<Element>>> {
        let key = room.scene_key();
        match self.store.get(&key).await {
            Ok(record) => {
                let elements = decrypt_elements(&room.room_key, &record)?;
                self.saved_versions.insert(key, scene_version(&elements));
                Ok(Some(elements))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
