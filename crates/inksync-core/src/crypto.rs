//! Symmetric AEAD encryption for room payloads.
//!
//! AES-128-GCM with a fresh random 12-byte IV per message. The IV travels next
//! to the ciphertext; tampering with either fails decryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Length of the initialization vector prepended to stored payloads.
pub const IV_LENGTH_BYTES: usize = 12;

/// Raw room key length (128-bit AES).
pub const ROOM_KEY_BYTES: usize = 16;

/// Encryption errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid room key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
}

/// Symmetric key shared by everyone holding the room link.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; ROOM_KEY_BYTES]);

impl RoomKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ROOM_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Parse the URL-safe base64 form used in room links.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; ROOM_KEY_BYTES] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", ROOM_KEY_BYTES, v.len())))?;
        Ok(Self(bytes))
    }

    /// URL-safe base64 form (22 characters).
    pub fn encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(&self.0.into())
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Ciphertext and the IV it was produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under a fresh random IV.
pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<EncryptedData, CryptoError> {
    let mut iv = [0u8; IV_LENGTH_BYTES];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(EncryptedData {
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Decrypt and authenticate. Fails on a wrong key, wrong IV or corrupted data.
pub fn decrypt(key: &RoomKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LENGTH_BYTES {
        return Err(CryptoError::Decrypt);
    }
    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
