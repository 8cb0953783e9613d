//! AEAD primitives shared by KEK wrapping and DEK use.
//!
//! Sealed values are `nonce || ciphertext` with a 12-byte random nonce.

use crate::KeyManagementError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const ALGORITHM: &str = "CHACHA20-POLY1305";

/// Master key-encryption key, supplied from outside and never persisted.
#[derive(Clone)]
pub struct KeyEncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl KeyEncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Accepts exactly 32 raw bytes or the base64 form of 32 bytes, ignoring
    /// surrounding whitespace.
    pub fn from_data(data: &[u8]) -> Result<Self, KeyManagementError> {
        if data.len() == KEY_SIZE {
            let mut bytes = [0u8; KEY_SIZE];
            bytes.copy_from_slice(data);
            return Ok(Self { bytes });
        }

        let trimmed = Zeroizing::new(
            data.iter()
                .copied()
                .filter(|byte| !byte.is_ascii_whitespace())
                .collect::<Vec<_>>(),
        );
        Self::decode_base64(&trimmed)
    }

    /// Base64 only, as carried in an environment variable.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyManagementError> {
        Self::decode_base64(encoded.trim().as_bytes())
    }

    fn decode_base64(encoded: &[u8]) -> Result<Self, KeyManagementError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded).map_err(|_| {
            KeyManagementError::InvalidKek {
                reason: format!("expected {KEY_SIZE} raw bytes or base64"),
            }
        })?);
        if decoded.len() != KEY_SIZE {
            return Err(KeyManagementError::InvalidKek {
                reason: format!("decoded KEK is {} bytes, expected {KEY_SIZE}", decoded.len()),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for KeyEncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyEncryptionKey([REDACTED])")
    }
}

/// Plaintext data-encryption key. Zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, KeyManagementError> {
        if data.len() != KEY_SIZE {
            return Err(KeyManagementError::Crypto(format!(
                "data key is {} bytes, expected {KEY_SIZE}",
                data.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(data);
        Ok(Self { bytes })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyManagementError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|err| KeyManagementError::Crypto(format!("invalid base64 key: {err}")))?,
        );
        Self::from_slice(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

pub(crate) fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|err| KeyManagementError::Crypto(format!("encryption failed: {err}")))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// `None` when the value is malformed or fails authentication.
pub(crate) fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .ok()
        .map(Zeroizing::new)
}

/// Encrypts backup payload bytes under a DEK.
pub fn encrypt_with(dek: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
    seal(dek.as_bytes(), plaintext)
}

pub fn decrypt_with(dek: &DataKey, sealed: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
    open(dek.as_bytes(), sealed)
        .map(|plaintext| plaintext.to_vec())
        .ok_or_else(|| {
            KeyManagementError::Crypto("payload failed authentication under this key".to_string())
        })
}
