//! Passphrase-sealed container for disaster-recovery key exports.
//!
//! Layout: 8-byte magic, 1-byte format version, 12-byte nonce, then the
//! ChaCha20-Poly1305 ciphertext of the JSON document. The AEAD key is
//! PBKDF2-HMAC-SHA256 over the passphrase with a fixed salt.

use crate::envelope::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::KeyManagementError;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const BUNDLE_MAGIC: &[u8; 8] = b"BSTNKEYS";
pub const BUNDLE_FORMAT_VERSION: u8 = 1;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const BUNDLE_SALT: &[u8] = b"bastion-dr-export-v1";
const HEADER_SIZE: usize = BUNDLE_MAGIC.len() + 1 + NONCE_SIZE;

fn derive_bundle_key(passphrase: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>, KeyManagementError> {
    if passphrase.is_empty() {
        return Err(KeyManagementError::InvalidPassphrase);
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        BUNDLE_SALT,
        PBKDF2_ITERATIONS,
        key.as_mut_slice(),
    );
    Ok(key)
}

pub fn seal_bundle(document: &[u8], passphrase: &str) -> Result<Vec<u8>, KeyManagementError> {
    let key = derive_bundle_key(passphrase)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new((&*key).into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), document)
        .map_err(|err| KeyManagementError::Crypto(format!("bundle encryption failed: {err}")))?;

    let mut sealed = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    sealed.extend_from_slice(BUNDLE_MAGIC);
    sealed.push(BUNDLE_FORMAT_VERSION);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Returns the plaintext JSON document; it is zeroed when dropped.
pub fn open_bundle(sealed: &[u8], passphrase: &str) -> Result<Zeroizing<Vec<u8>>, KeyManagementError> {
    if sealed.len() < HEADER_SIZE + TAG_SIZE {
        return Err(KeyManagementError::BundleFormat {
            reason: format!("bundle is only {} bytes", sealed.len()),
        });
    }
    let (magic, rest) = sealed.split_at(BUNDLE_MAGIC.len());
    if magic != BUNDLE_MAGIC {
        return Err(KeyManagementError::BundleFormat {
            reason: "missing bundle magic".to_string(),
        });
    }
    if rest[0] != BUNDLE_FORMAT_VERSION {
        return Err(KeyManagementError::BundleFormat {
            reason: format!("unsupported bundle format version {}", rest[0]),
        });
    }
    let (nonce, ciphertext) = rest[1..].split_at(NONCE_SIZE);

    let key = derive_bundle_key(passphrase)?;
    let cipher = ChaCha20Poly1305::new((&*key).into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| KeyManagementError::BundleDecrypt)
}
