//! Activation blob crypto.
//!
//! The activation record is stored as opaque bytes: a random 24-byte nonce
//! followed by the XChaCha20-Poly1305 ciphertext of the UTF-8 JSON record.
//! The key is fixed per deployment, derived as sha256 of the shared secret;
//! its url-safe base64 form is the exportable representation.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 24;

pub fn derive_blob_key(secret: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(Sha256::digest(secret.as_bytes()).to_vec())
}

pub fn blob_key_b64(key: &[u8]) -> String {
    general_purpose::URL_SAFE.encode(key)
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// `nonce || ciphertext` of the plaintext.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn open_blob(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() <= NONCE_LEN {
        return Err(anyhow!("blob too short"));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("decrypt: {e}"))
}
