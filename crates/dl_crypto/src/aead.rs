//! AES-256-GCM authenticated encryption.
//!
//! Key size: 32 bytes. IV: 12 bytes (random, generated fresh per call).
//! Tag: 16 bytes, appended by the `aes-gcm` crate into its ciphertext
//! output. Every envelope field that carries ciphertext also carries its
//! IV as a separate sibling field (`messageIv`, wrapped-key `iv`) rather
//! than a prepended-nonce wire format — the IV is part of the signed
//! envelope, not the opaque ciphertext blob.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;

pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// A fresh random 12-byte AES-GCM IV. Must never be reused under the same
/// key.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// A fresh random 32-byte content key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn encrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)
}

pub fn decrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::AeadDecrypt)
}

/// Wrap a 32-byte content/message key under another 32-byte key, with a
/// fresh IV. Returns `(iv, wrapped)`.
pub fn wrap_key(wrap_key: &[u8; KEY_LEN], key_to_wrap: &[u8; KEY_LEN]) -> Result<([u8; IV_LEN], Vec<u8>), CryptoError> {
    let iv = generate_iv();
    let wrapped = encrypt(wrap_key, &iv, key_to_wrap)?;
    Ok((iv, wrapped))
}

pub fn unwrap_key(wrap_key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], wrapped: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let plaintext = decrypt(wrap_key, iv, wrapped)?;
    if plaintext.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey("unwrapped key has the wrong length".into()));
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&plaintext);
    Ok(out)
}
