//! HKDF-SHA256 and HMAC-SHA256 key derivation primitives used by X3DH
//! (§4.4) and the double-ratchet engine (§4.5). Password/vault key
//! derivation is a concrete-store concern and out of scope here (§1: the
//! persistent KV store is an external collaborator, only its contract
//! matters).

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 with explicit salt, returning `out_len` bytes of output
/// key material.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// `kdfRK(rootKey, dhSecret)` — §4.5: HKDF(dhSecret, salt=rootKey,
/// info="e2ee-chat-dr-rk-v1", L=64) -> (newRootKey, chainKey), each 32
/// bytes.
pub fn kdf_rk(root_key: &[u8; 32], dh_secret: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let okm = hkdf_expand(dh_secret, root_key, b"e2ee-chat-dr-rk-v1", 64)?;
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((new_root, chain))
}

/// `kdfCK(chainKey)` — §4.5: (nextChainKey = HMAC(chainKey, 0x01),
/// messageKey = HMAC(chainKey, 0x02)).
pub fn kdf_ck(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let next = hmac_sha256(chain_key, &[0x01]);
    let message_key = hmac_sha256(chain_key, &[0x02]);
    (next, message_key)
}
