//! Stable JSON canonicalization, base64/hex helpers, and ECDSA signature
//! transcoding (DER <-> fixed-width r||s).
//!
//! Canonicalization correctness is security-critical: every signed payload
//! in this crate (pre-key signatures, envelope signatures, ack signatures)
//! is signed over the byte-exact output of [`canonical_json`]. Two
//! semantically-equal JSON values that differ only in member order or
//! insignificant whitespace must canonicalize to identical bytes.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ecdsa::signature::SignatureEncoding;
use p256::ecdsa::Signature;
use serde_json::Value;

use crate::error::CryptoError;

/// Recursively sort object keys (code-point order) and emit compact JSON
/// with no insignificant whitespace. Arrays preserve their element order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string keys always serialize"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Numbers, strings, bools, and null all serialize canonically via
        // serde_json already — no superfluous exponents, no trailing zeros.
        other => out.push_str(&serde_json::to_string(other).expect("value serializes")),
    }
}

/// UTF-8 bytes of [`canonical_json`], the form every signature is computed
/// over.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

pub fn to_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn from_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(B64.decode(s)?)
}

/// Concatenate buffers in the given order. Used for X3DH's fixed
/// DH1‖DH2‖DH3[‖DH4] IKM construction.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// If `sig` is already 64 bytes (raw r||s), return it unchanged; otherwise
/// attempt a DER -> raw64 transcode. On failure, return the original bytes
/// so the caller can still try verifying with them directly.
pub fn normalize_ecdsa_signature_for_transport(sig: &[u8]) -> Vec<u8> {
    if sig.len() == 64 {
        return sig.to_vec();
    }
    match der_to_raw64(sig) {
        Ok(raw) => raw.to_vec(),
        Err(_) => sig.to_vec(),
    }
}

pub fn der_to_raw64(der: &[u8]) -> Result<[u8; 64], CryptoError> {
    let sig = Signature::from_der(der)
        .map_err(|e| CryptoError::InvalidKey(format!("bad DER signature: {e}")))?;
    let mut out = [0u8; 64];
    out.copy_from_slice(sig.to_bytes().as_slice());
    Ok(out)
}

pub fn raw64_to_der(raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sig = Signature::from_slice(raw)
        .map_err(|e| CryptoError::InvalidKey(format!("bad raw64 signature: {e}")))?;
    Ok(sig.to_der().to_vec())
}

/// Grouped-digit rendering of a canonical JWK string, in the style of
/// Signal "safety numbers" — for human-verifiable identity comparison.
/// This is not part of any signature payload; it is a display aid.
pub fn numeric_fingerprint(canonical: &str) -> String {
    let digest = blake3::hash(canonical.as_bytes());
    let bytes = digest.as_bytes();
    let mut groups = Vec::with_capacity(12);
    for chunk in bytes.chunks(2).take(12) {
        let n = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]) % 100_000;
        groups.push(format!("{n:05}"));
    }
    groups.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": 2, "y": [3, 2, 1]}});
        let b = json!({"a": {"y": [3, 2, 1], "z": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[3,2,1],"z":2},"b":1}"#);
    }

    #[test]
    fn canonical_json_has_no_insignificant_whitespace() {
        let v = json!({"x": "y"});
        assert_eq!(canonical_json(&v), r#"{"x":"y"}"#);
    }

    #[test]
    fn der_raw64_roundtrip() {
        use p256::ecdsa::signature::Signer;
        use p256::ecdsa::SigningKey;
        use rand::rngs::OsRng;

        let sk = SigningKey::random(&mut OsRng);
        let sig: Signature = sk.sign(b"hello");
        let raw = sig.to_bytes();
        let der = raw64_to_der(&raw).unwrap();
        let back = der_to_raw64(&der).unwrap();
        assert_eq!(&back[..], &raw[..]);
    }

    #[test]
    fn normalize_is_idempotent_on_raw64() {
        let raw = [7u8; 64];
        assert_eq!(normalize_ecdsa_signature_for_transport(&raw), raw.to_vec());
    }
}
