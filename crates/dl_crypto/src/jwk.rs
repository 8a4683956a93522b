//! P-256 key pairs, JWK (JSON Web Key) import/export, and ECDSA
//! sign/verify with raw64 <-> DER dual-form fallback.
//!
//! JWK is the on-the-wire and on-disk representation for every P-256
//! public key in this crate, matching the shape `window.crypto.subtle`
//! produces so a browser-side peer can interop.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use ecdsa::signature::{Signer, SignatureEncoding, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::canon::{canonical_json, der_to_raw64, to_b64};
use crate::error::CryptoError;

pub const CRV_P256: &str = "P-256";

/// A P-256 public (and, optionally, private) key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    /// Private scalar, base64url. Present only for JWK-only persisted
    /// shapes (see dl_store); never sent on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// `kty|crv|x|y` — coordinate identity used for DH-public comparisons
    /// and the skipped-key cache key. Deliberately not a hash: §4.1 defines
    /// this as a literal string, not a digest.
    pub fn ratchet_key_fingerprint(&self) -> String {
        format!("{}|{}|{}|{}", self.kty, self.crv, self.x, self.y)
    }

    /// Stable JSON of the full JWK (public-only view). Used to detect a
    /// change in a peer's signing key.
    pub fn signing_key_fingerprint(&self) -> String {
        let public_only = Jwk {
            d: None,
            ..self.clone()
        };
        canonical_json(&serde_json::to_value(&public_only).expect("Jwk serializes"))
    }

    /// Signal-style grouped-digit safety number for this key, derived from
    /// its canonical public JWK. Not part of any signed payload.
    pub fn numeric_fingerprint(&self) -> String {
        crate::canon::numeric_fingerprint(&self.signing_key_fingerprint())
    }

    pub fn is_p256(&self) -> bool {
        self.kty == "EC" && self.crv == CRV_P256
    }
}

fn sec1_to_jwk(sec1: &[u8], d: Option<[u8; 32]>) -> Result<Jwk, CryptoError> {
    if sec1.len() != 65 || sec1[0] != 0x04 {
        return Err(CryptoError::InvalidKey(
            "expected 65-byte uncompressed SEC1 point".into(),
        ));
    }
    Ok(Jwk {
        kty: "EC".into(),
        crv: CRV_P256.into(),
        x: B64URL.encode(&sec1[1..33]),
        y: B64URL.encode(&sec1[33..65]),
        d: d.map(|bytes| B64URL.encode(bytes)),
    })
}

fn jwk_to_sec1(jwk: &Jwk) -> Result<Vec<u8>, CryptoError> {
    if !jwk.is_p256() {
        return Err(CryptoError::WrongCurve);
    }
    let x = B64URL
        .decode(&jwk.x)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid JWK x: {e}")))?;
    let y = B64URL
        .decode(&jwk.y)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid JWK y: {e}")))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(CryptoError::InvalidKey(
            "JWK x/y must be 32 bytes each for P-256".into(),
        ));
    }
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    Ok(sec1)
}

pub fn public_key_from_jwk(jwk: &Jwk) -> Result<PublicKey, CryptoError> {
    let sec1 = jwk_to_sec1(jwk)?;
    let point = EncodedPoint::from_bytes(&sec1)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid SEC1 point: {e}")))?;
    Option::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| CryptoError::InvalidKey("public key is not on curve".into()))
}

pub fn public_key_to_jwk(pk: &PublicKey) -> Jwk {
    let sec1 = pk.to_encoded_point(false).as_bytes().to_vec();
    sec1_to_jwk(&sec1, None).expect("freshly-encoded point is always well-formed")
}

/// An ECDH P-256 key pair. The private scalar is held by `p256::SecretKey`,
/// which zeroizes on drop.
///
/// Cloneable deliberately: a ratchet session's initial sending key is
/// seeded from the identity's long-lived signed pre-key, which must
/// remain independently owned by the identity record.
#[derive(Clone)]
pub struct EcdhKeyPair {
    secret: SecretKey,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn public_jwk(&self) -> Jwk {
        public_key_to_jwk(&self.public_key())
    }

    /// Export including the private scalar — used only for the JWK-only
    /// on-disk persisted shape (§4.2).
    pub fn to_jwk(&self) -> Jwk {
        let sec1 = self.public_key().to_encoded_point(false).as_bytes().to_vec();
        let mut d = [0u8; 32];
        d.copy_from_slice(&self.secret.to_bytes());
        let jwk = sec1_to_jwk(&sec1, Some(d)).expect("well-formed point");
        d.zeroize();
        jwk
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        let d_b64 = jwk
            .d
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey("JWK has no private scalar".into()))?;
        let mut d = B64URL
            .decode(d_b64)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid JWK d: {e}")))?;
        let secret = SecretKey::from_bytes(d.as_slice().into())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid ECDH private scalar: {e}")))?;
        d.zeroize();
        Ok(Self { secret })
    }

    /// P-256 ECDH. Returns the 32-byte X-coordinate of the shared point,
    /// per §4.4 "All DH outputs are 32 bytes".
    pub fn dh(&self, peer_public: &PublicKey) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(peer_public);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        out
    }
}

/// An ECDSA P-256 signing key pair.
pub struct EcdsaKeyPair {
    signing: SigningKey,
}

impl EcdsaKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    pub fn public_jwk(&self) -> Jwk {
        let sec1 = self
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        sec1_to_jwk(&sec1, None).expect("well-formed point")
    }

    pub fn to_jwk(&self) -> Jwk {
        let mut d = [0u8; 32];
        d.copy_from_slice(&self.signing.to_bytes());
        let sec1 = self
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let jwk = sec1_to_jwk(&sec1, Some(d)).expect("well-formed point");
        d.zeroize();
        jwk
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        let d_b64 = jwk
            .d
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey("JWK has no private scalar".into()))?;
        let mut d = B64URL
            .decode(d_b64)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid JWK d: {e}")))?;
        let signing = SigningKey::from_bytes(d.as_slice().into())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid signing scalar: {e}")))?;
        d.zeroize();
        Ok(Self { signing })
    }

    /// Sign `msg`, returning a 64-byte raw r||s signature, base64-encoded.
    pub fn sign_raw64_b64(&self, msg: &[u8]) -> String {
        let sig: Signature = self.signing.sign(msg);
        to_b64(&sig.to_bytes())
    }
}

/// Verify `sig_bytes` (raw64 or DER) against `msg` under `verifying_jwk`.
/// Tries the bytes as given, then their transcoded alternate form, per
/// P9's dual-form verification requirement.
pub fn verify_ecdsa_with_fallback(
    verifying_jwk: &Jwk,
    msg: &[u8],
    sig_bytes: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from(public_key_from_jwk(verifying_jwk)?);
    if try_verify(&vk, msg, sig_bytes) {
        return Ok(());
    }
    let alternate = if sig_bytes.len() == 64 {
        crate::canon::raw64_to_der(sig_bytes).ok()
    } else {
        der_to_raw64(sig_bytes).ok().map(|r| r.to_vec())
    };
    if let Some(alt) = alternate {
        if try_verify(&vk, msg, &alt) {
            return Ok(());
        }
    }
    Err(CryptoError::SignatureVerification)
}

fn try_verify(vk: &VerifyingKey, msg: &[u8], sig_bytes: &[u8]) -> bool {
    let sig = if sig_bytes.len() == 64 {
        Signature::from_slice(sig_bytes)
    } else {
        Signature::from_der(sig_bytes)
    };
    match sig {
        Ok(sig) => vk.verify(msg, &sig).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_jwk_roundtrip() {
        let kp = EcdhKeyPair::generate();
        let jwk = kp.public_jwk();
        let pk = public_key_from_jwk(&jwk).unwrap();
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn ecdh_private_jwk_roundtrip() {
        let kp = EcdhKeyPair::generate();
        let jwk = kp.to_jwk();
        let restored = EcdhKeyPair::from_jwk(&jwk).unwrap();
        assert_eq!(restored.public_key(), kp.public_key());
    }

    #[test]
    fn dh_is_symmetric() {
        let a = EcdhKeyPair::generate();
        let b = EcdhKeyPair::generate();
        assert_eq!(a.dh(&b.public_key()), b.dh(&a.public_key()));
    }

    #[test]
    fn ecdsa_sign_and_verify() {
        let kp = EcdsaKeyPair::generate();
        let jwk = kp.public_jwk();
        let sig = kp.sign_raw64_b64(b"hello");
        let raw = crate::canon::from_b64(&sig).unwrap();
        verify_ecdsa_with_fallback(&jwk, b"hello", &raw).unwrap();
    }

    #[test]
    fn ecdsa_dual_form_verification() {
        let kp = EcdsaKeyPair::generate();
        let jwk = kp.public_jwk();
        let sig = kp.sign_raw64_b64(b"payload");
        let raw = crate::canon::from_b64(&sig).unwrap();
        let der = crate::canon::raw64_to_der(&raw).unwrap();
        verify_ecdsa_with_fallback(&jwk, b"payload", &raw).unwrap();
        verify_ecdsa_with_fallback(&jwk, b"payload", &der).unwrap();
    }

    #[test]
    fn ecdsa_wrong_key_fails() {
        let kp1 = EcdsaKeyPair::generate();
        let kp2 = EcdsaKeyPair::generate();
        let sig = kp1.sign_raw64_b64(b"payload");
        let raw = crate::canon::from_b64(&sig).unwrap();
        assert!(verify_ecdsa_with_fallback(&kp2.public_jwk(), b"payload", &raw).is_err());
    }

    #[test]
    fn fingerprint_differs_for_different_keys() {
        let a = EcdhKeyPair::generate().public_jwk();
        let b = EcdhKeyPair::generate().public_jwk();
        assert_ne!(a.ratchet_key_fingerprint(), b.ratchet_key_fingerprint());
    }
}
