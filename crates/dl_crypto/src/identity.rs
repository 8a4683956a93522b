//! Identity and device signing keys, plus device certificates.
//!
//! Each user holds one long-term ECDSA P-256 identity key pair. Each
//! device additionally holds its own ECDSA P-256 device key pair. A
//! `DeviceCert` is a canonical-JSON payload signed by the identity key,
//! binding the device's public key, device id, validity window, and
//! capabilities — so a compromised server cannot swap in a device key
//! without the identity owner's signature.
//!
//! Key-change policy (non-negotiable, enforced one layer up): if a
//! contact's identity public key changes, sending/receiving to that
//! contact halts until the user re-verifies the new safety number. This
//! module only produces and checks the key material; the halt-and-warn
//! behaviour lives in the layer that owns the trust-on-first-use store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canon::canonical_json;
use crate::error::CryptoError;
use crate::jwk::{verify_ecdsa_with_fallback, EcdsaKeyPair, Jwk};

/// What actions a device is authorised to perform.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub messaging: bool,
    pub contacts: bool,
    pub groups: bool,
    /// Rotating the identity key is only safe from a device that has
    /// this capability — typically the first device a user registers.
    pub identity_rotation: bool,
}

impl DeviceCapabilities {
    pub fn primary() -> Self {
        Self {
            messaging: true,
            contacts: true,
            groups: true,
            identity_rotation: true,
        }
    }

    pub fn secondary() -> Self {
        Self {
            messaging: true,
            contacts: true,
            groups: false,
            identity_rotation: false,
        }
    }
}

/// Proof that a device key belongs to an identity, signed by the
/// identity key over a canonical-JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCert {
    pub version: u8,
    pub device_id: String,
    pub user_id: String,
    pub device_signing_key: Jwk,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub capabilities: DeviceCapabilities,
    /// Base64 (standard) raw64 ECDSA signature over the canonical JSON
    /// of the remaining fields.
    pub signature: String,
}

const CERT_VERSION: u8 = 1;

impl DeviceCert {
    fn payload(
        device_id: &str,
        user_id: &str,
        device_signing_key: &Jwk,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        capabilities: &DeviceCapabilities,
    ) -> serde_json::Value {
        serde_json::json!({
            "capabilities": capabilities,
            "device_id": device_id,
            "device_signing_key": device_signing_key,
            "expires_at": expires_at.to_rfc3339(),
            "issued_at": issued_at.to_rfc3339(),
            "user_id": user_id,
            "version": CERT_VERSION,
        })
    }

    /// Issue a new device certificate, signed by the identity key.
    pub fn issue(
        identity: &EcdsaKeyPair,
        device_signing_key: &Jwk,
        device_id: &str,
        user_id: &str,
        valid_days: i64,
        capabilities: DeviceCapabilities,
    ) -> Result<Self, CryptoError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + chrono::Duration::days(valid_days);

        let payload = Self::payload(
            device_id,
            user_id,
            device_signing_key,
            issued_at,
            expires_at,
            &capabilities,
        );
        let signature = identity.sign_raw64_b64(canonical_json(&payload).as_bytes());

        Ok(DeviceCert {
            version: CERT_VERSION,
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            device_signing_key: device_signing_key.clone(),
            issued_at,
            expires_at,
            capabilities,
            signature,
        })
    }

    /// Verify this cert against the identity public key, including
    /// expiry. Does not check revocation — that is a store-level concern.
    pub fn verify(&self, identity_public: &Jwk) -> Result<(), CryptoError> {
        let payload = Self::payload(
            &self.device_id,
            &self.user_id,
            &self.device_signing_key,
            self.issued_at,
            self.expires_at,
            &self.capabilities,
        );
        let sig_bytes = crate::canon::from_b64(&self.signature)?;
        verify_ecdsa_with_fallback(identity_public, canonical_json(&payload).as_bytes(), &sig_bytes)?;

        if Utc::now() > self.expires_at {
            return Err(CryptoError::CertificateValidation("certificate has expired".into()));
        }
        if self.version != CERT_VERSION {
            return Err(CryptoError::CertificateValidation("unknown certificate version".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_round_trip() {
        let identity = EcdsaKeyPair::generate();
        let device = EcdsaKeyPair::generate();
        let cert = DeviceCert::issue(
            &identity,
            &device.public_jwk(),
            "device-1",
            "user-1",
            30,
            DeviceCapabilities::primary(),
        )
        .unwrap();
        cert.verify(&identity.public_jwk()).unwrap();
    }

    #[test]
    fn verify_fails_under_wrong_identity() {
        let identity = EcdsaKeyPair::generate();
        let impostor = EcdsaKeyPair::generate();
        let device = EcdsaKeyPair::generate();
        let cert = DeviceCert::issue(
            &identity,
            &device.public_jwk(),
            "device-1",
            "user-1",
            30,
            DeviceCapabilities::secondary(),
        )
        .unwrap();
        assert!(cert.verify(&impostor.public_jwk()).is_err());
    }

    #[test]
    fn verify_fails_once_expired() {
        let identity = EcdsaKeyPair::generate();
        let device = EcdsaKeyPair::generate();
        let mut cert = DeviceCert::issue(
            &identity,
            &device.public_jwk(),
            "device-1",
            "user-1",
            30,
            DeviceCapabilities::primary(),
        )
        .unwrap();
        cert.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(cert.verify(&identity.public_jwk()).is_err());
    }
}
