//! Identity manager (C3) — generate, rotate, and vend identity keys,
//! signed pre-keys, and one-time pre-keys; §4.3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dl_crypto::canon::from_b64;
use dl_crypto::jwk::{verify_ecdsa_with_fallback, EcdhKeyPair, EcdsaKeyPair, Jwk};
use dl_store::{IdentityRecord, OneTimePreKeyEntry, SecureStore, SignedPreKeyEntry, StoreError};

use crate::canonical::canonical_signed_prekey_payload;
use crate::constants::{DEFAULT_KEY_HISTORY_LIMIT, DEFAULT_KEY_MAX_AGE_MS, ONE_TIME_PREKEY_TARGET, SIGNED_PREKEY_HISTORY_LIMIT};
use crate::error::ProtoError;

/// A signed pre-key's public half, as published in a bundle — §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u64,
    pub public_key_jwk: Jwk,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub key_id: u64,
    pub public_key_jwk: Jwk,
}

/// One device's published bundle — §6 "Pre-key bundle list".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBundle {
    pub device_id: String,
    pub user_id: u64,
    pub identity_key_jwk: Jwk,
    pub identity_signing_public_key_jwk: Jwk,
    pub signed_pre_key: SignedPreKeyPublic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundleList {
    pub user_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub devices: Vec<DeviceBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Verify a device bundle's signed-pre-key signature under its own
/// advertised signing key. Called by both the initiator (§4.4 step 1)
/// and the orchestrator before trusting a fetched bundle.
pub fn verify_device_bundle(bundle: &DeviceBundle) -> Result<(), ProtoError> {
    let payload = canonical_signed_prekey_payload(&bundle.signed_pre_key.public_key_jwk);
    let sig_bytes = from_b64(&bundle.signed_pre_key.signature).map_err(dl_crypto::CryptoError::from)?;
    verify_ecdsa_with_fallback(
        &bundle.identity_signing_public_key_jwk,
        payload.as_bytes(),
        &sig_bytes,
    )
    .map_err(|_| ProtoError::BundleVerificationFailed)
}

/// `loadOrCreateIdentity` — §4.3. Generates a fresh identity (one signed
/// pre-key, `ONE_TIME_PREKEY_TARGET` one-time pre-keys) when none is
/// stored, private keys can't be re-imported, or the preferred device id
/// differs from what's stored — in all three cases this user's existing
/// sessions are wiped first.
///
/// A stored record that fails to hydrate (missing extractable private
/// keys) is the §7 **IdentityCorrupt** case: it is treated the same as
/// "absent", wiping sessions and regenerating rather than surfacing the
/// hydrate error.
pub async fn load_or_create_identity(
    store: &dyn SecureStore,
    user_id: u64,
    preferred_device_id: Option<&str>,
) -> Result<IdentityRecord, ProtoError> {
    let existing = match store.read_identity(user_id).await {
        Ok(existing) => existing,
        Err(StoreError::Crypto(_)) => {
            tracing::warn!(
                target: "dl_proto::identity",
                user_id,
                "identity record failed to hydrate, wiping sessions and regenerating"
            );
            store.delete_all_sessions_for_user(user_id).await?;
            None
        }
        Err(other) => return Err(other.into()),
    };

    match existing {
        Some(existing) if preferred_device_id.map(|d| d == existing.device_id).unwrap_or(true) => {
            Ok(existing)
        }
        Some(_) => {
            store.delete_all_sessions_for_user(user_id).await?;
            Ok(generate_identity(store, user_id, preferred_device_id).await?)
        }
        None => Ok(generate_identity(store, user_id, preferred_device_id).await?),
    }
}

async fn generate_identity(
    store: &dyn SecureStore,
    user_id: u64,
    preferred_device_id: Option<&str>,
) -> Result<IdentityRecord, ProtoError> {
    let device_id = preferred_device_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let identity_key = EcdhKeyPair::generate();
    let signing_key = EcdsaKeyPair::generate();
    let spk = EcdhKeyPair::generate();
    let signature = signing_key.sign_raw64_b64(canonical_signed_prekey_payload(&spk.public_jwk()).as_bytes());

    let one_time_pre_keys = (1..=ONE_TIME_PREKEY_TARGET as u64)
        .map(|key_id| OneTimePreKeyEntry {
            key_id,
            key_pair: EcdhKeyPair::generate(),
        })
        .collect();

    let record = IdentityRecord {
        user_id,
        device_id,
        identity_key,
        signing_key,
        signed_pre_keys: vec![SignedPreKeyEntry {
            key_id: 1,
            created_at: Utc::now(),
            key_pair: spk,
            signature,
        }],
        active_signed_pre_key_id: 1,
        one_time_pre_keys,
        next_one_time_pre_key_id: ONE_TIME_PREKEY_TARGET as u64 + 1,
        updated_at: Utc::now(),
    };
    store.write_identity(&record).await?;
    Ok(record)
}

/// `rotateIdentityIfNeeded` — §4.3. Idempotent.
pub async fn rotate_identity_if_needed(
    store: &dyn SecureStore,
    mut identity: IdentityRecord,
    max_age_ms: i64,
    history_limit: usize,
) -> Result<(IdentityRecord, bool), ProtoError> {
    let max_age_ms = if max_age_ms == 0 { DEFAULT_KEY_MAX_AGE_MS } else { max_age_ms };
    let history_limit = if history_limit == 0 { DEFAULT_KEY_HISTORY_LIMIT } else { history_limit };

    let mut rotated = false;

    let needs_new_spk = match identity.active_signed_pre_key() {
        None => true,
        Some(active) => {
            let age_ms = (Utc::now() - active.created_at).num_milliseconds();
            age_ms >= max_age_ms
        }
    } || identity.signing_key.public_jwk().signing_key_fingerprint().is_empty();

    if needs_new_spk {
        let next_key_id = identity.signed_pre_keys.iter().map(|spk| spk.key_id).max().unwrap_or(0) + 1;
        let spk = EcdhKeyPair::generate();
        let signature = identity
            .signing_key
            .sign_raw64_b64(canonical_signed_prekey_payload(&spk.public_jwk()).as_bytes());
        identity.signed_pre_keys.push(SignedPreKeyEntry {
            key_id: next_key_id,
            created_at: Utc::now(),
            key_pair: spk,
            signature,
        });
        let keep = SIGNED_PREKEY_HISTORY_LIMIT.min(history_limit.max(2));
        if identity.signed_pre_keys.len() > keep {
            let drop_count = identity.signed_pre_keys.len() - keep;
            identity.signed_pre_keys.drain(0..drop_count);
        }
        identity.active_signed_pre_key_id = next_key_id;
        rotated = true;
    }

    let target = ONE_TIME_PREKEY_TARGET.min(24.max(history_limit * 16));
    if identity.one_time_pre_keys.len() < target {
        let missing = target - identity.one_time_pre_keys.len();
        let mut next_id = identity.next_one_time_pre_key_id;
        for _ in 0..missing {
            identity.one_time_pre_keys.push(OneTimePreKeyEntry {
                key_id: next_id,
                key_pair: EcdhKeyPair::generate(),
            });
            next_id += 1;
        }
        identity.next_one_time_pre_key_id = next_id;
        rotated = true;
    }

    if rotated {
        identity.updated_at = Utc::now();
        store.write_identity(&identity).await?;
    }
    Ok((identity, rotated))
}

/// `toSignalPreKeyBundleUpload` — §4.3: the public-only view published
/// for others to fetch.
pub fn to_signal_pre_key_bundle_upload(identity: &IdentityRecord) -> Result<DeviceBundle, ProtoError> {
    let active = identity
        .active_signed_pre_key()
        .ok_or_else(|| ProtoError::IdentityCorrupt("identity has no active signed pre-key".into()))?;
    Ok(DeviceBundle {
        device_id: identity.device_id.clone(),
        user_id: identity.user_id,
        identity_key_jwk: identity.identity_key.public_jwk(),
        identity_signing_public_key_jwk: identity.signing_key.public_jwk(),
        signed_pre_key: SignedPreKeyPublic {
            key_id: active.key_id,
            public_key_jwk: active.key_pair.public_jwk(),
            signature: active.signature.clone(),
        },
        one_time_pre_key: identity.one_time_pre_keys.first().map(|opk| OneTimePreKeyPublic {
            key_id: opk.key_id,
            public_key_jwk: opk.key_pair.public_jwk(),
        }),
        updated_at: Some(identity.updated_at),
    })
}

/// `consumeOneTimePreKey` — §4.3. Idempotent if the key is already gone.
pub async fn consume_one_time_pre_key(
    store: &dyn SecureStore,
    identity: &mut IdentityRecord,
    key_id: u64,
) -> Result<(), ProtoError> {
    identity.consume_one_time_pre_key(key_id);
    store.write_identity(identity).await?;
    Ok(())
}
