//! Envelope codec (C6) — §4.6. AES-GCM content encryption, per-recipient
//! message-key wrapping, and ECDSA-signed canonicalized envelopes.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use dl_crypto::aead::{self, IV_LEN};
use dl_crypto::canon::{from_b64, to_b64};
use dl_crypto::jwk::{public_key_from_jwk, public_key_to_jwk, verify_ecdsa_with_fallback, Jwk};
use dl_store::{IdentityRecord, PendingPreKey, RatchetSessionRecord, SecureStore};

use crate::canonical::{canonical_ack_payload, canonical_cipher_payload};
use crate::constants::{DR_SESSION_VERSION, PENDING_PREKEY_MESSAGE_LIMIT};
use crate::error::ProtoError;
use crate::ratchet_session::{bootstrap_responder, init_self_session};

pub const ENCRYPTION_SCHEME: &str = "DOUBLE_RATCHET_V1";
pub const ENVELOPE_VERSION: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub iv: String,
    pub wrapped_key: String,
    pub ratchet_dh_public_key_jwk: Jwk,
    pub message_number: u64,
    pub previous_chain_length: u64,
    pub session_version: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_key_message: Option<PendingPreKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub message_iv: String,
    pub wrapped_keys: HashMap<String, WrappedKey>,
    pub sender_public_key_jwk: Jwk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_signing_public_key_jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_scheme: Option<String>,
    pub version: u8,
    pub signature: String,
}

fn address(user_id: u64, device_id: &str) -> String {
    format!("{user_id}:{device_id}")
}

/// `encryptForRecipients` — §4.6.
pub async fn encrypt_for_recipients(
    store: &dyn SecureStore,
    identity: &IdentityRecord,
    sender_device_id: &str,
    plaintext: &str,
    recipients: &[(u64, String)],
) -> Result<Envelope, ProtoError> {
    if plaintext.trim().is_empty() {
        return Err(ProtoError::PreconditionFailed("plaintext must not be empty".into()));
    }

    let content_key = aead::generate_key();
    let message_iv = aead::generate_iv();
    let ciphertext = aead::encrypt(&content_key, &message_iv, plaintext.as_bytes())?;

    let mut wrapped_keys = HashMap::new();
    let mut missing = Vec::new();

    for (peer_user_id, peer_device_id) in recipients {
        let is_self = *peer_user_id == identity.user_id && peer_device_id == sender_device_id;
        let existing = if is_self {
            store
                .read_session(identity.user_id, sender_device_id, identity.user_id, sender_device_id)
                .await?
        } else {
            store
                .read_session(identity.user_id, sender_device_id, *peer_user_id, peer_device_id)
                .await?
        };

        let mut session = match existing {
            Some(session) => session,
            None if is_self => {
                let fresh = init_self_session(identity);
                store.write_session(&fresh).await?;
                fresh
            }
            None => {
                missing.push(address(*peer_user_id, peer_device_id));
                continue;
            }
        };

        let (message_key, header) = session.engine.prepare_send();
        let (iv, wrapped) = aead::wrap_key(&message_key, &content_key)?;

        let pre_key_message = session.pending_pre_key.clone();
        if session.pending_pre_key.is_some() && session.engine.send_count >= PENDING_PREKEY_MESSAGE_LIMIT {
            session.pending_pre_key = None;
        }
        session.updated_at = Utc::now();
        store.write_session(&session).await?;

        wrapped_keys.insert(
            address(*peer_user_id, peer_device_id),
            WrappedKey {
                iv: to_b64(&iv),
                wrapped_key: to_b64(&wrapped),
                ratchet_dh_public_key_jwk: public_key_to_jwk(&header.dh_pub),
                message_number: header.message_number,
                previous_chain_length: header.previous_chain_length,
                session_version: DR_SESSION_VERSION,
                pre_key_message,
            },
        );
    }

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(ProtoError::SessionNotReady { missing });
    }
    if wrapped_keys.is_empty() {
        return Err(ProtoError::NoRecipientReady);
    }

    let mut envelope = Envelope {
        ciphertext: to_b64(&ciphertext),
        message_iv: to_b64(&message_iv),
        wrapped_keys,
        sender_public_key_jwk: identity.identity_key.public_jwk(),
        sender_signing_public_key_jwk: Some(identity.signing_key.public_jwk()),
        sender_device_id: Some(sender_device_id.to_string()),
        content_type: Some("text/plain".to_string()),
        encryption_scheme: Some(ENCRYPTION_SCHEME.to_string()),
        version: ENVELOPE_VERSION,
        signature: String::new(),
    };
    let payload = canonical_cipher_payload(&envelope);
    envelope.signature = identity.signing_key.sign_raw64_b64(payload.as_bytes());
    Ok(envelope)
}

/// `decryptPayload` — §4.6.
pub async fn decrypt_payload(
    store: &dyn SecureStore,
    local: &mut IdentityRecord,
    local_device_id: &str,
    sender_user_id: u64,
    sender_device_id: &str,
    env: &Envelope,
) -> Result<String, ProtoError> {
    if env.encryption_scheme.as_deref() == Some(ENCRYPTION_SCHEME)
        && (env.signature.is_empty() || env.sender_signing_public_key_jwk.is_none())
    {
        return Err(ProtoError::SignatureVerificationFailed);
    }
    if let Some(signing_jwk) = &env.sender_signing_public_key_jwk {
        let payload = canonical_cipher_payload(env);
        let sig_bytes = from_b64(&env.signature).map_err(dl_crypto::CryptoError::from)?;
        verify_ecdsa_with_fallback(signing_jwk, payload.as_bytes(), &sig_bytes)
            .map_err(|_| ProtoError::SignatureVerificationFailed)?;
    }

    let addr = address(local.user_id, local_device_id);
    let wrapper = env
        .wrapped_keys
        .get(&addr)
        .ok_or_else(|| ProtoError::SessionNotReady { missing: vec![addr.clone()] })?;

    let is_self = sender_user_id == local.user_id && sender_device_id == local_device_id;

    let mut session = if is_self {
        match store
            .read_session(local.user_id, local_device_id, local.user_id, local_device_id)
            .await?
        {
            Some(session) => session,
            None => {
                let fresh = init_self_session(local);
                store.write_session(&fresh).await?;
                fresh
            }
        }
    } else {
        let existing = store
            .read_session(local.user_id, local_device_id, sender_user_id, sender_device_id)
            .await?;
        match existing {
            Some(session) => session,
            None => match &wrapper.pre_key_message {
                Some(header) => bootstrap_responder(store, local, header, sender_user_id, sender_device_id).await?,
                None => {
                    return Err(ProtoError::SessionNotReady {
                        missing: vec![format!("{sender_user_id}:{sender_device_id}")],
                    })
                }
            },
        }
    };

    if !is_self {
        if let Some(incoming) = &env.sender_signing_public_key_jwk {
            if incoming.signing_key_fingerprint() != session.peer_signing_key.signing_key_fingerprint() {
                tracing::warn!(target: "dl_proto::envelope", sender_user_id, "peer signing key changed, adopting new key");
                session.peer_signing_key = incoming.clone();
            }
        }
    }

    let header_dh = public_key_from_jwk(&wrapper.ratchet_dh_public_key_jwk)?;
    let message_key = match session.engine.derive_receive(
        wrapper.message_number,
        wrapper.previous_chain_length,
        if is_self { None } else { Some(&header_dh) },
    ) {
        Ok(key) => key,
        Err(err) => {
            if let (Some(header), false) = (&wrapper.pre_key_message, is_self) {
                session = bootstrap_responder(store, local, header, sender_user_id, sender_device_id).await?;
                session
                    .engine
                    .derive_receive(wrapper.message_number, wrapper.previous_chain_length, Some(&header_dh))
                    .map_err(map_ratchet_err)?
            } else {
                return Err(map_ratchet_err(err));
            }
        }
    };

    let wrapper_iv = decode_iv(&wrapper.iv)?;
    let wrapped_bytes = from_b64(&wrapper.wrapped_key).map_err(dl_crypto::CryptoError::from)?;
    let content_key = aead::unwrap_key(&message_key, &wrapper_iv, &wrapped_bytes)?;

    session.updated_at = Utc::now();
    store.write_session(&session).await?;

    let message_iv = decode_iv(&env.message_iv)?;
    let ciphertext = from_b64(&env.ciphertext).map_err(dl_crypto::CryptoError::from)?;
    let plaintext_bytes = aead::decrypt(&content_key, &message_iv, &ciphertext)?;
    String::from_utf8(plaintext_bytes).map_err(|_| ProtoError::PreconditionFailed("decrypted payload was not valid UTF-8".into()))
}

fn decode_iv(b64: &str) -> Result<[u8; IV_LEN], ProtoError> {
    let bytes = from_b64(b64).map_err(dl_crypto::CryptoError::from)?;
    if bytes.len() != IV_LEN {
        return Err(ProtoError::PreconditionFailed("IV must be 12 bytes".into()));
    }
    let mut out = [0u8; IV_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn map_ratchet_err(err: dl_crypto::CryptoError) -> ProtoError {
    match err {
        dl_crypto::CryptoError::TooManySkipped => ProtoError::RatchetOverflow,
        other => ProtoError::Crypto(other),
    }
}

/// `signDecryptAck` — §4.6.
pub fn sign_decrypt_ack(
    room_id: i64,
    message_id: i64,
    from_user_id: i64,
    signing_key: &dl_crypto::jwk::EcdsaKeyPair,
) -> Result<String, ProtoError> {
    let payload = canonical_ack_payload(room_id, message_id, from_user_id)?;
    Ok(signing_key.sign_raw64_b64(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{load_or_create_identity, to_signal_pre_key_bundle_upload};
    use crate::ratchet_session::init_as_initiator;
    use dl_store::MemoryStore;

    async fn seed_session_pair(store: &MemoryStore) -> (IdentityRecord, IdentityRecord) {
        let alice = load_or_create_identity(store, 201, Some("alice-mobile")).await.unwrap();
        let bob = load_or_create_identity(store, 202, Some("bob-phone")).await.unwrap();
        let bob_bundle = to_signal_pre_key_bundle_upload(&bob).unwrap();
        let alice_session = init_as_initiator(&alice, &bob_bundle).unwrap();
        store.write_session(&alice_session).await.unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn round_trip_hello_bob() {
        let store = MemoryStore::new();
        let (alice, mut bob) = seed_session_pair(&store).await;

        let env = encrypt_for_recipients(
            &store,
            &alice,
            "alice-mobile",
            "hello bob",
            &[(202, "bob-phone".to_string())],
        )
        .await
        .unwrap();
        assert!(env.wrapped_keys["202:bob-phone"].pre_key_message.is_some());

        let plaintext = decrypt_payload(&store, &mut bob, "bob-phone", 201, "alice-mobile", &env)
            .await
            .unwrap();
        assert_eq!(plaintext, "hello bob");
    }

    #[tokio::test]
    async fn sender_can_self_decrypt() {
        let store = MemoryStore::new();
        let (mut alice, _bob) = seed_session_pair(&store).await;

        let env = encrypt_for_recipients(
            &store,
            &alice,
            "alice-mobile",
            "hello bob",
            &[(201, "alice-mobile".to_string())],
        )
        .await
        .unwrap();

        let plaintext = decrypt_payload(&store, &mut alice, "alice-mobile", 201, "alice-mobile", &env)
            .await
            .unwrap();
        assert_eq!(plaintext, "hello bob");
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_signature_check() {
        let store = MemoryStore::new();
        let (alice, mut bob) = seed_session_pair(&store).await;

        let mut env = encrypt_for_recipients(
            &store,
            &alice,
            "alice-mobile",
            "hello bob",
            &[(202, "bob-phone".to_string())],
        )
        .await
        .unwrap();
        let mut raw = from_b64(&env.ciphertext).unwrap();
        raw.push(b'A');
        env.ciphertext = to_b64(&raw);

        let result = decrypt_payload(&store, &mut bob, "bob-phone", 201, "alice-mobile", &env).await;
        assert!(matches!(result, Err(ProtoError::SignatureVerificationFailed)));
    }

    #[tokio::test]
    async fn missing_session_reports_sorted_missing_addresses() {
        let store = MemoryStore::new();
        let alice = load_or_create_identity(&store, 401, Some("alice")).await.unwrap();
        let result = encrypt_for_recipients(
            &store,
            &alice,
            "alice",
            "hi",
            &[(402, "ghost-device".to_string())],
        )
        .await;
        match result {
            Err(ProtoError::SessionNotReady { missing }) => assert_eq!(missing, vec!["402:ghost-device".to_string()]),
            other => panic!("expected SessionNotReady, got {other:?}"),
        }
    }
}
