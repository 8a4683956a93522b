//! Canonical payloads signed or verified at the envelope/session layer —
//! §4.1/§6. Builds on `dl_crypto::canon::canonical_json`; the shapes
//! themselves (envelope, signed pre-key, ack) are domain types that live
//! here rather than in `dl_crypto`.

use dl_crypto::canon::canonical_json;
use dl_crypto::jwk::Jwk;
use serde_json::json;

use crate::envelope::Envelope;
use crate::error::ProtoError;

/// `canonicalSignedPreKeyPayload(jwk)` — §4.1.
pub fn canonical_signed_prekey_payload(public_key_jwk: &Jwk) -> String {
    canonical_json(&json!({
        "type": "signal-signed-prekey",
        "publicKeyJwk": public_key_jwk,
    }))
}

/// `canonicalAckPayload(roomID, messageID, fromUserID)` — §4.1. Fails if
/// any ID is not a positive integer.
pub fn canonical_ack_payload(room_id: i64, message_id: i64, from_user_id: i64) -> Result<String, ProtoError> {
    if room_id <= 0 || message_id <= 0 || from_user_id <= 0 {
        return Err(ProtoError::PreconditionFailed(
            "ack ids must be positive integers".into(),
        ));
    }
    Ok(canonical_json(&json!({
        "type": "decrypt_ack",
        "roomId": room_id,
        "messageId": message_id,
        "fromUserId": from_user_id,
    })))
}

/// `canonicalCipherPayload(env)` — §4.1. Serializes the envelope for
/// signing with `wrappedKeys` rewritten as an address-sorted array and
/// every absent optional field normalized per §6.
pub fn canonical_cipher_payload(env: &Envelope) -> String {
    let mut wrapped: Vec<_> = env.wrapped_keys.iter().collect();
    wrapped.sort_by(|a, b| a.0.cmp(b.0));
    let wrapped_json: Vec<_> = wrapped
        .into_iter()
        .map(|(address, wk)| {
            json!({
                "address": address,
                "iv": wk.iv,
                "wrappedKey": wk.wrapped_key,
                "ratchetDhPublicKeyJwk": wk.ratchet_dh_public_key_jwk,
                "messageNumber": wk.message_number,
                "previousChainLength": wk.previous_chain_length,
                "sessionVersion": wk.session_version,
                "preKeyMessage": wk.pre_key_message.as_ref().map(|pk| json!({
                    "identityKeyJwk": pk.identity_key_jwk,
                    "identitySigningPublicKeyJwk": pk.identity_signing_public_key_jwk,
                    "ephemeralKeyJwk": pk.ephemeral_key_jwk,
                    "signedPreKeyId": pk.signed_pre_key_id,
                    "oneTimePreKeyId": pk.one_time_pre_key_id,
                    "preKeyBundleUpdatedAt": pk.pre_key_bundle_updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                })),
            })
        })
        .collect();

    let value = json!({
        "ciphertext": env.ciphertext,
        "messageIv": env.message_iv,
        "wrappedKeys": wrapped_json,
        "senderPublicKeyJwk": env.sender_public_key_jwk,
        "senderSigningPublicKeyJwk": env.sender_signing_public_key_jwk,
        "senderDeviceId": env.sender_device_id.clone().unwrap_or_default(),
        "contentType": env.content_type.clone().unwrap_or_default(),
        "encryptionScheme": env.encryption_scheme.clone().unwrap_or_default(),
    });
    canonical_json(&value)
}
