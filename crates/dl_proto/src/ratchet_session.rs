//! Session bootstrap (C4 wiring) — turns an X3DH handshake, in either
//! direction, into a persisted, ready `RatchetSessionRecord`.

use chrono::Utc;

use dl_crypto::jwk::{public_key_from_jwk, EcdhKeyPair};
use dl_crypto::kdf::kdf_rk;
use dl_crypto::ratchet::RatchetCryptoState;
use dl_crypto::x3dh::{initial_chains, initiator_master_secret, responder_master_secret};
use dl_store::{IdentityRecord, PendingPreKey, RatchetSessionRecord, SecureStore};

use crate::constants::{DR_MAX_SKIP, DR_MAX_SKIPPED_CACHE};
use crate::identity::{consume_one_time_pre_key, verify_device_bundle, DeviceBundle};
use crate::error::ProtoError;

/// Create the initiator's side of a session from a freshly-fetched,
/// signature-verified peer bundle — §4.4 "initiator".
pub fn init_as_initiator(
    local: &IdentityRecord,
    peer_bundle: &DeviceBundle,
) -> Result<RatchetSessionRecord, ProtoError> {
    verify_device_bundle(peer_bundle)?;

    let ek = EcdhKeyPair::generate();
    let ik_peer = public_key_from_jwk(&peer_bundle.identity_key_jwk)?;
    let spk_peer = public_key_from_jwk(&peer_bundle.signed_pre_key.public_key_jwk)?;
    let opk_peer = peer_bundle
        .one_time_pre_key
        .as_ref()
        .map(|opk| public_key_from_jwk(&opk.public_key_jwk))
        .transpose()?;

    let master = initiator_master_secret(
        &local.identity_key,
        &ek,
        &ik_peer,
        &spk_peer,
        opk_peer.as_ref(),
    );
    let chains = initial_chains(&master);

    let engine = RatchetCryptoState::init_as_initiator(
        chains.initiator_chain,
        chains.responder_chain,
        chains.root_key,
        ek.clone(),
        spk_peer,
    )
    .with_bounds(DR_MAX_SKIP, DR_MAX_SKIPPED_CACHE);

    let pending_pre_key = PendingPreKey {
        identity_key_jwk: local.identity_key.public_jwk(),
        identity_signing_public_key_jwk: Some(local.signing_key.public_jwk()),
        ephemeral_key_jwk: ek.public_jwk(),
        signed_pre_key_id: peer_bundle.signed_pre_key.key_id,
        one_time_pre_key_id: peer_bundle.one_time_pre_key.as_ref().map(|o| o.key_id),
        pre_key_bundle_updated_at: peer_bundle.updated_at,
    };

    Ok(RatchetSessionRecord {
        local_user_id: local.user_id,
        local_device_id: local.device_id.clone(),
        peer_user_id: peer_bundle.user_id,
        peer_device_id: peer_bundle.device_id.clone(),
        engine,
        peer_identity_key: peer_bundle.identity_key_jwk.clone(),
        peer_signing_key: peer_bundle.identity_signing_public_key_jwk.clone(),
        pending_pre_key: Some(pending_pre_key),
        is_self_session: false,
        updated_at: Utc::now(),
    })
}

/// Bootstrap the responder's side of a session from an inbound pre-key
/// message header — §4.4 "responder". Consumes the referenced one-time
/// pre-key, persisting the identity record's updated state.
pub async fn bootstrap_responder(
    store: &dyn SecureStore,
    local: &mut IdentityRecord,
    header: &PendingPreKey,
    sender_user_id: u64,
    sender_device_id: &str,
) -> Result<RatchetSessionRecord, ProtoError> {
    let spk_local = local
        .find_signed_pre_key(header.signed_pre_key_id)
        .ok_or_else(|| ProtoError::BootstrapFailed("referenced signed pre-key not found".into()))?
        .key_pair
        .clone();

    let opk_local = match header.one_time_pre_key_id {
        Some(key_id) => Some(
            local
                .find_one_time_pre_key(key_id)
                .ok_or_else(|| ProtoError::BootstrapFailed("referenced one-time pre-key not found".into()))?
                .key_pair
                .clone(),
        ),
        None => None,
    };

    let ik_sender = public_key_from_jwk(&header.identity_key_jwk)?;
    let ek_sender = public_key_from_jwk(&header.ephemeral_key_jwk)?;

    let master = responder_master_secret(
        &spk_local,
        &local.identity_key,
        opk_local.as_ref(),
        &ik_sender,
        &ek_sender,
    );
    let chains = initial_chains(&master);

    // The responder's initial ratchet send key must differ from the
    // signed pre-key the initiator already holds as its `dh_recv_public`
    // — otherwise this reply never looks like a new DH public to the
    // initiator and the §5/P5 ratchet step never fires. Generate a fresh
    // key and ratchet the send chain forward from it immediately, via the
    // same `kdf_rk` step `apply_dh_ratchet` would use later.
    let bootstrap_dh_send = EcdhKeyPair::generate();
    let bootstrap_dh_secret = bootstrap_dh_send.dh(&ek_sender);
    let (ratcheted_root, ratcheted_send_chain) = kdf_rk(&chains.root_key, &bootstrap_dh_secret)?;

    let engine = RatchetCryptoState::init_as_responder(
        ratcheted_send_chain,
        chains.initiator_chain,
        ratcheted_root,
        bootstrap_dh_send,
        ek_sender,
    )
    .with_bounds(DR_MAX_SKIP, DR_MAX_SKIPPED_CACHE);

    if let Some(key_id) = header.one_time_pre_key_id {
        consume_one_time_pre_key(store, local, key_id).await?;
    }

    let peer_signing_key = header
        .identity_signing_public_key_jwk
        .clone()
        .ok_or_else(|| ProtoError::BootstrapFailed("pre-key header missing sender signing key".into()))?;

    Ok(RatchetSessionRecord {
        local_user_id: local.user_id,
        local_device_id: local.device_id.clone(),
        peer_user_id: sender_user_id,
        peer_device_id: sender_device_id.to_string(),
        engine,
        peer_identity_key: header.identity_key_jwk.clone(),
        peer_signing_key,
        pending_pre_key: None,
        is_self_session: false,
        updated_at: Utc::now(),
    })
}

/// Mint the degenerate self-session for a (user, device) pair — §4.5
/// "Self-session".
pub fn init_self_session(local: &IdentityRecord) -> RatchetSessionRecord {
    RatchetSessionRecord {
        local_user_id: local.user_id,
        local_device_id: local.device_id.clone(),
        peer_user_id: local.user_id,
        peer_device_id: local.device_id.clone(),
        engine: RatchetCryptoState::init_self_session().with_bounds(DR_MAX_SKIP, DR_MAX_SKIPPED_CACHE),
        peer_identity_key: local.identity_key.public_jwk(),
        peer_signing_key: local.signing_key.public_jwk(),
        pending_pre_key: None,
        is_self_session: true,
        updated_at: Utc::now(),
    }
}
