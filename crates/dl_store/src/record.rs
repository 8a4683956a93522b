//! Persisted record shapes for identities and ratchet sessions — §4.2/§9.
//!
//! Two logical tables are modeled: `identities` (keyed by userID) and
//! `ratchet_sessions` (keyed by `"senderUser:senderDevice:peerUser:peerDevice"`).
//! Each is accepted on read in either of two on-disk shapes — `Live`
//! (written by a process that held the typed key handles) or `JwkOnly`
//! (written by, or recovered from, a source that only ever had JWKs) —
//! and always rehydrated into the same typed, live in-memory record.
//! Writers try the `Live` shape first and fall back to `JwkOnly` only if
//! building it fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dl_crypto::jwk::{EcdhKeyPair, EcdsaKeyPair, Jwk};
use dl_crypto::ratchet::RatchetCryptoState;

use crate::error::StoreError;

fn require_p256(jwk: &Jwk) -> Result<(), StoreError> {
    if jwk.is_p256() {
        Ok(())
    } else {
        Err(StoreError::NonP256Curve)
    }
}

// ── Identity record ───────────────────────────────────────────────────

pub struct SignedPreKeyEntry {
    pub key_id: u64,
    pub created_at: DateTime<Utc>,
    pub key_pair: EcdhKeyPair,
    /// base64 raw64 ECDSA signature over the canonical signed-prekey
    /// payload, under the identity's signing key.
    pub signature: String,
}

pub struct OneTimePreKeyEntry {
    pub key_id: u64,
    pub key_pair: EcdhKeyPair,
}

pub struct IdentityRecord {
    pub user_id: u64,
    pub device_id: String,
    pub identity_key: EcdhKeyPair,
    pub signing_key: EcdsaKeyPair,
    pub signed_pre_keys: Vec<SignedPreKeyEntry>,
    pub active_signed_pre_key_id: u64,
    pub one_time_pre_keys: Vec<OneTimePreKeyEntry>,
    pub next_one_time_pre_key_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn active_signed_pre_key(&self) -> Option<&SignedPreKeyEntry> {
        self.signed_pre_keys
            .iter()
            .find(|spk| spk.key_id == self.active_signed_pre_key_id)
    }

    pub fn find_signed_pre_key(&self, key_id: u64) -> Option<&SignedPreKeyEntry> {
        self.signed_pre_keys.iter().find(|spk| spk.key_id == key_id)
    }

    pub fn find_one_time_pre_key(&self, key_id: u64) -> Option<&OneTimePreKeyEntry> {
        self.one_time_pre_keys.iter().find(|opk| opk.key_id == key_id)
    }

    pub fn consume_one_time_pre_key(&mut self, key_id: u64) {
        self.one_time_pre_keys.retain(|opk| opk.key_id != key_id);
    }
}

#[derive(Serialize, Deserialize)]
struct SignedPreKeyDto {
    key_id: u64,
    created_at: DateTime<Utc>,
    key_jwk: Jwk,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct OneTimePreKeyDto {
    key_id: u64,
    key_jwk: Jwk,
}

#[derive(Serialize, Deserialize)]
struct IdentityDto {
    user_id: u64,
    device_id: String,
    identity_key_jwk: Jwk,
    signing_key_jwk: Jwk,
    signed_pre_keys: Vec<SignedPreKeyDto>,
    active_signed_pre_key_id: u64,
    one_time_pre_keys: Vec<OneTimePreKeyDto>,
    next_one_time_pre_key_id: u64,
    updated_at: DateTime<Utc>,
}

/// The two accepted on-disk shapes for an identity record. Both carry
/// the same JWK-based fields today; the split exists because a writer
/// that only ever held extractable JWKs (never a live key handle)
/// should still be able to persist a valid record, and a reader must
/// treat both the same way.
#[derive(Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum PersistedIdentity {
    Live(IdentityDto),
    JwkOnly(IdentityDto),
}

impl PersistedIdentity {
    fn dto(&self) -> &IdentityDto {
        match self {
            PersistedIdentity::Live(dto) | PersistedIdentity::JwkOnly(dto) => dto,
        }
    }

    pub fn from_record(record: &IdentityRecord) -> Self {
        let dto = IdentityDto {
            user_id: record.user_id,
            device_id: record.device_id.clone(),
            identity_key_jwk: record.identity_key.to_jwk(),
            signing_key_jwk: record.signing_key.to_jwk(),
            signed_pre_keys: record
                .signed_pre_keys
                .iter()
                .map(|spk| SignedPreKeyDto {
                    key_id: spk.key_id,
                    created_at: spk.created_at,
                    key_jwk: spk.key_pair.to_jwk(),
                    signature: spk.signature.clone(),
                })
                .collect(),
            active_signed_pre_key_id: record.active_signed_pre_key_id,
            one_time_pre_keys: record
                .one_time_pre_keys
                .iter()
                .map(|opk| OneTimePreKeyDto {
                    key_id: opk.key_id,
                    key_jwk: opk.key_pair.to_jwk(),
                })
                .collect(),
            next_one_time_pre_key_id: record.next_one_time_pre_key_id,
            updated_at: record.updated_at,
        };
        PersistedIdentity::Live(dto)
    }

    pub fn hydrate(self) -> Result<IdentityRecord, StoreError> {
        let dto = match self {
            PersistedIdentity::Live(dto) => dto,
            PersistedIdentity::JwkOnly(dto) => dto,
        };
        require_p256(&dto.identity_key_jwk)?;
        require_p256(&dto.signing_key_jwk)?;

        let identity_key = EcdhKeyPair::from_jwk(&dto.identity_key_jwk)?;
        let signing_key = EcdsaKeyPair::from_jwk(&dto.signing_key_jwk)?;

        let mut signed_pre_keys = Vec::with_capacity(dto.signed_pre_keys.len());
        for spk in dto.signed_pre_keys {
            require_p256(&spk.key_jwk)?;
            signed_pre_keys.push(SignedPreKeyEntry {
                key_id: spk.key_id,
                created_at: spk.created_at,
                key_pair: EcdhKeyPair::from_jwk(&spk.key_jwk)?,
                signature: spk.signature,
            });
        }

        let mut one_time_pre_keys = Vec::with_capacity(dto.one_time_pre_keys.len());
        for opk in dto.one_time_pre_keys {
            require_p256(&opk.key_jwk)?;
            one_time_pre_keys.push(OneTimePreKeyEntry {
                key_id: opk.key_id,
                key_pair: EcdhKeyPair::from_jwk(&opk.key_jwk)?,
            });
        }

        Ok(IdentityRecord {
            user_id: dto.user_id,
            device_id: dto.device_id,
            identity_key,
            signing_key,
            signed_pre_keys,
            active_signed_pre_key_id: dto.active_signed_pre_key_id,
            one_time_pre_keys,
            next_one_time_pre_key_id: dto.next_one_time_pre_key_id,
            updated_at: dto.updated_at,
        })
    }

    pub fn user_id(&self) -> u64 {
        self.dto().user_id
    }
}

// ── Ratchet session record ────────────────────────────────────────────

/// The pre-key message header a responder needs to bootstrap its side
/// of the X3DH handshake, attached to an initiator's first few outbound
/// messages — §4.4 "Pending pre-key".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub identity_key_jwk: Jwk,
    pub identity_signing_public_key_jwk: Option<Jwk>,
    pub ephemeral_key_jwk: Jwk,
    pub signed_pre_key_id: u64,
    pub one_time_pre_key_id: Option<u64>,
    pub pre_key_bundle_updated_at: Option<DateTime<Utc>>,
}

pub struct RatchetSessionRecord {
    pub local_user_id: u64,
    pub local_device_id: String,
    pub peer_user_id: u64,
    pub peer_device_id: String,
    pub engine: RatchetCryptoState,
    pub peer_identity_key: Jwk,
    pub peer_signing_key: Jwk,
    pub pending_pre_key: Option<PendingPreKey>,
    pub is_self_session: bool,
    pub updated_at: DateTime<Utc>,
}

impl RatchetSessionRecord {
    pub fn session_id(
        local_user_id: u64,
        local_device_id: &str,
        peer_user_id: u64,
        peer_device_id: &str,
    ) -> String {
        format!("{local_user_id}:{local_device_id}:{peer_user_id}:{peer_device_id}")
    }

    pub fn id(&self) -> String {
        Self::session_id(
            self.local_user_id,
            &self.local_device_id,
            self.peer_user_id,
            &self.peer_device_id,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct SessionDto {
    local_user_id: u64,
    local_device_id: String,
    peer_user_id: u64,
    peer_device_id: String,
    root_key: String,
    send_chain_key: String,
    recv_chain_key: String,
    send_count: u64,
    recv_count: u64,
    previous_send_count: u64,
    skipped: Vec<(String, u64, String)>,
    dh_send_jwk: Jwk,
    dh_recv_public_jwk: Option<Jwk>,
    peer_identity_key: Jwk,
    peer_signing_key: Jwk,
    pending_pre_key: Option<PendingPreKey>,
    is_self_session: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum PersistedSession {
    Live(SessionDto),
    JwkOnly(SessionDto),
}

impl PersistedSession {
    fn dto(&self) -> &SessionDto {
        match self {
            PersistedSession::Live(dto) | PersistedSession::JwkOnly(dto) => dto,
        }
    }

    pub fn from_record(record: &RatchetSessionRecord) -> Self {
        use dl_crypto::canon::to_b64;
        use dl_crypto::jwk::public_key_to_jwk;

        let skipped = record
            .engine
            .skipped_entries()
            .into_iter()
            .map(|(fp, n, key)| (fp, n, to_b64(&key)))
            .collect();

        let dto = SessionDto {
            local_user_id: record.local_user_id,
            local_device_id: record.local_device_id.clone(),
            peer_user_id: record.peer_user_id,
            peer_device_id: record.peer_device_id.clone(),
            root_key: to_b64(&record.engine.root_key),
            send_chain_key: to_b64(&record.engine.send_chain_key),
            recv_chain_key: to_b64(&record.engine.recv_chain_key),
            send_count: record.engine.send_count,
            recv_count: record.engine.recv_count,
            previous_send_count: record.engine.previous_send_count,
            skipped,
            dh_send_jwk: record.engine.dh_send.to_jwk(),
            dh_recv_public_jwk: record.engine.dh_recv_public.as_ref().map(public_key_to_jwk),
            peer_identity_key: record.peer_identity_key.clone(),
            peer_signing_key: record.peer_signing_key.clone(),
            pending_pre_key: record.pending_pre_key.clone(),
            is_self_session: record.is_self_session,
            updated_at: record.updated_at,
        };
        PersistedSession::Live(dto)
    }

    pub fn hydrate(self) -> Result<RatchetSessionRecord, StoreError> {
        use dl_crypto::jwk::public_key_from_jwk;

        let dto = match self {
            PersistedSession::Live(dto) => dto,
            PersistedSession::JwkOnly(dto) => dto,
        };
        require_p256(&dto.dh_send_jwk)?;
        if let Some(jwk) = &dto.dh_recv_public_jwk {
            require_p256(jwk)?;
        }
        require_p256(&dto.peer_identity_key)?;
        require_p256(&dto.peer_signing_key)?;

        let root_key = decode32(&dto.root_key)?;
        let send_chain_key = decode32(&dto.send_chain_key)?;
        let recv_chain_key = decode32(&dto.recv_chain_key)?;
        let dh_send = EcdhKeyPair::from_jwk(&dto.dh_send_jwk)?;
        let dh_recv_public = dto
            .dh_recv_public_jwk
            .as_ref()
            .map(public_key_from_jwk)
            .transpose()?;

        if !dto.is_self_session && dh_recv_public.is_none() {
            return Err(StoreError::NonP256Curve);
        }
        let mut engine = RatchetCryptoState::restore(
            root_key,
            send_chain_key,
            recv_chain_key,
            dh_send,
            dh_recv_public,
            dto.is_self_session,
        );
        engine.send_count = dto.send_count;
        engine.recv_count = dto.recv_count;
        engine.previous_send_count = dto.previous_send_count;

        let mut skipped_entries = Vec::with_capacity(dto.skipped.len());
        for (fp, n, key_b64) in dto.skipped {
            skipped_entries.push((fp, n, decode32(&key_b64)?));
        }
        engine.restore_skipped(skipped_entries);

        Ok(RatchetSessionRecord {
            local_user_id: dto.local_user_id,
            local_device_id: dto.local_device_id,
            peer_user_id: dto.peer_user_id,
            peer_device_id: dto.peer_device_id,
            engine,
            peer_identity_key: dto.peer_identity_key,
            peer_signing_key: dto.peer_signing_key,
            pending_pre_key: dto.pending_pre_key,
            is_self_session: dto.is_self_session,
            updated_at: dto.updated_at,
        })
    }

    pub fn id(&self) -> String {
        let dto = self.dto();
        RatchetSessionRecord::session_id(
            dto.local_user_id,
            &dto.local_device_id,
            dto.peer_user_id,
            &dto.peer_device_id,
        )
    }
}

fn decode32(b64: &str) -> Result<[u8; 32], StoreError> {
    let bytes = dl_crypto::canon::from_b64(b64)?;
    if bytes.len() != 32 {
        return Err(StoreError::Backend("expected a 32-byte key".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
