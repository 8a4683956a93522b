//! Double-ratchet engine — §4.5.
//!
//! State separation:
//!   rootKey            — updated on every DH ratchet step
//!   sendChainKey (CKs)  — updated per outgoing message
//!   recvChainKey (CKr)  — updated per incoming message
//!   message key (MK)    — derived from a chain key, used once
//!
//! This is the live, in-memory engine: it holds actual key handles
//! (`EcdhKeyPair`, `p256::PublicKey`), not their serialized JWK form.
//! `dl_proto` owns the persisted record shape and the conversion between
//! the two, per §9 ("dynamic typing on read" -> explicit sum type plus a
//! strict validator at the persistence boundary).

use std::collections::{HashMap, VecDeque};

use p256::PublicKey;
use rand::RngCore;

use crate::error::CryptoError;
use crate::jwk::{public_key_to_jwk, EcdhKeyPair};
use crate::kdf::{hkdf_expand, hmac_sha256, kdf_ck, kdf_rk};

pub const DEFAULT_MAX_SKIP: u64 = 300;
pub const DEFAULT_MAX_SKIPPED_CACHE: usize = 600;

fn fingerprint_of(pk: &PublicKey) -> String {
    public_key_to_jwk(pk).ratchet_key_fingerprint()
}

/// A wire-ready ratchet header: the fields a sender attaches to every
/// outgoing message so the receiver can derive the matching key.
#[derive(Debug, Clone)]
pub struct RatchetHeader {
    pub dh_pub: PublicKey,
    pub message_number: u64,
    pub previous_chain_length: u64,
}

/// FIFO-bounded skipped-message-key cache, keyed by (remote-DH
/// fingerprint, message number) — §4.5 `skipMessageKeys`.
#[derive(Default)]
struct SkippedCache {
    map: HashMap<(String, u64), [u8; 32]>,
    order: VecDeque<(String, u64)>,
}

impl SkippedCache {
    fn insert(&mut self, fp: String, n: u64, key: [u8; 32], max_len: usize) {
        let id = (fp, n);
        if self.map.insert(id.clone(), key).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > max_len {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn take(&mut self, fp: &str, n: u64) -> Option<[u8; 32]> {
        let id = (fp.to_string(), n);
        let key = self.map.remove(&id)?;
        if let Some(pos) = self.order.iter().position(|x| x == &id) {
            self.order.remove(pos);
        }
        Some(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn entries(&self) -> Vec<(String, u64, [u8; 32])> {
        self.order
            .iter()
            .map(|(fp, n)| (fp.clone(), *n, self.map[&(fp.clone(), *n)]))
            .collect()
    }

    fn from_entries(entries: Vec<(String, u64, [u8; 32])>) -> Self {
        let mut cache = Self::default();
        for (fp, n, key) in entries {
            cache.map.insert((fp.clone(), n), key);
            cache.order.push_back((fp, n));
        }
        cache
    }
}

/// The live double-ratchet state for one (local, peer) session.
pub struct RatchetCryptoState {
    pub root_key: [u8; 32],
    pub send_chain_key: [u8; 32],
    pub recv_chain_key: [u8; 32],
    pub send_count: u64,
    pub recv_count: u64,
    pub previous_send_count: u64,
    skipped: SkippedCache,
    pub dh_send: EcdhKeyPair,
    pub dh_recv_public: Option<PublicKey>,
    pub is_self_session: bool,
    max_skip: u64,
    max_skipped_cache: usize,
}

impl RatchetCryptoState {
    /// Construct as the X3DH **initiator**. `dh_send` is the DH ratchet
    /// key pair the initiator starts ratcheting from (in this
    /// implementation, the same ephemeral key used in X3DH — see
    /// DESIGN.md for the reasoning); `dh_recv_public` is the peer's
    /// active signed pre-key public, the only DH public the initiator
    /// knows about the peer before any reply.
    pub fn init_as_initiator(
        send_chain_key: [u8; 32],
        recv_chain_key: [u8; 32],
        root_key: [u8; 32],
        dh_send: EcdhKeyPair,
        dh_recv_public: PublicKey,
    ) -> Self {
        Self {
            root_key,
            send_chain_key,
            recv_chain_key,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: SkippedCache::default(),
            dh_send,
            dh_recv_public: Some(dh_recv_public),
            is_self_session: false,
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_cache: DEFAULT_MAX_SKIPPED_CACHE,
        }
    }

    /// Construct as the X3DH **responder**. `dh_send` must be a *fresh*
    /// ratchet key pair distinct from the responder's signed pre-key
    /// (the caller derives `send_chain_key`/`root_key` for it via
    /// `kdf_rk` against the initiator's ephemeral first) — see
    /// DESIGN.md. Reusing the signed pre-key here would mean the
    /// initiator's stored `dh_recv_public` (already the peer's signed
    /// pre-key from the bundle) never observes a change, so the DH
    /// ratchet required by §5/P5 would never fire on the responder's
    /// first reply. `dh_recv_public` is the initiator's ephemeral key
    /// from the pre-key message header.
    pub fn init_as_responder(
        send_chain_key: [u8; 32],
        recv_chain_key: [u8; 32],
        root_key: [u8; 32],
        dh_send: EcdhKeyPair,
        dh_recv_public: PublicKey,
    ) -> Self {
        Self::init_as_initiator(send_chain_key, recv_chain_key, root_key, dh_send, dh_recv_public)
    }

    /// Construct the degenerate self-session (§4.5 "Self-session"): no DH
    /// ratchet is ever applied; the send and receive chains start
    /// identical and are stepped independently but deterministically, so
    /// encrypt and self-decrypt stay in lockstep.
    pub fn init_self_session() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let root_okm = hkdf_expand(&seed, &[0u8; 32], b"e2ee-chat-dr-root-v1", 32)
            .expect("fixed-size HKDF expand cannot fail");
        let mut root_key = [0u8; 32];
        root_key.copy_from_slice(&root_okm);

        let salt_id = uuid::Uuid::new_v4();
        let info = format!("signal-chain-initiator-v1:{salt_id}");
        let chain = hmac_sha256(&root_key, info.as_bytes());

        let dh_send = EcdhKeyPair::generate();
        let dh_recv_public = dh_send.public_key();

        Self {
            root_key,
            send_chain_key: chain,
            recv_chain_key: chain,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: SkippedCache::default(),
            dh_send,
            dh_recv_public: Some(dh_recv_public),
            is_self_session: true,
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_cache: DEFAULT_MAX_SKIPPED_CACHE,
        }
    }

    /// Rehydrate a previously-persisted session's live state verbatim —
    /// used by `dl_store`'s record hydration, where every field (including
    /// `is_self_session`) comes from disk rather than from a fresh X3DH
    /// handshake or a fresh self-session seed. Counters and the skipped
    /// cache are restored separately by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        root_key: [u8; 32],
        send_chain_key: [u8; 32],
        recv_chain_key: [u8; 32],
        dh_send: EcdhKeyPair,
        dh_recv_public: Option<PublicKey>,
        is_self_session: bool,
    ) -> Self {
        Self {
            root_key,
            send_chain_key,
            recv_chain_key,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: SkippedCache::default(),
            dh_send,
            dh_recv_public,
            is_self_session,
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_cache: DEFAULT_MAX_SKIPPED_CACHE,
        }
    }

    pub fn with_bounds(mut self, max_skip: u64, max_skipped_cache: usize) -> Self {
        self.max_skip = max_skip;
        self.max_skipped_cache = max_skipped_cache;
        self
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn skipped_entries(&self) -> Vec<(String, u64, [u8; 32])> {
        self.skipped.entries()
    }

    pub fn restore_skipped(&mut self, entries: Vec<(String, u64, [u8; 32])>) {
        self.skipped = SkippedCache::from_entries(entries);
    }

    /// `prepareSend` — §4.5. Returns the message key to wrap the content
    /// key under, plus the header the caller attaches to the outgoing
    /// wrapped-key record.
    pub fn prepare_send(&mut self) -> ([u8; 32], RatchetHeader) {
        let (next_ck, message_key) = kdf_ck(&self.send_chain_key);
        let header = RatchetHeader {
            dh_pub: self.dh_send.public_key(),
            message_number: self.send_count,
            previous_chain_length: self.previous_send_count,
        };
        self.send_chain_key = next_ck;
        self.send_count += 1;
        (message_key, header)
    }

    /// `deriveReceive` — §4.5. `header_dh` is `None` only for self-session
    /// traffic, where no DH header is ever sent.
    pub fn derive_receive(
        &mut self,
        message_number: u64,
        previous_chain_length: u64,
        header_dh: Option<&PublicKey>,
    ) -> Result<[u8; 32], CryptoError> {
        if self.is_self_session {
            self.skip_message_keys(message_number)?;
            return Ok(self.take_next_receive_key());
        }

        let header_dh = header_dh
            .ok_or_else(|| CryptoError::RatchetStep("pre-key header missing ratchet DH public key".into()))?;
        let header_fp = fingerprint_of(header_dh);

        if let Some(mk) = self.skipped.take(&header_fp, message_number) {
            return Ok(mk);
        }

        let current_fp = self.dh_recv_public.as_ref().map(fingerprint_of);
        if current_fp.as_deref() != Some(header_fp.as_str()) {
            self.skip_message_keys(previous_chain_length)?;
            self.apply_dh_ratchet(header_dh)?;
        }

        self.skip_message_keys(message_number)?;
        Ok(self.take_next_receive_key())
    }

    fn take_next_receive_key(&mut self) -> [u8; 32] {
        let (next_ck, mk) = kdf_ck(&self.recv_chain_key);
        self.recv_chain_key = next_ck;
        self.recv_count += 1;
        mk
    }

    /// `skipMessageKeys(target)` — §4.5. Derives and caches message keys
    /// for every index strictly below `target` on the current receiving
    /// chain, failing if the gap exceeds `max_skip`.
    fn skip_message_keys(&mut self, target: u64) -> Result<(), CryptoError> {
        if target > self.recv_count && target - self.recv_count > self.max_skip {
            return Err(CryptoError::TooManySkipped);
        }
        let fp = self
            .dh_recv_public
            .as_ref()
            .map(fingerprint_of)
            .unwrap_or_default();
        while self.recv_count < target {
            let (next_ck, mk) = kdf_ck(&self.recv_chain_key);
            self.recv_chain_key = next_ck;
            self.recv_count += 1;
            self.skipped
                .insert(fp.clone(), self.recv_count - 1, mk, self.max_skipped_cache);
        }
        Ok(())
    }

    /// `applyDHRatchet(newRemoteDH)` — §4.5.
    fn apply_dh_ratchet(&mut self, new_remote_dh: &PublicKey) -> Result<(), CryptoError> {
        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.dh_recv_public = Some(*new_remote_dh);

        let dh1 = self.dh_send.dh(new_remote_dh);
        let (root_after_recv, recv_chain) = kdf_rk(&self.root_key, &dh1)?;
        self.recv_chain_key = recv_chain;

        self.dh_send = EcdhKeyPair::generate();
        let dh2 = self.dh_send.dh(new_remote_dh);
        let (root_after_send, send_chain) = kdf_rk(&root_after_recv, &dh2)?;
        self.send_chain_key = send_chain;
        self.root_key = root_after_send;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x3dh::initial_chains;

    /// Mirrors `dl_proto::ratchet_session::bootstrap_responder`'s bootstrap
    /// math: the responder ratchets its send chain forward from a fresh
    /// key pair right away, rather than reusing the signed pre-key the
    /// initiator already has as `dh_recv_public`.
    fn paired_sessions() -> (RatchetCryptoState, RatchetCryptoState) {
        let master = [42u8; 32];
        let chains = initial_chains(&master);

        let alice_dh = EcdhKeyPair::generate();
        let bob_spk_pub = EcdhKeyPair::generate().public_key();

        let alice = RatchetCryptoState::init_as_initiator(
            chains.initiator_chain,
            chains.responder_chain,
            chains.root_key,
            alice_dh.clone(),
            bob_spk_pub,
        );

        let bob_dh_send = EcdhKeyPair::generate();
        let bob_dh_secret = bob_dh_send.dh(&alice_dh.public_key());
        let (bob_root, bob_send_chain) = kdf_rk(&chains.root_key, &bob_dh_secret).unwrap();
        let bob = RatchetCryptoState::init_as_responder(
            bob_send_chain,
            chains.initiator_chain,
            bob_root,
            bob_dh_send,
            alice_dh.public_key(),
        );
        (alice, bob)
    }

    #[test]
    fn round_trip_in_order() {
        let (mut alice, mut bob) = paired_sessions();
        let (mk_send, header) = alice.prepare_send();
        let mk_recv = bob
            .derive_receive(header.message_number, header.previous_chain_length, Some(&header.dh_pub))
            .unwrap();
        assert_eq!(mk_send, mk_recv);
    }

    #[test]
    fn out_of_order_within_bound() {
        let (mut alice, mut bob) = paired_sessions();
        let mut sent = Vec::new();
        for _ in 0..5 {
            sent.push(alice.prepare_send());
        }
        // deliver in a shuffled order
        let order = [2, 0, 4, 1, 3];
        for &i in &order {
            let (mk, header) = &sent[i];
            let recv = bob
                .derive_receive(header.message_number, header.previous_chain_length, Some(&header.dh_pub))
                .unwrap();
            assert_eq!(&recv, mk);
        }
        assert!(bob.skipped_len() <= DEFAULT_MAX_SKIPPED_CACHE);
    }

    #[test]
    fn overshoot_beyond_max_skip_fails() {
        let (mut alice, mut bob) = paired_sessions();
        for _ in 0..=DEFAULT_MAX_SKIP + 1 {
            alice.prepare_send();
        }
        let (_, last_header) = alice.prepare_send();
        let result = bob.derive_receive(
            last_header.message_number,
            last_header.previous_chain_length,
            Some(&last_header.dh_pub),
        );
        assert!(result.is_err());
    }

    #[test]
    fn dh_ratchet_on_reply_changes_send_key() {
        let (mut alice, mut bob) = paired_sessions();
        let (mk_send, h1) = alice.prepare_send();
        let original_send_dh = fingerprint_of(&h1.dh_pub);
        let mk_recv = bob
            .derive_receive(h1.message_number, h1.previous_chain_length, Some(&h1.dh_pub))
            .unwrap();
        assert_eq!(mk_send, mk_recv);

        let (bob_mk_send, bob_header) = bob.prepare_send();
        // Bob's reply carries a ratchet DH public distinct from the one
        // Alice already has on file for him, so this must ratchet her.
        assert_ne!(fingerprint_of(&bob_header.dh_pub), original_send_dh);
        let prior_send_count = alice.send_count;
        let alice_mk_recv = alice
            .derive_receive(bob_header.message_number, bob_header.previous_chain_length, Some(&bob_header.dh_pub))
            .unwrap();
        assert_eq!(bob_mk_send, alice_mk_recv);

        let (_, h2) = alice.prepare_send();
        assert_ne!(fingerprint_of(&h2.dh_pub), original_send_dh);
        assert_eq!(h2.previous_chain_length, prior_send_count);
    }

    #[test]
    fn self_session_round_trip() {
        let mut session = RatchetCryptoState::init_self_session();
        let (mk_send, header) = session.prepare_send();
        let mk_recv = session
            .derive_receive(header.message_number, header.previous_chain_length, None)
            .unwrap();
        assert_eq!(mk_send, mk_recv);
    }

    #[test]
    fn skipped_cache_is_bounded() {
        let (mut alice, mut bob) = paired_sessions();
        let mut sent = Vec::new();
        for _ in 0..50 {
            sent.push(alice.prepare_send());
        }
        // receive only the last message, skipping 49 ahead of it
        let (_, last_header) = sent.last().unwrap();
        bob.derive_receive(last_header.message_number, last_header.previous_chain_length, Some(&last_header.dh_pub))
            .unwrap();
        assert!(bob.skipped_len() <= DEFAULT_MAX_SKIPPED_CACHE);
        assert_eq!(bob.skipped_len(), 49);
    }
}
