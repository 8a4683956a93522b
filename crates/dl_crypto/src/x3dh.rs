//! X3DH (extended triple Diffie-Hellman) master-secret derivation — §4.4.
//!
//! This module is pure DH/HKDF math over already-resolved key material; it
//! has no notion of pre-key bundles, signatures, or persisted identities —
//! those live one layer up, in `dl_proto`, which verifies the bundle
//! signature before calling here and builds the pending pre-key header
//! afterwards.

use p256::PublicKey;

use crate::canon::concat;
use crate::jwk::EcdhKeyPair;
use crate::kdf::{hkdf_expand, hmac_sha256};

/// Master secret derived by the **initiator**, who holds their own
/// identity key and a freshly-generated ephemeral key, against the
/// peer's bundle (signed pre-key, identity key, optional one-time
/// pre-key).
///
/// DH1 = DH(IK_local, SPK_peer); DH2 = DH(EK_local, IK_peer);
/// DH3 = DH(EK_local, SPK_peer); DH4 = DH(EK_local, OPK_peer) if present.
pub fn initiator_master_secret(
    ik_local: &EcdhKeyPair,
    ek_local: &EcdhKeyPair,
    ik_peer: &PublicKey,
    spk_peer: &PublicKey,
    opk_peer: Option<&PublicKey>,
) -> [u8; 32] {
    let dh1 = ik_local.dh(spk_peer);
    let dh2 = ek_local.dh(ik_peer);
    let dh3 = ek_local.dh(spk_peer);
    let mut parts: Vec<&[u8]> = vec![&dh1, &dh2, &dh3];
    let dh4;
    if let Some(opk) = opk_peer {
        dh4 = ek_local.dh(opk);
        parts.push(&dh4);
    }
    master_secret(&concat(&parts))
}

/// Master secret derived by the **responder**, who holds their own
/// signed pre-key (and, optionally, the referenced one-time pre-key)
/// against the initiator's identity key and ephemeral key carried in the
/// pre-key message header.
///
/// DH1 = DH(SPK_local, IK_sender); DH2 = DH(IK_local, EK_sender);
/// DH3 = DH(SPK_local, EK_sender); DH4 = DH(OPK_local, EK_sender) if
/// referenced.
pub fn responder_master_secret(
    spk_local: &EcdhKeyPair,
    ik_local: &EcdhKeyPair,
    opk_local: Option<&EcdhKeyPair>,
    ik_sender: &PublicKey,
    ek_sender: &PublicKey,
) -> [u8; 32] {
    let dh1 = spk_local.dh(ik_sender);
    let dh2 = ik_local.dh(ek_sender);
    let dh3 = spk_local.dh(ek_sender);
    let mut parts: Vec<&[u8]> = vec![&dh1, &dh2, &dh3];
    let dh4;
    if let Some(opk) = opk_local {
        dh4 = opk.dh(ek_sender);
        parts.push(&dh4);
    }
    master_secret(&concat(&parts))
}

fn master_secret(ikm: &[u8]) -> [u8; 32] {
    let salt = [0u8; 32];
    let okm = hkdf_expand(ikm, &salt, b"signal-x3dh-v1", 32).expect("fixed-size HKDF expand cannot fail");
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm);
    out
}

/// Initial root key and the two per-direction chain keys derived from a
/// freshly-agreed X3DH master secret — §4.4 "Initial chains".
pub struct InitialChains {
    pub root_key: [u8; 32],
    pub initiator_chain: [u8; 32],
    pub responder_chain: [u8; 32],
}

pub fn initial_chains(master: &[u8; 32]) -> InitialChains {
    let zero_salt = [0u8; 32];
    let root_key_raw = hkdf_expand(master, &zero_salt, b"e2ee-chat-dr-root-v1", 32)
        .expect("fixed-size HKDF expand cannot fail");
    let mut root_key = [0u8; 32];
    root_key.copy_from_slice(&root_key_raw);
    let initiator_chain = hmac_sha256(&root_key, b"signal-chain-initiator-v1");
    let responder_chain = hmac_sha256(&root_key, b"signal-chain-responder-v1");
    InitialChains {
        root_key,
        initiator_chain,
        responder_chain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_and_responder_agree_without_one_time_prekey() {
        let ik_a = EcdhKeyPair::generate();
        let ek_a = EcdhKeyPair::generate();
        let ik_b = EcdhKeyPair::generate();
        let spk_b = EcdhKeyPair::generate();

        let master_a = initiator_master_secret(
            &ik_a,
            &ek_a,
            &ik_b.public_key(),
            &spk_b.public_key(),
            None,
        );
        let master_b = responder_master_secret(
            &spk_b,
            &ik_b,
            None,
            &ik_a.public_key(),
            &ek_a.public_key(),
        );
        assert_eq!(master_a, master_b);
    }

    #[test]
    fn initiator_and_responder_agree_with_one_time_prekey() {
        let ik_a = EcdhKeyPair::generate();
        let ek_a = EcdhKeyPair::generate();
        let ik_b = EcdhKeyPair::generate();
        let spk_b = EcdhKeyPair::generate();
        let opk_b = EcdhKeyPair::generate();

        let master_a = initiator_master_secret(
            &ik_a,
            &ek_a,
            &ik_b.public_key(),
            &spk_b.public_key(),
            Some(&opk_b.public_key()),
        );
        let master_b = responder_master_secret(
            &spk_b,
            &ik_b,
            Some(&opk_b),
            &ik_a.public_key(),
            &ek_a.public_key(),
        );
        assert_eq!(master_a, master_b);
    }

    #[test]
    fn chains_are_swapped_between_initiator_and_responder() {
        let ik_a = EcdhKeyPair::generate();
        let ek_a = EcdhKeyPair::generate();
        let ik_b = EcdhKeyPair::generate();
        let spk_b = EcdhKeyPair::generate();

        let master = initiator_master_secret(
            &ik_a,
            &ek_a,
            &ik_b.public_key(),
            &spk_b.public_key(),
            None,
        );
        let chains = initial_chains(&master);
        assert_ne!(chains.initiator_chain, chains.responder_chain);
    }
}
