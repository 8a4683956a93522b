//! dl_crypto — cryptographic primitives for the end-to-end encrypted
//! chat core.
//!
//! # Design principles
//! - No custom crypto; every primitive comes from an audited Rust crate.
//! - Zeroize all secret material on drop.
//! - Public key material travels as JWK, matching what a Web Crypto peer
//!   would produce.
//!
//! # Module layout
//! - `jwk`      — P-256 key pairs, JWK import/export, ECDSA sign/verify
//! - `canon`    — canonical JSON, base64/DER signature transcoding, fingerprints
//! - `identity` — identity/device key roles, device certificates
//! - `x3dh`     — X3DH master-secret and initial-chain derivation
//! - `ratchet`  — double ratchet engine (DH ratchet, chain KDFs, skipped keys)
//! - `aead`     — AES-256-GCM encrypt/decrypt and key-wrap helpers
//! - `kdf`      — HKDF-SHA256 / HMAC-SHA256 primitives shared by x3dh and ratchet
//! - `error`    — unified error type

pub mod aead;
pub mod canon;
pub mod error;
pub mod identity;
pub mod jwk;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
