//! dl_proto — session orchestration and envelope wire format for the
//! end-to-end encrypted chat core: the X3DH handshake, identity/pre-key
//! lifecycle, and the signed envelope codec, all wired around the
//! `dl_crypto` primitives and the `dl_store` persistence contract.
//!
//! # Modules
//! - `identity`       — identity manager (C3): generate, rotate, vend pre-keys
//! - `ratchet_session` — X3DH bootstrap (C4) into a persisted ratchet session
//! - `envelope`       — envelope codec (C6): encrypt/decrypt/sign
//! - `orchestrator`   — session orchestrator (C7): ensure sessions for recipients
//! - `canonical`      — canonical payloads signed/verified at this layer
//! - `constants`      — rotation and ratchet budget defaults (§6)
//! - `device_cert`    — supplemental device enrollment certificates
//! - `error`          — unified error type

pub mod canonical;
pub mod constants;
pub mod device_cert;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod ratchet_session;

pub use envelope::Envelope;
pub use error::ProtoError;
