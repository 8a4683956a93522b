//! Unified error type for session orchestration and the envelope codec.

use thiserror::Error;

use dl_crypto::CryptoError;
use dl_store::StoreError;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("{0}")]
    PreconditionFailed(String),

    #[error("bundle verification failed")]
    BundleVerificationFailed,

    #[error("session not ready for: {missing:?}")]
    SessionNotReady { missing: Vec<String> },

    #[error("message signature verification failed")]
    SignatureVerificationFailed,

    #[error("too many skipped messages")]
    RatchetOverflow,

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("identity corrupt: {0}")]
    IdentityCorrupt(String),

    #[error("no recipient session is ready")]
    NoRecipientReady,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
