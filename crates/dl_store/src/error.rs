use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is locked")]
    Locked,

    #[error("store operation timed out")]
    Timeout,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("stored key is not on curve P-256")]
    NonP256Curve,

    #[error("crypto error: {0}")]
    Crypto(#[from] dl_crypto::CryptoError),
}
