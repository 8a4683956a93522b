use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("expected curve P-256, found a key on a different curve")]
    WrongCurve,

    #[error("ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("too many skipped messages")]
    TooManySkipped,

    #[error("certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("nonce generation failed")]
    NonceGeneration,

    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
