//! dl_store — the secure-store contract (C2) for identity and ratchet
//! session records, plus an in-memory reference implementation.
//!
//! The concrete persistent backend is out of scope for this crate (§1):
//! only the `SecureStore` contract and the process-lifetime in-memory
//! mirror every backend wraps itself in are defined here.

pub mod error;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use record::{IdentityRecord, OneTimePreKeyEntry, PendingPreKey, RatchetSessionRecord, SignedPreKeyEntry};
pub use store::{MemoryStore, SecureStore, OPEN_TIMEOUT};
