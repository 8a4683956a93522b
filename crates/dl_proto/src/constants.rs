//! Rotation and ratchet budget defaults — §6 "Constants". Every
//! operation that consumes one of these takes it as an explicit
//! parameter; the values here are only the spec-mandated defaults.

pub const DR_SESSION_VERSION: u8 = 1;
pub const DR_MAX_SKIP: u64 = 300;
pub const DR_MAX_SKIPPED_CACHE: usize = 600;
pub const SIGNED_PREKEY_HISTORY_LIMIT: usize = 5;
pub const ONE_TIME_PREKEY_TARGET: usize = 96;
pub const DEFAULT_KEY_MAX_AGE_MS: i64 = 4 * 3_600_000;
pub const DEFAULT_KEY_HISTORY_LIMIT: usize = 6;

/// Outbound messages carry the pending pre-key header until the
/// sending chain has advanced this far — §4.4 "Pending pre-key".
pub const PENDING_PREKEY_MESSAGE_LIMIT: u64 = 3;
