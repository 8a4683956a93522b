//! Device enrollment certificates — a C3-adjacent supplemental feature.
//! Binds a device's own signing key to a user's identity signing key so
//! a compromised directory cannot silently swap in a device.

pub use dl_crypto::identity::{DeviceCapabilities, DeviceCert};

use dl_store::IdentityRecord;

/// Issue a certificate binding `device_signing_key` to `identity`,
/// signed by the identity's own signing key.
pub fn issue_for_identity(
    identity: &IdentityRecord,
    device_signing_key: &dl_crypto::jwk::EcdsaKeyPair,
    valid_days: i64,
    capabilities: DeviceCapabilities,
) -> Result<DeviceCert, dl_crypto::CryptoError> {
    DeviceCert::issue(
        &identity.signing_key,
        &device_signing_key.public_jwk(),
        &identity.device_id,
        &identity.user_id.to_string(),
        valid_days,
        capabilities,
    )
}
