//! ALFA Data Vault - Password Key Derivation
//!
//! PBKDF2-HMAC-SHA256. The same function serves two costs: the high count for
//! the key that wraps the master key, and the low legacy count for data that
//! was encrypted directly under the password.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::KEY_LEN;
use crate::error::{VaultError, VaultResult};

/// Derive a 256-bit symmetric key from a password
pub fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    if iterations == 0 {
        return Err(VaultError::KeyDerivationFailed("iteration count must be positive".into()));
    }

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut *okm);

    Ok(okm)
}
