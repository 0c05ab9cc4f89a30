//! ALFA Data Vault - AEAD Encryption
//!
//! AES-256-GCM with the on-disk framing shared by every encrypted artifact:
//!
//! ```text
//! base64( salt(16) || iv(12) || ciphertext || tag(16) )
//! ```
//!
//! The salt is only consumed when the key is password-derived, but it is drawn
//! fresh on every call either way so no (salt, key) pair is ever reused.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::kdf::derive_key;
use super::keys::{generate_nonce, generate_salt, MasterKey, KEY_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};

/// Shortest valid decoded blob: header plus an empty ciphertext's tag
pub const MIN_BLOB_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// What a blob is encrypted under
#[derive(Clone, Copy)]
pub enum CipherKey<'a> {
    /// The unwrapped data encryption key
    Master(&'a MasterKey),
    /// A password, stretched with PBKDF2 using the blob's salt
    Password { password: &'a str, iterations: u32 },
}

impl CipherKey<'_> {
    fn resolve(&self, salt: &[u8]) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
        match self {
            CipherKey::Master(key) => Ok(Zeroizing::new(*key.expose())),
            CipherKey::Password { password, iterations } => derive_key(password, salt, *iterations),
        }
    }
}

/// Base64 text of `salt || iv || ciphertext || tag`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    /// Adopt stored text as a blob. Whitespace picked up in transit is dropped.
    pub fn from_text(text: &str) -> Self {
        Self(text.chars().filter(|c| !c.is_whitespace()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode and split into (salt, iv, ciphertext-with-tag)
    fn decode(&self) -> VaultResult<Vec<u8>> {
        let raw = STANDARD.decode(self.0.as_bytes())?;
        if raw.len() < MIN_BLOB_LEN {
            return Err(VaultError::Format(format!(
                "blob is {} bytes, minimum is {}",
                raw.len(),
                MIN_BLOB_LEN
            )));
        }
        Ok(raw)
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedBlob({} chars)", self.0.len())
    }
}

impl fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// AES-256-GCM
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypt data with AES-256-GCM into a fresh blob
pub fn encrypt(plaintext: &[u8], key: CipherKey<'_>) -> VaultResult<EncryptedBlob> {
    let salt = generate_salt();
    let nonce_bytes = generate_nonce();
    let key_bytes = key.resolve(&salt)?;

    let cipher = Aes256Gcm::new_from_slice(&key_bytes[..])
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    Ok(EncryptedBlob(STANDARD.encode(out)))
}

/// Decrypt a blob. Any key mismatch or tampering is `Authentication`.
pub fn decrypt(blob: &EncryptedBlob, key: CipherKey<'_>) -> VaultResult<Zeroizing<Vec<u8>>> {
    let raw = blob.decode()?;
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key_bytes = key.resolve(salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key_bytes[..])
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Authentication)
}

/// Encrypt a UTF-8 string
pub fn encrypt_str(plaintext: &str, key: CipherKey<'_>) -> VaultResult<EncryptedBlob> {
    encrypt(plaintext.as_bytes(), key)
}

/// Decrypt to a UTF-8 string
pub fn decrypt_str(blob: &EncryptedBlob, key: CipherKey<'_>) -> VaultResult<String> {
    let bytes = decrypt(blob, key)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| VaultError::Format("decrypted payload is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn test_master_key_roundtrip() {
        let key = MasterKey::generate();
        let plaintext = b"ALFA Data Vault - pets collection";

        let blob = encrypt(plaintext, CipherKey::Master(&key)).unwrap();
        let decrypted = decrypt(&blob, CipherKey::Master(&key)).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_password_roundtrip() {
        let key = CipherKey::Password { password: "correct-horse", iterations: FAST };
        let blob = encrypt_str("legacy export", key).unwrap();
        assert_eq!(decrypt_str(&blob, key).unwrap(), "legacy export");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let key = MasterKey::generate();
        let blob = encrypt(b"", CipherKey::Master(&key)).unwrap();
        assert!(decrypt(&blob, CipherKey::Master(&key)).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let samples = ["", "x", "{\"id\":\"1\"}", "a much longer plaintext value"];
        for plaintext in samples {
            let key1 = MasterKey::generate();
            let key2 = MasterKey::generate();
            let blob = encrypt_str(plaintext, CipherKey::Master(&key1)).unwrap();

            assert!(matches!(
                decrypt(&blob, CipherKey::Master(&key2)),
                Err(VaultError::Authentication)
            ));
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let blob = encrypt_str(
            "secret",
            CipherKey::Password { password: "right", iterations: FAST },
        )
        .unwrap();

        let result = decrypt(&blob, CipherKey::Password { password: "wrong", iterations: FAST });
        assert!(matches!(result, Err(VaultError::Authentication)));
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let key = MasterKey::generate();
        let a = encrypt_str("same", CipherKey::Master(&key)).unwrap();
        let b = encrypt_str("same", CipherKey::Master(&key)).unwrap();
        assert_ne!(a, b);

        let raw_a = STANDARD.decode(a.as_str()).unwrap();
        let raw_b = STANDARD.decode(b.as_str()).unwrap();
        assert_ne!(raw_a[..SALT_LEN], raw_b[..SALT_LEN]);
        assert_ne!(
            raw_a[SALT_LEN..SALT_LEN + NONCE_LEN],
            raw_b[SALT_LEN..SALT_LEN + NONCE_LEN]
        );
    }

    #[test]
    fn test_tampering_detected() {
        let key = MasterKey::generate();
        let blob = encrypt_str("do not touch", CipherKey::Master(&key)).unwrap();

        let mut raw = STANDARD.decode(blob.as_str()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = EncryptedBlob::from_text(&STANDARD.encode(raw));

        assert!(matches!(
            decrypt(&tampered, CipherKey::Master(&key)),
            Err(VaultError::Authentication)
        ));
    }

    #[test]
    fn test_malformed_input_is_format_error() {
        let key = MasterKey::generate();

        let not_base64 = EncryptedBlob::from_text("@@@not base64@@@");
        assert!(matches!(
            decrypt(&not_base64, CipherKey::Master(&key)),
            Err(VaultError::Format(_))
        ));

        let too_short = EncryptedBlob::from_text(&STANDARD.encode([0u8; MIN_BLOB_LEN - 1]));
        assert!(matches!(
            decrypt(&too_short, CipherKey::Master(&key)),
            Err(VaultError::Format(_))
        ));
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let key = MasterKey::generate();
        let blob = encrypt_str("wrapped text", CipherKey::Master(&key)).unwrap();
        let text = blob.as_str();
        let (head, tail) = text.split_at(text.len() / 2);
        let mangled = EncryptedBlob::from_text(&format!("  {}\n{}\r\n", head, tail));

        assert_eq!(decrypt_str(&mangled, CipherKey::Master(&key)).unwrap(), "wrapped text");
    }
}
