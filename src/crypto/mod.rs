//! ALFA Data Vault - Cryptographic Core
//!
//! Pure functions, no I/O: password key derivation and AES-256-GCM blobs.

pub mod keys;
pub mod kdf;
pub mod aead;

pub use keys::*;
pub use kdf::*;
pub use aead::*;
