//! Key ownership and the wrapping-key derivation.
//!
//! This module owns two responsibilities:
//! 1. Holding vault master keys in a type that is opaque, non-cloneable, and
//!    zeroised on drop.
//! 2. Deriving a key-wrapping key from an encryption/integrity key pair.
//!
//! ## Wrapping-key derivation
//!
//! ```text
//! prk = HMAC-SHA256(key = SALT, data = input)
//! kdw = HMAC-SHA256(key = prk,  data = INFO)
//! ```
//!
//! `SALT` and `INFO` are fixed protocol constants. The output is 32 bytes;
//! callers keep the first [`WRAPPING_KEY_LEN`] bytes.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::error::VaultError;
use crate::hash::{self, HashAlgorithm};

const WRAPPING_SALT: [u8; 16] = [
    0x02, 0x76, 0x17, 0x98, 0x4f, 0x62, 0x27, 0x53, 0x9a, 0x63, 0x0b, 0x89, 0x7c, 0x01, 0x7d, 0x69,
];

const WRAPPING_INFO: [u8; 16] = [
    0x80, 0x9f, 0x82, 0xa7, 0xad, 0xdf, 0x54, 0x8d, 0x3e, 0xa9, 0xdd, 0x06, 0x7f, 0xf9, 0xbb, 0x91,
];

/// Length of the derivation output.
pub const WRAPPING_OUTPUT_LEN: usize = 32;

/// Length of the wrapping key kept in a vault.
pub const WRAPPING_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// A vault master key. Every imported blob is wrapped with it at rest.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a hex encoded 32-byte key.
    pub fn from_hex(encoded: &str) -> Result<Self, VaultError> {
        let decoded = Zeroizing::new(hex::decode(encoded.trim()).map_err(|_| VaultError::InvalidKey)?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, VaultError> {
        Ok(Self::from_bytes(crypto::generate_random_key()?))
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive the 32-byte wrapping-key material from `input`.
pub(crate) fn derive_wrapping_key(
    input: &[u8],
) -> Result<Zeroizing<[u8; WRAPPING_OUTPUT_LEN]>, VaultError> {
    let prk = Zeroizing::new(hash::hmac_once(HashAlgorithm::Sha256, &WRAPPING_SALT, input)?);
    let tag = Zeroizing::new(hash::hmac_once(HashAlgorithm::Sha256, &prk, &WRAPPING_INFO)?);

    let mut out = Zeroizing::new([0u8; WRAPPING_OUTPUT_LEN]);
    out.copy_from_slice(&tag);
    Ok(out)
}
