//! Session-key derivation from a Diffie-Hellman shared secret.
//!
//! ```text
//! k   = SHA-384(derivation_key)
//! R   = HMAC-SHA384(key = k, data = 0x00 || shared)    48 bytes
//! enc = R[0..16]
//! mac = R[16..48]
//! wrp = Kdw(R)[0..16]
//! ```
//!
//! `shared` is the big-endian secret with leading zero bytes stripped, so the
//! HMAC input always starts with exactly one zero byte.

use zeroize::{Zeroize, Zeroizing};

use crate::error::VaultError;
use crate::hash::{self, HashAlgorithm};
use crate::keys::{self, WRAPPING_KEY_LEN};

/// Required length of the pre-shared derivation key.
pub const DERIVATION_KEY_LEN: usize = 16;

/// Length of the derived encryption key.
pub const ENCRYPTION_KEY_LEN: usize = 16;

/// Length of the derived integrity key.
pub const HMAC_KEY_LEN: usize = 32;

/// The three session keys, held in memory only until they are imported.
pub(crate) struct DerivedKeys {
    pub(crate) encryption: Zeroizing<[u8; ENCRYPTION_KEY_LEN]>,
    pub(crate) hmac: Zeroizing<[u8; HMAC_KEY_LEN]>,
    pub(crate) wrapping: Zeroizing<[u8; WRAPPING_KEY_LEN]>,
}

/// Normalise a big-endian integer encoding to exactly one leading zero byte.
pub(crate) fn canonicalize(shared: &[u8]) -> Zeroizing<Vec<u8>> {
    let start = shared.iter().position(|&b| b != 0).unwrap_or(shared.len());
    let mut out = Zeroizing::new(Vec::with_capacity(shared.len() - start + 1));
    out.push(0);
    out.extend_from_slice(&shared[start..]);
    out
}

/// Derive the session keys for `shared` under `derivation_key`.
pub(crate) fn derive_session_keys(
    shared: &[u8],
    derivation_key: &[u8],
) -> Result<DerivedKeys, VaultError> {
    if derivation_key.len() != DERIVATION_KEY_LEN {
        return Err(VaultError::InvalidKey);
    }

    let mut intermediate = hash::digest_once(HashAlgorithm::Sha384, derivation_key);
    let canonical = canonicalize(shared);
    let result = hash::hmac_once(HashAlgorithm::Sha384, &intermediate, &canonical);
    intermediate.zeroize();
    let mut r = Zeroizing::new(result?);

    let mut encryption = Zeroizing::new([0u8; ENCRYPTION_KEY_LEN]);
    encryption.copy_from_slice(&r[..ENCRYPTION_KEY_LEN]);

    let mut hmac = Zeroizing::new([0u8; HMAC_KEY_LEN]);
    hmac.copy_from_slice(&r[ENCRYPTION_KEY_LEN..ENCRYPTION_KEY_LEN + HMAC_KEY_LEN]);

    let material = keys::derive_wrapping_key(&r)?;
    r.zeroize();
    let mut wrapping = Zeroizing::new([0u8; WRAPPING_KEY_LEN]);
    wrapping.copy_from_slice(&material[..WRAPPING_KEY_LEN]);

    Ok(DerivedKeys {
        encryption,
        hmac,
        wrapping,
    })
}
