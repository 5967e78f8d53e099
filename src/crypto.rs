//! Low-level cryptographic operations.
//!
//! Randomness and the vault's own at-rest wrapping live here. The at-rest
//! cipher is internal to the vault and unrelated to the keyed [`Cipher`]
//! engine callers use.
//!
//! Primitive choices:
//! - **Randomness**: `ring::rand::SystemRandom`
//! - **At-rest cipher**: AES-256-CTR (stream mode, no padding)
//! - **IV**: 128 bits, generated fresh per import
//!
//! [`Cipher`]: crate::cipher::Cipher

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::VaultError;

type AtRestCipher = ctr::Ctr128BE<Aes256>;

/// Size of the at-rest IV in bytes.
pub const IV_LEN: usize = 16;

/// Size of a vault master key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Fill `buf` from the system random number generator.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), VaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::RandomnessFailure)
}

/// Generate a cryptographically secure random key.
pub(crate) fn generate_random_key() -> Result<[u8; KEY_LEN], VaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// Wrap a plaintext for storage.
///
/// # Layout of returned bytes
/// ```text
/// [ IV (16 bytes) ][ ciphertext (same length as plaintext) ]
/// ```
pub(crate) fn wrap(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;

    let mut output = Vec::with_capacity(IV_LEN + plaintext.len());
    output.extend_from_slice(&iv);
    output.extend_from_slice(plaintext);

    let mut stream = AtRestCipher::new_from_slices(key, &iv)
        .map_err(|_| VaultError::InvalidKey)?;
    stream
        .try_apply_keystream(&mut output[IV_LEN..])
        .map_err(|_| VaultError::Primitive("at-rest encryption"))?;

    Ok(output)
}

/// Unwrap bytes produced by [`wrap`].
///
/// The stream mode carries no authentication tag: a wrong key yields garbage
/// of the right length rather than an error.
pub(crate) fn unwrap(key: &[u8; KEY_LEN], stored: &[u8]) -> Result<Vec<u8>, VaultError> {
    if stored.len() <= IV_LEN {
        return Err(VaultError::InvalidLength(stored.len()));
    }

    let (iv, body) = stored.split_at(IV_LEN);
    let mut plaintext = body.to_vec();

    let mut stream = AtRestCipher::new_from_slices(key, iv)
        .map_err(|_| VaultError::InvalidKey)?;
    stream
        .try_apply_keystream(&mut plaintext)
        .map_err(|_| VaultError::Primitive("at-rest decryption"))?;

    Ok(plaintext)
}
