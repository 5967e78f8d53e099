//! Vault-keyed AES.
//!
//! A [`Cipher`] binds a vault, a key handle and a block mode. The key is
//! exported from the vault on every call, used to key the transform and
//! zeroised before any input is processed. Block modes run without padding;
//! callers supply block-aligned input for ECB and CBC.

use std::fmt;
use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::{
    AsyncStreamCipher, Block, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, InvalidLength,
    KeyInit, KeyIvInit, StreamCipher,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::VaultError;
use crate::vault::{Handle, Vault};

/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

const INIT: VaultError = VaultError::Primitive("cipher init");
const UPDATE: VaultError = VaultError::Primitive("cipher update");

/// Supported block cipher modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Ecb,
    Cbc,
    Ofb,
    /// Cipher feedback, one bit per step.
    Cfb1,
    /// Cipher feedback, one byte per step.
    Cfb8,
    /// Cipher feedback, one block per step.
    Cfb128,
    /// Counter mode with a 128-bit big-endian counter.
    Ctr,
}

impl CipherMode {
    /// IV length the mode requires.
    pub const fn iv_len(self) -> usize {
        match self {
            Self::Ecb => 0,
            _ => BLOCK_LEN,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ecb => "ECB",
            Self::Cbc => "CBC",
            Self::Ofb => "OFB",
            Self::Cfb1 => "CFB1",
            Self::Cfb8 => "CFB8",
            Self::Cfb128 => "CFB128",
            Self::Ctr => "CTR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    fn from_len(len: u16) -> Option<Self> {
        match len {
            16 => Some(Self::Aes128),
            24 => Some(Self::Aes192),
            32 => Some(Self::Aes256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// An AES engine keyed by a vault entry.
pub struct Cipher {
    vault: Arc<Vault>,
    key: Handle,
    key_len: u16,
    key_size: KeySize,
    mode: CipherMode,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("vault", &self.vault.id())
            .field("key", &self.key)
            .field("key_len", &self.key_len)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Cipher {
    /// Bind `mode` to the key under `key`. The key length picks AES-128,
    /// AES-192 or AES-256; any other length is unsupported.
    pub(crate) fn new(vault: Arc<Vault>, mode: CipherMode, key: Handle) -> Result<Self, VaultError> {
        let key_len = vault.size_entry(key, true)?;
        let key_size = KeySize::from_len(key_len).ok_or_else(|| {
            VaultError::Unsupported(format!("AES-{} {mode}", u32::from(key_len) * 8))
        })?;

        debug!(vault = %vault.id(), %key, %mode, key_len, "cipher bound");
        Ok(Self {
            vault,
            key,
            key_len,
            key_size,
            mode,
        })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        usize::from(self.key_len)
    }

    pub fn iv_len(&self) -> usize {
        self.mode.iv_len()
    }

    /// Encrypt `input` into `output`, returning the number of bytes written.
    pub fn encrypt(&self, iv: &[u8], input: &[u8], output: &mut [u8]) -> Result<usize, VaultError> {
        self.run(Direction::Encrypt, iv, input, output)
    }

    /// Decrypt `input` into `output`, returning the number of bytes written.
    pub fn decrypt(&self, iv: &[u8], input: &[u8], output: &mut [u8]) -> Result<usize, VaultError> {
        self.run(Direction::Decrypt, iv, input, output)
    }

    fn run(
        &self,
        direction: Direction,
        iv: &[u8],
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, VaultError> {
        let expected = self.mode.iv_len();
        if iv.len() != expected {
            return Err(VaultError::InvalidIv {
                expected,
                actual: iv.len(),
            });
        }
        if input.is_empty() {
            return Err(VaultError::InvalidLength(0));
        }
        if output.len() < input.len() {
            return Err(VaultError::BufferTooSmall {
                needed: input.len(),
                available: output.len(),
            });
        }

        let key = self.vault.export_entry(self.key, self.key_len, true)?;
        let output = &mut output[..input.len()];

        match transform(self.key_size, self.mode, direction, key, iv, input, output) {
            Ok(()) => Ok(input.len()),
            Err(err) => {
                output.zeroize();
                warn!(key = %self.key, mode = %self.mode, ?direction, %err, "cipher operation failed");
                Err(err)
            }
        }
    }
}

/// Key a primitive and drop the exported key before it processes any data.
fn keyed<T>(
    key: Zeroizing<Vec<u8>>,
    build: impl FnOnce(&[u8]) -> Result<T, InvalidLength>,
) -> Result<T, VaultError> {
    let built = build(&key).map_err(|_| INIT);
    drop(key);
    built
}

macro_rules! with_aes {
    ($size:expr, $c:ident => $body:expr) => {
        match $size {
            KeySize::Aes128 => {
                type $c = Aes128;
                $body
            }
            KeySize::Aes192 => {
                type $c = Aes192;
                $body
            }
            KeySize::Aes256 => {
                type $c = Aes256;
                $body
            }
        }
    };
}

/// `output` has exactly the length of `input`.
fn transform(
    size: KeySize,
    mode: CipherMode,
    direction: Direction,
    key: Zeroizing<Vec<u8>>,
    iv: &[u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), VaultError> {
    with_aes!(size, C => match (mode, direction) {
        (CipherMode::Ecb, Direction::Encrypt) => keyed(key, ecb::Encryptor::<C>::new_from_slice)?
            .encrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map(drop)
            .map_err(|_| UPDATE),
        (CipherMode::Ecb, Direction::Decrypt) => keyed(key, ecb::Decryptor::<C>::new_from_slice)?
            .decrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map(drop)
            .map_err(|_| UPDATE),
        (CipherMode::Cbc, Direction::Encrypt) => keyed(key, |k| cbc::Encryptor::<C>::new_from_slices(k, iv))?
            .encrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map(drop)
            .map_err(|_| UPDATE),
        (CipherMode::Cbc, Direction::Decrypt) => keyed(key, |k| cbc::Decryptor::<C>::new_from_slices(k, iv))?
            .decrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map(drop)
            .map_err(|_| UPDATE),
        (CipherMode::Ofb, _) => keyed(key, |k| ofb::Ofb::<C>::new_from_slices(k, iv))?
            .apply_keystream_b2b(input, output)
            .map_err(|_| UPDATE),
        (CipherMode::Ctr, _) => keyed(key, |k| ctr::Ctr128BE::<C>::new_from_slices(k, iv))?
            .apply_keystream_b2b(input, output)
            .map_err(|_| UPDATE),
        (CipherMode::Cfb128, Direction::Encrypt) => {
            let engine = keyed(key, |k| cfb_mode::Encryptor::<C>::new_from_slices(k, iv))?;
            output.copy_from_slice(input);
            engine.encrypt(output);
            Ok(())
        }
        (CipherMode::Cfb128, Direction::Decrypt) => {
            let engine = keyed(key, |k| cfb_mode::Decryptor::<C>::new_from_slices(k, iv))?;
            output.copy_from_slice(input);
            engine.decrypt(output);
            Ok(())
        }
        (CipherMode::Cfb8, Direction::Encrypt) => {
            let engine = keyed(key, |k| cfb8::Encryptor::<C>::new_from_slices(k, iv))?;
            output.copy_from_slice(input);
            engine.encrypt(output);
            Ok(())
        }
        (CipherMode::Cfb8, Direction::Decrypt) => {
            let engine = keyed(key, |k| cfb8::Decryptor::<C>::new_from_slices(k, iv))?;
            output.copy_from_slice(input);
            engine.decrypt(output);
            Ok(())
        }
        (CipherMode::Cfb1, _) => {
            let engine = keyed(key, C::new_from_slice)?;
            cfb1(&engine, iv, direction, input, output);
            Ok(())
        }
    })
}

/// One-bit cipher feedback, most significant bit first.
fn cfb1<C: BlockEncrypt>(engine: &C, iv: &[u8], direction: Direction, input: &[u8], output: &mut [u8]) {
    let mut register = Block::<C>::clone_from_slice(iv);
    let mut keystream = register.clone();

    for (byte, out) in input.iter().zip(output.iter_mut()) {
        let mut produced = 0u8;
        for bit in (0..8).rev() {
            keystream.copy_from_slice(&register);
            engine.encrypt_block(&mut keystream);

            let in_bit = (byte >> bit) & 1;
            let out_bit = in_bit ^ (keystream[0] >> 7);
            produced |= out_bit << bit;

            let feedback = match direction {
                Direction::Encrypt => out_bit,
                Direction::Decrypt => in_bit,
            };
            shift_in(&mut register, feedback);
        }
        *out = produced;
    }
    keystream.as_mut_slice().zeroize();
}

fn shift_in(register: &mut [u8], bit: u8) {
    let last = register.len() - 1;
    for i in 0..last {
        register[i] = (register[i] << 1) | (register[i + 1] >> 7);
    }
    register[last] = (register[last] << 1) | bit;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;

    const PLAINTEXT: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51";
    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const CTR_IV: &str = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";
    const KEY_128: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const KEY_192: &str = "8e73b0f7da0e6452c810f32b809079e562f8ead2522c6b7b";
    const KEY_256: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";

    fn bound(mode: CipherMode, key_hex: &str) -> Cipher {
        let vault = Vault::new(MasterKey::from_bytes([9u8; 32]));
        let key = vault.import_entry(&hex::decode(key_hex).unwrap(), false).unwrap();
        vault.aes(mode, key).unwrap()
    }

    fn check(mode: CipherMode, key_hex: &str, iv_hex: &str, plaintext: &[u8], expected_hex: &str) {
        let cipher = bound(mode, key_hex);
        let iv = hex::decode(iv_hex).unwrap();

        let mut ciphertext = vec![0u8; plaintext.len()];
        let written = cipher.encrypt(&iv, plaintext, &mut ciphertext).unwrap();
        assert_eq!(written, plaintext.len());
        assert_eq!(hex::encode(&ciphertext), expected_hex, "{mode} encrypt");

        let mut recovered = vec![0u8; plaintext.len()];
        cipher.decrypt(&iv, &ciphertext, &mut recovered).unwrap();
        assert_eq!(recovered, plaintext, "{mode} decrypt");
    }

    #[test]
    fn test_block_modes_vectors() {
        let pt = hex::decode(PLAINTEXT).unwrap();
        let cases = [
            (KEY_128, "3ad77bb40d7a3660a89ecaf32466ef97f5d3d58503b9699de785895a96fdbaaf", "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"),
            (KEY_192, "bd334f1d6e45f25ff712a214571fa5cc974104846d0ad3ad7734ecb3ecee4eef", "4f021db243bc633d7178183a9fa071e8b4d9ada9ad7dedf4e5e738763f69145a"),
            (KEY_256, "f3eed1bdb5d2a03c064b5a7e3db181f8591ccb10d410ed26dc5ba74a31362870", "f58c4c04d6e5f1ba779eabfb5f7bfbd69cfc4e967edb808d679f777bc6702c7d"),
        ];
        for (key, ecb, cbc) in cases {
            check(CipherMode::Ecb, key, "", &pt, ecb);
            check(CipherMode::Cbc, key, IV, &pt, cbc);
        }
    }

    #[test]
    fn test_stream_modes_vectors() {
        let pt = hex::decode(PLAINTEXT).unwrap();
        let cases = [
            (KEY_128, "3b3fd92eb72dad20333449f8e83cfb4a7789508d16918f03f53c52dac54ed825", "3b3fd92eb72dad20333449f8e83cfb4ac8a64537a0b3a93fcde3cdad9f1ce58b", "874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff"),
            (KEY_192, "cdc80d6fddf18cab34c25909c99a4174fcc28b8d4c63837c09e81700c1100401", "cdc80d6fddf18cab34c25909c99a417467ce7f7f81173621961a2b70171d3d7a", "1abc932417521ca24f2b0459fe7e6e0b090339ec0aa6faefd5ccc2c6f4ce8e94"),
            (KEY_256, "dc7e84bfda79164b7ecd8486985d38604febdc6740d20b3ac88f6ad82a4fb08d", "dc7e84bfda79164b7ecd8486985d386039ffed143b28b1c832113c6331e5407b", "601ec313775789a5b7a7f504bbf3d228f443e3ca4d62b59aca84e990cacaf5c5"),
        ];
        for (key, ofb, cfb128, ctr) in cases {
            check(CipherMode::Ofb, key, IV, &pt, ofb);
            check(CipherMode::Cfb128, key, IV, &pt, cfb128);
            check(CipherMode::Ctr, key, CTR_IV, &pt, ctr);
        }
    }

    #[test]
    fn test_cfb8_vectors() {
        let pt = hex::decode(PLAINTEXT).unwrap();
        check(CipherMode::Cfb8, KEY_128, IV, &pt[..18], "3b79424c9c0dd436bace9e0ed4586a4f32b9");
        check(CipherMode::Cfb8, KEY_192, IV, &pt[..18], "cda2521ef0a905ca44cd057cbf0d47a0678a");
        check(CipherMode::Cfb8, KEY_256, IV, &pt[..18], "dc1f1a8520a64db55fcc8ac554844e889700");
    }

    #[test]
    fn test_cfb1_vectors() {
        let pt = hex::decode(PLAINTEXT).unwrap();
        check(CipherMode::Cfb1, KEY_128, IV, &pt[..2], "68b3");
        check(
            CipherMode::Cfb1,
            KEY_128,
            IV,
            &pt,
            "68b3a264f838f5f8c3101070d1ab4c2e22e7f950383a0b71ade4fad0095cb188",
        );
        check(
            CipherMode::Cfb1,
            KEY_256,
            IV,
            &pt,
            "9029c2ba5b7d440b562023deec3de5928e4fd76528e8cc3a548a0a49edf001d0",
        );
    }

    #[test]
    fn test_wrong_iv_length() {
        let cipher = bound(CipherMode::Cbc, KEY_128);
        let mut out = [0u8; 16];
        assert!(matches!(
            cipher.encrypt(&[0u8; 8], &[0u8; 16], &mut out),
            Err(VaultError::InvalidIv { expected: 16, actual: 8 })
        ));

        let ecb = bound(CipherMode::Ecb, KEY_128);
        assert!(matches!(
            ecb.decrypt(&[0u8; 16], &[0u8; 16], &mut out),
            Err(VaultError::InvalidIv { expected: 0, actual: 16 })
        ));
    }

    #[test]
    fn test_short_output_rejected() {
        let cipher = bound(CipherMode::Ctr, KEY_128);
        let mut out = [0u8; 4];
        assert!(matches!(
            cipher.encrypt(&[0u8; 16], &[0u8; 5], &mut out),
            Err(VaultError::BufferTooSmall { needed: 5, available: 4 })
        ));
    }

    #[test]
    fn test_unaligned_block_input_fails() {
        let cipher = bound(CipherMode::Cbc, KEY_256);
        let mut out = [0xAAu8; 20];
        assert!(matches!(
            cipher.encrypt(&[0u8; 16], &[1u8; 20], &mut out),
            Err(VaultError::Primitive("cipher update"))
        ));
        assert_eq!(out, [0u8; 20]);
    }

    #[test]
    fn test_key_schedules_are_wiped_on_drop() {
        fn wiped_on_drop<T: zeroize::ZeroizeOnDrop>() {}

        wiped_on_drop::<Aes128>();
        wiped_on_drop::<Aes192>();
        wiped_on_drop::<Aes256>();
        wiped_on_drop::<cbc::Encryptor<Aes256>>();
        wiped_on_drop::<cbc::Decryptor<Aes256>>();
        wiped_on_drop::<cfb_mode::Encryptor<Aes256>>();
        wiped_on_drop::<cfb8::Decryptor<Aes256>>();
    }

    #[test]
    fn test_unsupported_key_length() {
        let vault = Vault::new(MasterKey::from_bytes([9u8; 32]));
        let key = vault.import_entry(&[7u8; 20], false).unwrap();
        assert!(matches!(
            vault.aes(CipherMode::Ctr, key),
            Err(VaultError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_key() {
        let vault = Vault::new(MasterKey::from_bytes([9u8; 32]));
        let missing = Handle::new(0xdead).unwrap();
        assert!(matches!(
            vault.aes(CipherMode::Cbc, missing),
            Err(VaultError::NotFound(0xdead))
        ));
    }

    #[test]
    fn test_key_deleted_after_bind() {
        let vault = Vault::new(MasterKey::from_bytes([9u8; 32]));
        let key = vault.import_entry(&[7u8; 16], false).unwrap();
        let cipher = vault.aes(CipherMode::Ofb, key).unwrap();
        vault.delete(key);

        let mut out = [0u8; 16];
        assert!(matches!(
            cipher.encrypt(&[0u8; 16], &[0u8; 16], &mut out),
            Err(VaultError::NotFound(_))
        ));
    }
}
