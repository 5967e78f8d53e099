//! Streaming digests and vault-keyed HMAC.
//!
//! A [`Hash`] is either a plain digest or an HMAC whose secret lives in a
//! vault. The context moves `Active -> Done` on a successful
//! [`calculate`](Hash::calculate); any failure moves it to `Failed`, which is
//! terminal. Only reconstruction clears a failure.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::digest::{FixedOutput, Update};
use sha2::{Sha224, Sha256, Sha384, Sha512};
use tracing::warn;

use crate::error::VaultError;
use crate::vault::{Handle, Vault};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Fixed output size in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sha1 => "SHA1",
            Self::Sha224 => "SHA224",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Primitive contexts
// ---------------------------------------------------------------------------

enum Engine {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    HmacSha1(Hmac<Sha1>),
    HmacSha224(Hmac<Sha224>),
    HmacSha256(Hmac<Sha256>),
    HmacSha384(Hmac<Sha384>),
    HmacSha512(Hmac<Sha512>),
}

macro_rules! dispatch {
    ($engine:expr, $ctx:ident => $body:expr) => {
        match $engine {
            Engine::Sha1($ctx) => $body,
            Engine::Sha224($ctx) => $body,
            Engine::Sha256($ctx) => $body,
            Engine::Sha384($ctx) => $body,
            Engine::Sha512($ctx) => $body,
            Engine::HmacSha1($ctx) => $body,
            Engine::HmacSha224($ctx) => $body,
            Engine::HmacSha256($ctx) => $body,
            Engine::HmacSha384($ctx) => $body,
            Engine::HmacSha512($ctx) => $body,
        }
    };
}

impl Engine {
    fn digest(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::default()),
            HashAlgorithm::Sha224 => Self::Sha224(Sha224::default()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::default()),
            HashAlgorithm::Sha384 => Self::Sha384(Sha384::default()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::default()),
        }
    }

    fn keyed(algorithm: HashAlgorithm, key: &[u8]) -> Result<Self, VaultError> {
        let engine = match algorithm {
            HashAlgorithm::Sha1 => <Hmac<Sha1> as Mac>::new_from_slice(key).map(Self::HmacSha1),
            HashAlgorithm::Sha224 => <Hmac<Sha224> as Mac>::new_from_slice(key).map(Self::HmacSha224),
            HashAlgorithm::Sha256 => <Hmac<Sha256> as Mac>::new_from_slice(key).map(Self::HmacSha256),
            HashAlgorithm::Sha384 => <Hmac<Sha384> as Mac>::new_from_slice(key).map(Self::HmacSha384),
            HashAlgorithm::Sha512 => <Hmac<Sha512> as Mac>::new_from_slice(key).map(Self::HmacSha512),
        };
        engine.map_err(|_| VaultError::InvalidKey)
    }

    fn update(&mut self, data: &[u8]) {
        dispatch!(self, ctx => Update::update(ctx, data))
    }

    /// `out` must hold at least the algorithm's digest length.
    fn finalize_into(self, out: &mut [u8]) {
        dispatch!(self, ctx => {
            let digest = FixedOutput::finalize_fixed(ctx);
            out[..digest.len()].copy_from_slice(&digest);
        })
    }
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

enum State {
    Active(Box<Engine>),
    Done,
    Failed,
}

/// A streaming digest or HMAC context.
pub struct Hash {
    algorithm: HashAlgorithm,
    state: State,
    // Keeps the vault holding the HMAC secret alive.
    vault: Option<Arc<Vault>>,
    secret: Option<Handle>,
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Active(_) => "active",
            State::Done => "done",
            State::Failed => "failed",
        };
        f.debug_struct("Hash")
            .field("algorithm", &self.algorithm)
            .field("state", &state)
            .field("vault", &self.vault.as_ref().map(|v| v.id()))
            .field("secret", &self.secret)
            .finish()
    }
}

impl Hash {
    /// A plain digest context.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            state: State::Active(Box::new(Engine::digest(algorithm))),
            vault: None,
            secret: None,
        }
    }

    /// An HMAC context keyed by the vault entry under `secret`.
    ///
    /// The exported secret is zeroised as soon as the context is keyed.
    pub(crate) fn hmac(vault: Arc<Vault>, algorithm: HashAlgorithm, secret: Handle) -> Self {
        let state = match Self::keyed_engine(&vault, algorithm, secret) {
            Ok(engine) => State::Active(Box::new(engine)),
            Err(err) => {
                warn!(vault = %vault.id(), %secret, %algorithm, %err, "HMAC context failed at construction");
                State::Failed
            }
        };

        Self {
            algorithm,
            state,
            vault: Some(vault),
            secret: Some(secret),
        }
    }

    fn keyed_engine(vault: &Vault, algorithm: HashAlgorithm, secret: Handle) -> Result<Engine, VaultError> {
        let len = vault.size_entry(secret, true)?;
        let key = vault.export_entry(secret, len, true)?;
        if key.len() != usize::from(len) {
            return Err(VaultError::InvalidLength(key.len()));
        }
        Engine::keyed(algorithm, &key)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// True once the failure latch has been set.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    fn fail(&mut self, reason: &VaultError) {
        if !self.is_failed() {
            warn!(algorithm = %self.algorithm, err = %reason, "hash context latched failed");
        }
        self.state = State::Failed;
    }

    /// Feed `data` into the context. Returns the number of bytes consumed.
    pub fn ingest(&mut self, data: &[u8]) -> Result<usize, VaultError> {
        if u32::try_from(data.len()).is_err() {
            let err = VaultError::InvalidLength(data.len());
            self.fail(&err);
            return Err(err);
        }

        match &mut self.state {
            State::Active(engine) => {
                engine.update(data);
                Ok(data.len())
            }
            State::Done => Err(VaultError::Finalized),
            State::Failed => Err(VaultError::ContextFailed),
        }
    }

    /// Finalize into `output`, returning the digest length.
    ///
    /// An `output` shorter than the digest length fails the context.
    pub fn calculate(&mut self, output: &mut [u8]) -> Result<usize, VaultError> {
        let needed = self.algorithm.digest_len();

        match std::mem::replace(&mut self.state, State::Failed) {
            State::Active(engine) => {
                if output.len() < needed {
                    let err = VaultError::BufferTooSmall {
                        needed,
                        available: output.len(),
                    };
                    self.state = State::Active(engine);
                    self.fail(&err);
                    return Err(err);
                }
                (*engine).finalize_into(output);
                self.state = State::Done;
                Ok(needed)
            }
            State::Done => {
                self.state = State::Done;
                Err(VaultError::Finalized)
            }
            State::Failed => Err(VaultError::ContextFailed),
        }
    }
}

/// One-shot digest of `data`.
pub(crate) fn digest_once(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; algorithm.digest_len()];
    Engine::digest(algorithm).tap_update(data).finalize_into(&mut out);
    out
}

/// One-shot HMAC of `data` under a key held in memory.
pub(crate) fn hmac_once(algorithm: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut out = vec![0u8; algorithm.digest_len()];
    Engine::keyed(algorithm, key)?.tap_update(data).finalize_into(&mut out);
    Ok(out)
}

impl Engine {
    fn tap_update(mut self, data: &[u8]) -> Self {
        self.update(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;

    fn hex_digest(algorithm: HashAlgorithm, data: &[u8]) -> String {
        let mut hash = Hash::new(algorithm);
        hash.ingest(data).unwrap();
        let mut out = [0u8; 64];
        let len = hash.calculate(&mut out).unwrap();
        assert_eq!(len, algorithm.digest_len());
        hex::encode(&out[..len])
    }

    #[test]
    fn test_abc_vectors() {
        assert_eq!(hex_digest(HashAlgorithm::Sha1, b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            hex_digest(HashAlgorithm::Sha224, b"abc"),
            "23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
        assert_eq!(
            hex_digest(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex_digest(HashAlgorithm::Sha384, b"abc"),
            "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed\
             8086072ba1e7cc2358baeca134c825a7"
        );
        assert_eq!(
            hex_digest(HashAlgorithm::Sha512, b"abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hash = Hash::new(HashAlgorithm::Sha256);
        assert_eq!(hash.ingest(b"a").unwrap(), 1);
        assert_eq!(hash.ingest(b"bc").unwrap(), 2);
        let mut out = [0u8; 32];
        hash.calculate(&mut out).unwrap();
        assert_eq!(out.to_vec(), digest_once(HashAlgorithm::Sha256, b"abc"));
    }

    #[test]
    fn test_hmac_from_vault_secret() {
        let vault = Vault::new(MasterKey::from_bytes([1u8; 32]));
        let secret = vault.import_entry(b"Jefe", false).unwrap();

        let mut mac = vault.hmac(HashAlgorithm::Sha256, secret);
        mac.ingest(b"what do ya want for nothing?").unwrap();
        let mut out = [0u8; 32];
        mac.calculate(&mut out).unwrap();
        assert_eq!(
            hex::encode(out),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert_eq!(
            hmac_once(HashAlgorithm::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap(),
            out.to_vec()
        );
    }

    #[test]
    fn test_short_output_latches_failure() {
        let mut hash = Hash::new(HashAlgorithm::Sha384);
        hash.ingest(b"data").unwrap();
        let mut short = [0u8; 32];
        assert!(matches!(
            hash.calculate(&mut short),
            Err(VaultError::BufferTooSmall { needed: 48, available: 32 })
        ));
        assert!(hash.is_failed());

        let mut enough = [0u8; 48];
        assert!(matches!(hash.ingest(b"more"), Err(VaultError::ContextFailed)));
        assert!(matches!(hash.calculate(&mut enough), Err(VaultError::ContextFailed)));
    }

    #[test]
    fn test_missing_secret_starts_failed() {
        let vault = Vault::new(MasterKey::from_bytes([1u8; 32]));
        let missing = Handle::new(0x1234).unwrap();
        let mut mac = vault.hmac(HashAlgorithm::Sha1, missing);
        assert!(mac.is_failed());
        assert!(mac.ingest(b"x").is_err());
    }

    #[test]
    fn test_calculate_twice_is_finalized() {
        let mut hash = Hash::new(HashAlgorithm::Sha1);
        let mut out = [0u8; 20];
        hash.calculate(&mut out).unwrap();
        assert!(matches!(hash.calculate(&mut out), Err(VaultError::Finalized)));
        assert!(matches!(hash.ingest(b"late"), Err(VaultError::Finalized)));
        assert!(!hash.is_failed());
    }
}
