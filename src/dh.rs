//! Finite-field Diffie-Hellman over caller-supplied groups.
//!
//! Private keys never leave the vault: [`DiffieHellman::generate`] stores the
//! full private key sealed and only the public value exportable. Shared
//! secrets and session keys derived from them are stored sealed as well.
//!
//! ## Key blobs
//!
//! ```text
//! private: [len:u16 BE][p][len][g][len][x][len][y]
//! public:  [y]                       (big-endian, no leading zeros)
//! ```

use std::fmt;
use std::sync::Arc;

use num_bigint::BigUint;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::derive::{self, DERIVATION_KEY_LEN};
use crate::error::VaultError;
use crate::vault::{Handle, Vault};

/// Largest modulus accepted, in bytes.
pub const MAX_MODULUS_LEN: usize = 1024;

/// Handles of the session keys produced by
/// [`DiffieHellman::authenticated_derive`]. All three are sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub encryption: Handle,
    pub hmac: Handle,
    pub wrapping: Handle,
}

/// Miller-Rabin rounds run against a caller-supplied modulus.
const PRIMALITY_ROUNDS: usize = 32;

/// Extra random bytes drawn for a private exponent so the reduction mod
/// `p - 3` stays close to uniform.
const PRIVATE_OVERSAMPLE: usize = 16;

const SMALL_PRIMES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

struct Group {
    p: BigUint,
    g: BigUint,
}

impl Group {
    /// Reject groups that are not usable: even or tiny moduli, oversized
    /// moduli, composite moduli, and generators outside `[2, p - 2]`.
    fn validate(p: BigUint, g: BigUint) -> Result<Self, VaultError> {
        let group = Self::checked(p, g)?;
        if !is_probable_prime(&group.p)? {
            return Err(VaultError::InvalidParameters);
        }
        Ok(group)
    }

    /// The structural checks of [`validate`](Self::validate). Enough for
    /// groups read back from a private key blob, which were validated when
    /// the key was generated.
    fn checked(p: BigUint, g: BigUint) -> Result<Self, VaultError> {
        let two = BigUint::from(2u32);
        let bytes = p.to_bytes_be();
        let odd = bytes.last().is_some_and(|b| b & 1 == 1);

        if !odd || p <= BigUint::from(5u32) || bytes.len() > MAX_MODULUS_LEN {
            return Err(VaultError::InvalidParameters);
        }
        if g < two || g > &p - &two {
            return Err(VaultError::InvalidParameters);
        }
        Ok(Self { p, g })
    }

    /// Accept peer values in `(1, p - 1)`.
    fn check_public(&self, y: &BigUint) -> Result<(), VaultError> {
        let one = BigUint::from(1u32);
        if *y <= one || *y >= &self.p - &one {
            return Err(VaultError::InvalidPublicKey);
        }
        Ok(())
    }

    /// A private exponent in `[2, p - 2]`.
    fn random_private(&self) -> Result<BigUint, VaultError> {
        let len = self.p.to_bytes_be().len() + PRIVATE_OVERSAMPLE;
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        crypto::fill_random(&mut bytes)?;
        let span = &self.p - BigUint::from(3u32);
        Ok(BigUint::from_bytes_be(&bytes) % span + BigUint::from(2u32))
    }
}

/// Trial division by small primes, then Miller-Rabin with random bases.
fn is_probable_prime(n: &BigUint) -> Result<bool, VaultError> {
    let zero = BigUint::from(0u32);
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);

    if *n < two {
        return Ok(false);
    }
    for q in SMALL_PRIMES.map(BigUint::from) {
        if *n == q {
            return Ok(true);
        }
        if n % &q == zero {
            return Ok(false);
        }
    }

    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    let span = n - BigUint::from(3u32);
    let mut bytes = vec![0u8; n.to_bytes_be().len() + PRIVATE_OVERSAMPLE];

    'rounds: for _ in 0..PRIMALITY_ROUNDS {
        crypto::fill_random(&mut bytes)?;
        let a = BigUint::from_bytes_be(&bytes) % &span + &two;

        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'rounds;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

struct PrivateKey {
    group: Group,
    x: BigUint,
    y: BigUint,
}

impl PrivateKey {
    fn to_blob(&self) -> Zeroizing<Vec<u8>> {
        let mut blob = Zeroizing::new(Vec::new());
        for part in [&self.group.p, &self.group.g, &self.x, &self.y] {
            let mut bytes = part.to_bytes_be();
            // Components are bounded by the modulus, which fits in a u16 length.
            blob.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            blob.extend_from_slice(&bytes);
            bytes.zeroize();
        }
        blob
    }

    fn from_blob(blob: &[u8]) -> Result<Self, VaultError> {
        let mut rest = blob;
        let mut next = || -> Result<BigUint, VaultError> {
            if rest.len() < 2 {
                return Err(VaultError::MalformedKey);
            }
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            if len == 0 || rest.len() < 2 + len {
                return Err(VaultError::MalformedKey);
            }
            let value = BigUint::from_bytes_be(&rest[2..2 + len]);
            rest = &rest[2 + len..];
            Ok(value)
        };

        let p = next()?;
        let g = next()?;
        let x = next()?;
        let y = next()?;
        if !rest.is_empty() {
            return Err(VaultError::MalformedKey);
        }

        let group = Group::checked(p, g).map_err(|_| VaultError::MalformedKey)?;
        Ok(Self { group, x, y })
    }
}

/// A Diffie-Hellman engine whose keys live in a vault.
pub struct DiffieHellman {
    vault: Arc<Vault>,
}

impl fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffieHellman")
            .field("vault", &self.vault.id())
            .finish()
    }
}

impl DiffieHellman {
    pub(crate) fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// Generate a key pair in the group `(modulus, generator)`.
    ///
    /// Returns `(private, public)`. The private handle is sealed; the public
    /// handle holds the big-endian public value and is exportable.
    pub fn generate(&self, generator: u8, modulus: &[u8]) -> Result<(Handle, Handle), VaultError> {
        if generator == 0 || modulus.is_empty() {
            return Err(VaultError::InvalidParameters);
        }

        let group = Group::validate(BigUint::from_bytes_be(modulus), BigUint::from(generator))
            .inspect_err(|_| warn!(vault = %self.vault.id(), "rejected Diffie-Hellman parameters"))?;
        let x = group.random_private()?;
        self.store_keypair(group, x)
    }

    fn store_keypair(&self, group: Group, x: BigUint) -> Result<(Handle, Handle), VaultError> {
        let y = group.g.modpow(&x, &group.p);
        let public_value = y.to_bytes_be();
        let key = PrivateKey { group, x, y };

        let private = self.vault.import_entry(&key.to_blob(), false)?;
        let public = match self.vault.import_entry(&public_value, true) {
            Ok(handle) => handle,
            Err(err) => {
                self.vault.delete(private);
                return Err(err);
            }
        };

        debug!(vault = %self.vault.id(), %private, %public, "Diffie-Hellman key pair generated");
        Ok((private, public))
    }

    /// Compute the shared secret with the peer value under `peer_public` and
    /// store it sealed.
    pub fn derive(&self, private: Handle, peer_public: Handle) -> Result<Handle, VaultError> {
        let shared = self.shared_secret(private, peer_public)?;
        let secret = self.vault.import_entry(&shared, false)?;
        debug!(vault = %self.vault.id(), %private, %peer_public, %secret, "shared secret stored");
        Ok(secret)
    }

    /// Derive encryption, integrity and wrapping keys from the shared secret
    /// and the 16-byte key under `derivation_key`.
    ///
    /// Either all three keys are stored or none are.
    pub fn authenticated_derive(
        &self,
        private: Handle,
        peer_public: Handle,
        derivation_key: Handle,
    ) -> Result<SessionKeys, VaultError> {
        let shared = self.shared_secret(private, peer_public)?;

        let len = self.vault.size_entry(derivation_key, true)?;
        if usize::from(len) != DERIVATION_KEY_LEN {
            warn!(vault = %self.vault.id(), %derivation_key, len, "derivation key has wrong length");
            return Err(VaultError::InvalidKey);
        }
        let dk = self.vault.export_entry(derivation_key, len, true)?;
        let keys = derive::derive_session_keys(&shared, &dk)?;
        drop(dk);
        drop(shared);

        let mut stored: Vec<Handle> = Vec::with_capacity(3);
        for material in [&keys.encryption[..], &keys.hmac[..], &keys.wrapping[..]] {
            match self.vault.import_entry(material, false) {
                Ok(handle) => stored.push(handle),
                Err(err) => {
                    for handle in stored {
                        self.vault.delete(handle);
                    }
                    return Err(err);
                }
            }
        }

        let session = SessionKeys {
            encryption: stored[0],
            hmac: stored[1],
            wrapping: stored[2],
        };
        info!(
            vault = %self.vault.id(),
            encryption = %session.encryption,
            hmac = %session.hmac,
            wrapping = %session.wrapping,
            "session keys derived"
        );
        Ok(session)
    }

    fn shared_secret(&self, private: Handle, peer_public: Handle) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let len = self.vault.size_entry(private, true)?;
        let key = PrivateKey::from_blob(&self.vault.export_entry(private, len, true)?)?;

        let len = self.vault.size_entry(peer_public, true)?;
        let peer = BigUint::from_bytes_be(&self.vault.export_entry(peer_public, len, true)?);
        key.group.check_public(&peer).inspect_err(|_| {
            warn!(vault = %self.vault.id(), %peer_public, "rejected peer public value");
        })?;

        let z = peer.modpow(&key.x, &key.group.p);
        Ok(Zeroizing::new(z.to_bytes_be()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;

    // 768-bit MODP group (RFC 2409, group 1).
    const PRIME: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                         020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                         4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF";

    fn vault() -> Arc<Vault> {
        Vault::new(MasterKey::from_bytes([5u8; 32]))
    }

    fn group() -> Group {
        Group::validate(BigUint::from_bytes_be(&hex::decode(PRIME).unwrap()), BigUint::from(2u32))
            .unwrap()
    }

    fn fixed(pattern: &str) -> BigUint {
        BigUint::parse_bytes(pattern.repeat(6).as_bytes(), 16).unwrap()
    }

    fn read(vault: &Vault, handle: Handle) -> Vec<u8> {
        let len = vault.size_entry(handle, true).unwrap();
        vault.export_entry(handle, len, true).unwrap().to_vec()
    }

    #[test]
    fn test_fixed_keypairs_agree() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let (priv_a, pub_a) = dh.store_keypair(group(), fixed("1234567890abcdef")).unwrap();
        let (priv_b, pub_b) = dh.store_keypair(group(), fixed("fedcba0987654321")).unwrap();

        assert_eq!(
            hex::encode(vault.export(pub_a, 1024).unwrap().as_slice()),
            "b8afce81b11b48f2394e4c179870dbb554a49000fd8f37ae1b8e79e4569989ea\
             ef6aa9659dbb367e6753b867b64ece012732e6aed704e6912972fc6cddc17c83\
             4b621914d0e987eaa0fda02cfee3e2b6a09f92ca93264e6b713010a7a13f17fa"
        );
        assert_eq!(
            hex::encode(vault.export(pub_b, 1024).unwrap().as_slice()),
            "6d22fe63b130ca73021a1cfc2122515115e41e6e472962a024c78484889b91cf\
             9d174fe0d677ed50c6f91cf6bb54c70139c2169524974646ef2bf4e8aedb0978\
             92a5225371305399af75639418bbae8156ee42a0d38002a61308724401d22752"
        );

        let s_ab = dh.derive(priv_a, pub_b).unwrap();
        let s_ba = dh.derive(priv_b, pub_a).unwrap();
        assert_eq!(read(&vault, s_ab), read(&vault, s_ba));
        assert_eq!(
            hex::encode(read(&vault, s_ab)),
            "35fe4f420c675d5d2bc8992f55ece913036dff8aac9ed18d7a0e2d810abadf54\
             51d586a0fc6d7b39e9c4eb01632bb33aee21203600a583410027a1c40affa0c8\
             a8ae3a5a170fb7e2e6787b97f58e1e8cedb97ef315b7b1da506e43b7e3818aa6"
        );
    }

    #[test]
    fn test_private_key_is_sealed() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let (private, public) = dh.generate(2, &hex::decode(PRIME).unwrap()).unwrap();

        assert!(matches!(vault.export(private, 1024), Err(VaultError::Sealed(_))));
        assert!(vault.size(public).unwrap() > 0);
        assert!(PrivateKey::from_blob(&read(&vault, private)).is_ok());
    }

    #[test]
    fn test_authenticated_derive_vector() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let (priv_a, _) = dh.store_keypair(group(), fixed("1234567890abcdef")).unwrap();
        let (_, pub_b) = dh.store_keypair(group(), fixed("fedcba0987654321")).unwrap();
        let dk = vault.import_entry(&(0u8..16).collect::<Vec<_>>(), false).unwrap();

        let keys = dh.authenticated_derive(priv_a, pub_b, dk).unwrap();
        assert_eq!(hex::encode(read(&vault, keys.encryption)), "067c4b9b5f9a34cce5e094ec4b85ec77");
        assert_eq!(
            hex::encode(read(&vault, keys.hmac)),
            "3553db8d3c6411c6ff2b30cf7d4613e81a11f6ef3883b7b99174c40a6c093fcf"
        );
        assert_eq!(hex::encode(read(&vault, keys.wrapping)), "5cdc1d6723ffca40a804904aeb8df8ec");
        assert!(matches!(vault.export(keys.hmac, 32), Err(VaultError::Sealed(_))));
    }

    #[test]
    fn test_authenticated_derive_rejects_bad_derivation_key() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let (priv_a, _) = dh.store_keypair(group(), fixed("1234567890abcdef")).unwrap();
        let (_, pub_b) = dh.store_keypair(group(), fixed("fedcba0987654321")).unwrap();
        let dk = vault.import_entry(&[1u8; 15], false).unwrap();
        let before = vault.len();

        assert!(matches!(
            dh.authenticated_derive(priv_a, pub_b, dk),
            Err(VaultError::InvalidKey)
        ));
        assert_eq!(vault.len(), before);
    }

    #[test]
    fn test_parameter_validation() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let prime = hex::decode(PRIME).unwrap();

        assert!(matches!(dh.generate(0, &prime), Err(VaultError::InvalidParameters)));
        assert!(matches!(dh.generate(1, &prime), Err(VaultError::InvalidParameters)));
        assert!(matches!(dh.generate(2, &[]), Err(VaultError::InvalidParameters)));
        assert!(matches!(dh.generate(2, &[0x10]), Err(VaultError::InvalidParameters)));
        assert!(matches!(dh.generate(2, &[0x05]), Err(VaultError::InvalidParameters)));
        // Odd composites: 9 and 255 = 3 * 5 * 17.
        assert!(matches!(dh.generate(2, &[0x09]), Err(VaultError::InvalidParameters)));
        assert!(matches!(dh.generate(2, &[0xFF]), Err(VaultError::InvalidParameters)));
        assert!(matches!(
            dh.generate(2, &vec![0xFF; MAX_MODULUS_LEN + 1]),
            Err(VaultError::InvalidParameters)
        ));
        assert!(vault.is_empty());
    }

    #[test]
    fn test_peer_value_validation() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let (private, _) = dh.generate(2, &hex::decode(PRIME).unwrap()).unwrap();

        let one = vault.import(&[0x01]).unwrap();
        assert!(matches!(dh.derive(private, one), Err(VaultError::InvalidPublicKey)));

        let p_minus_one = (group().p - BigUint::from(1u32)).to_bytes_be();
        let edge = vault.import(&p_minus_one).unwrap();
        assert!(matches!(dh.derive(private, edge), Err(VaultError::InvalidPublicKey)));
    }

    #[test]
    fn test_malformed_private_blob() {
        let vault = vault();
        let dh = vault.diffie_hellman();
        let junk = vault.import_entry(&[0x00, 0x04, 1, 2], false).unwrap();
        let peer = vault.import(&[0x05]).unwrap();
        assert!(matches!(dh.derive(junk, peer), Err(VaultError::MalformedKey)));
    }

    #[test]
    fn test_primality() {
        for prime in [7u64, 23, 37, 41, 65_537, 0xFFFF_FFFF_FFFF_FFC5] {
            assert!(is_probable_prime(&BigUint::from(prime)).unwrap(), "{prime}");
        }
        // 561 and 41041 are Carmichael numbers; the last is 2^64 - 57.
        for composite in [1u64, 9, 255, 561, 41_041, 0xFFFF_FFFF_FFFF_FFC7] {
            assert!(!is_probable_prime(&BigUint::from(composite)).unwrap(), "{composite}");
        }
        assert!(is_probable_prime(&group().p).unwrap());
        assert!(!is_probable_prime(&(group().p * BigUint::from(3u32))).unwrap());
    }

    #[test]
    fn test_random_private_is_close_to_uniform() {
        // For p = 173 a single-byte draw reduced mod 170 lands in [2, 87]
        // two times out of three; uniform is 86 / 170.
        let group = Group::validate(BigUint::from(173u32), BigUint::from(2u32)).unwrap();
        let cut = BigUint::from(87u32);
        let draws = 20_000;
        let low = (0..draws)
            .filter(|_| group.random_private().unwrap() <= cut)
            .count();
        let share = low as f64 / draws as f64;
        assert!((0.47..0.55).contains(&share), "{share}");
    }

    #[test]
    fn test_random_private_in_range() {
        let group = Group::validate(BigUint::from(23u32), BigUint::from(5u32)).unwrap();
        for _ in 0..200 {
            let x = group.random_private().unwrap();
            assert!(x >= BigUint::from(2u32) && x <= BigUint::from(21u32));
        }
    }
}
