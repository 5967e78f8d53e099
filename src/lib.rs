//! # sealvault
//!
//! Handle-based secret storage with vault-keyed cryptographic engines.
//!
//! Secrets live in a [`Vault`] and are referenced by opaque [`Handle`]s.
//! Entries are either exportable or sealed; sealed entries are only ever
//! consumed inside the crate by the HMAC, AES and Diffie-Hellman engines a
//! vault hands out. Every imported entry is wrapped at rest under the
//! vault's master key.
//!
//! ## Public API
//!
//! [`Cryptography`] is the lifecycle facade: it hands out plain digests and
//! the two process-wide vaults. Standalone vaults can be created directly
//! with [`Vault::new`] or [`Vault::provisioned`].
//!
//! ```no_run
//! use sealvault::{CipherMode, Cryptography, VaultId};
//!
//! let crypto = Cryptography::from_env()?;
//! let vault = crypto.vault(VaultId::Platform).expect("platform vault");
//! let key = vault.import(&[0x2b; 16])?;
//! let aes = vault.aes(CipherMode::Cbc, key)?;
//!
//! let mut out = [0u8; 32];
//! aes.encrypt(&[0u8; 16], &[0x6b; 32], &mut out)?;
//! # Ok::<(), sealvault::VaultError>(())
//! ```

pub mod audit;
pub mod cipher;
pub mod config;
pub(crate) mod crypto;
pub(crate) mod derive;
pub mod dh;
pub mod error;
pub mod hash;
pub mod keys;
pub mod partner;
pub mod vault;

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

pub use crate::cipher::{Cipher, CipherMode};
pub use crate::config::Config;
pub use crate::dh::{DiffieHellman, SessionKeys};
pub use crate::error::{ErrorKind, VaultError};
pub use crate::hash::{Hash, HashAlgorithm};
pub use crate::keys::MasterKey;
pub use crate::partner::{PartnerSecurity, ProvisioningRecord};
pub use crate::vault::{Handle, Vault, VaultId};

static PLATFORM: OnceLock<Option<Arc<Vault>>> = OnceLock::new();
static PARTNER: OnceLock<Option<Arc<Vault>>> = OnceLock::new();

/// Entry point to digests and the process-wide vaults.
///
/// The Platform and Partner vaults are created on first access and live for
/// the rest of the process. The configuration of the first `Cryptography`
/// to touch a vault decides how that vault is built.
#[derive(Debug, Clone, Default)]
pub struct Cryptography {
    config: Config,
}

impl Cryptography {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build from [`Config::from_env`].
    pub fn from_env() -> Result<Self, VaultError> {
        Ok(Self::new(Config::from_env()?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A plain digest context.
    pub fn hash(&self, algorithm: HashAlgorithm) -> Hash {
        Hash::new(algorithm)
    }

    /// One of the process-wide vaults. `None` for [`VaultId::Standalone`],
    /// or when the vault could not be created.
    pub fn vault(&self, id: VaultId) -> Option<Arc<Vault>> {
        let slot = match id {
            VaultId::Platform => PLATFORM.get_or_init(|| self.platform_vault()),
            VaultId::Partner => PARTNER.get_or_init(|| self.partner_vault()),
            VaultId::Standalone => return None,
        };
        slot.clone()
    }

    /// The partner entry point over the Partner vault.
    pub fn partner(&self) -> Option<PartnerSecurity> {
        self.vault(VaultId::Partner).map(PartnerSecurity::new)
    }

    /// Remove the provisioned partner secrets before the process exits.
    ///
    /// The process-wide vaults live in statics and are never dropped, so the
    /// teardown a provisioned vault runs on drop has to be triggered here.
    /// The Partner vault stays usable afterwards without its fixed entries.
    pub fn shutdown() {
        if let Some(Some(vault)) = PARTNER.get() {
            if vault.is_provisioned() {
                partner::teardown(vault);
            }
        }
        info!("process-wide vaults shut down");
    }

    fn platform_vault(&self) -> Option<Arc<Vault>> {
        match MasterKey::generate() {
            Ok(master) => Some(Arc::new(Vault::with_id(
                VaultId::Platform,
                master,
                self.config.audit_capacity,
            ))),
            Err(err) => {
                warn!(%err, "platform vault unavailable");
                None
            }
        }
    }

    /// A provisioned vault when both blob and key are configured and the
    /// blob loads; an empty vault otherwise.
    fn partner_vault(&self) -> Option<Arc<Vault>> {
        let capacity = self.config.audit_capacity;

        let master = match self.config.partner_master_key() {
            Ok(master) => master,
            Err(err) => {
                warn!(%err, "ignoring partner key");
                None
            }
        };

        if let (Some(master), Some(path)) = (master, self.config.partner_blob.as_deref()) {
            match Vault::provisioned_as(VaultId::Partner, master, path, capacity) {
                Ok(vault) => return Some(vault),
                Err(err) => warn!(%err, "partner vault starts empty"),
            }
        } else {
            info!("no partner provisioning configured");
        }

        match MasterKey::generate() {
            Ok(master) => Some(Arc::new(Vault::with_id(VaultId::Partner, master, capacity))),
            Err(err) => {
                warn!(%err, "partner vault unavailable");
                None
            }
        }
    }
}

/// Generate a random vault master key.
///
/// In production, master keys for provisioned vaults come from the party
/// that seals the provisioning blob.
pub fn generate_master_key() -> Result<MasterKey, VaultError> {
    MasterKey::generate()
}
