//! Runtime configuration.
//!
//! Loaded from a JSON file named by `SEALVAULT_CONFIG`, then overridden field
//! by field from the environment:
//!
//! | variable                   | field            |
//! |----------------------------|------------------|
//! | `SEALVAULT_PARTNER_BLOB`   | `partner_blob`   |
//! | `SEALVAULT_PARTNER_KEY`    | `partner_key`    |
//! | `SEALVAULT_AUDIT_CAPACITY` | `audit_capacity` |

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::DEFAULT_CAPACITY;
use crate::error::VaultError;
use crate::keys::MasterKey;

pub const ENV_CONFIG: &str = "SEALVAULT_CONFIG";
pub const ENV_PARTNER_BLOB: &str = "SEALVAULT_PARTNER_BLOB";
pub const ENV_PARTNER_KEY: &str = "SEALVAULT_PARTNER_KEY";
pub const ENV_AUDIT_CAPACITY: &str = "SEALVAULT_AUDIT_CAPACITY";

/// Settings for the process-wide vaults.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sealed provisioning blob for the partner vault.
    pub partner_blob: Option<PathBuf>,
    /// Hex encoded 32-byte key the partner blob is sealed under.
    pub partner_key: Option<String>,
    /// Audit records kept in memory per vault.
    pub audit_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partner_blob: None,
            partner_key: None,
            audit_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("partner_blob", &self.partner_blob)
            .field("partner_key", &self.partner_key.as_ref().map(|_| "<redacted>"))
            .field("audit_capacity", &self.audit_capacity)
            .finish()
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, VaultError> {
        serde_json::from_str(json).map_err(|err| VaultError::Config(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, VaultError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, VaultError> {
        let mut config = match lookup(ENV_CONFIG) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(blob) = lookup(ENV_PARTNER_BLOB) {
            config.partner_blob = Some(PathBuf::from(blob));
        }
        if let Some(key) = lookup(ENV_PARTNER_KEY) {
            config.partner_key = Some(key);
        }
        if let Some(capacity) = lookup(ENV_AUDIT_CAPACITY) {
            config.audit_capacity = capacity.trim().parse().map_err(|_| {
                VaultError::Config(format!("{ENV_AUDIT_CAPACITY} is not a number: {capacity}"))
            })?;
        }
        Ok(config)
    }

    /// The partner master key, if one is configured.
    pub fn partner_master_key(&self) -> Result<Option<MasterKey>, VaultError> {
        self.partner_key
            .as_deref()
            .map(|hex| {
                MasterKey::from_hex(hex)
                    .map_err(|_| VaultError::Config("partner key is not 32 hex-encoded bytes".into()))
            })
            .transpose()
    }
}
