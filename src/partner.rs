//! Pre-provisioned partner secrets.
//!
//! A provisioned vault is bootstrapped from a sealed blob on disk and holds
//! four entries under fixed handles below [`FIRST_DYNAMIC_HANDLE`]:
//!
//! | handle | entry            | access     |
//! |--------|------------------|------------|
//! | 1      | encryption key   | sealed     |
//! | 2      | integrity key    | sealed     |
//! | 3      | wrapping key     | sealed     |
//! | 4      | device identity  | exportable |
//!
//! The wrapping key is not stored in the blob; it is derived from the
//! encryption and integrity keys at bootstrap.
//!
//! ## Blob layout
//!
//! ```text
//! on disk:   [ IV (16) ][ ciphertext ]
//! plaintext: [ salt (16) ][ encryption key (16) ][ integrity key (32) ][ device id (1..=64) ]
//! ```
//!
//! [`FIRST_DYNAMIC_HANDLE`]: crate::vault::FIRST_DYNAMIC_HANDLE

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::audit::DEFAULT_CAPACITY;
use crate::crypto;
use crate::error::VaultError;
use crate::keys::{self, MasterKey, WRAPPING_KEY_LEN};
use crate::vault::{Handle, Vault, VaultId};

const fn fixed(raw: u32) -> Handle {
    match Handle::new(raw) {
        Some(handle) => handle,
        None => panic!("fixed handles are non-zero"),
    }
}

/// Handle of the provisioned encryption key.
pub const ENCRYPTION_KEY: Handle = fixed(1);
/// Handle of the provisioned integrity key.
pub const INTEGRITY_KEY: Handle = fixed(2);
/// Handle of the derived wrapping key.
pub const WRAPPING_KEY: Handle = fixed(3);
/// Handle of the device identity.
pub const DEVICE_ID: Handle = fixed(4);

const FIXED_HANDLES: [Handle; 4] = [ENCRYPTION_KEY, INTEGRITY_KEY, WRAPPING_KEY, DEVICE_ID];

pub const SALT_LEN: usize = 16;
pub const ENCRYPTION_KEY_LEN: usize = 16;
pub const INTEGRITY_KEY_LEN: usize = 32;
/// Longest device identity a record may carry.
pub const MAX_DEVICE_ID_LEN: usize = 64;

const HEADER_LEN: usize = SALT_LEN + ENCRYPTION_KEY_LEN + INTEGRITY_KEY_LEN;

// ---------------------------------------------------------------------------
// Provisioning record
// ---------------------------------------------------------------------------

/// The decrypted content of a provisioning blob.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ProvisioningRecord {
    pub salt: [u8; SALT_LEN],
    pub encryption_key: [u8; ENCRYPTION_KEY_LEN],
    pub integrity_key: [u8; INTEGRITY_KEY_LEN],
    pub device_id: Vec<u8>,
}

impl fmt::Debug for ProvisioningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRecord")
            .field("device_id_len", &self.device_id.len())
            .finish_non_exhaustive()
    }
}

impl ProvisioningRecord {
    /// Build a record with a fresh random salt.
    pub fn new(
        encryption_key: [u8; ENCRYPTION_KEY_LEN],
        integrity_key: [u8; INTEGRITY_KEY_LEN],
        device_id: &[u8],
    ) -> Result<Self, VaultError> {
        if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(VaultError::InvalidLength(device_id.len()));
        }
        let mut salt = [0u8; SALT_LEN];
        crypto::fill_random(&mut salt)?;
        Ok(Self {
            salt,
            encryption_key,
            integrity_key,
            device_id: device_id.to_vec(),
        })
    }

    /// Serialise in field order.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(HEADER_LEN + self.device_id.len()));
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&self.integrity_key);
        out.extend_from_slice(&self.device_id);
        out
    }

    /// Parse a decrypted record. The device identity is everything after
    /// the fixed-size fields and must be 1 to 64 bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() <= HEADER_LEN || bytes.len() > HEADER_LEN + MAX_DEVICE_ID_LEN {
            return Err(VaultError::InvalidLength(bytes.len()));
        }

        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (encryption_key, rest) = rest.split_at(ENCRYPTION_KEY_LEN);
        let (integrity_key, device_id) = rest.split_at(INTEGRITY_KEY_LEN);

        let mut record = Self {
            salt: [0u8; SALT_LEN],
            encryption_key: [0u8; ENCRYPTION_KEY_LEN],
            integrity_key: [0u8; INTEGRITY_KEY_LEN],
            device_id: device_id.to_vec(),
        };
        record.salt.copy_from_slice(salt);
        record.encryption_key.copy_from_slice(encryption_key);
        record.integrity_key.copy_from_slice(integrity_key);
        Ok(record)
    }

    /// Encrypt under `master` into the on-disk `[IV][ciphertext]` layout.
    pub fn seal(&self, master: &MasterKey) -> Result<Vec<u8>, VaultError> {
        crypto::wrap(master.as_bytes(), &self.to_bytes())
    }

    /// Decrypt and parse an on-disk blob.
    pub fn open(sealed: &[u8], master: &MasterKey) -> Result<Self, VaultError> {
        let plain = Zeroizing::new(crypto::unwrap(master.as_bytes(), sealed)?);
        Self::parse(&plain)
    }

    /// Seal and write the blob to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>, master: &MasterKey) -> Result<(), VaultError> {
        std::fs::write(path, self.seal(master)?)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap and teardown
// ---------------------------------------------------------------------------

impl Vault {
    /// Create a standalone vault provisioned from the blob at `path`,
    /// sealed under `master`.
    ///
    /// Dropping the vault removes the fixed entries.
    pub fn provisioned(master: MasterKey, path: impl AsRef<Path>) -> Result<Arc<Self>, VaultError> {
        Self::provisioned_as(VaultId::Standalone, master, path.as_ref(), DEFAULT_CAPACITY)
    }

    pub(crate) fn provisioned_as(
        id: VaultId,
        master: MasterKey,
        path: &Path,
        audit_capacity: usize,
    ) -> Result<Arc<Self>, VaultError> {
        let mut vault = Self::with_id(id, master, audit_capacity);
        bootstrap(&vault, path)?;
        vault.mark_provisioned();
        Ok(Arc::new(vault))
    }
}

/// Load the blob at `path` into the fixed handles of `vault`.
///
/// On failure no fixed handle is left behind.
pub(crate) fn bootstrap(vault: &Vault, path: &Path) -> Result<(), VaultError> {
    let result = std::fs::read(path)
        .map_err(VaultError::from)
        .and_then(|sealed| ProvisioningRecord::open(&sealed, vault.master_key()))
        .and_then(|record| install(vault, &record));

    match &result {
        Ok(()) => info!(vault = %vault.id(), path = %path.display(), "partner secrets provisioned"),
        Err(err) => {
            teardown(vault);
            warn!(vault = %vault.id(), path = %path.display(), %err, "provisioning failed");
        }
    }
    result
}

fn install(vault: &Vault, record: &ProvisioningRecord) -> Result<(), VaultError> {
    let mut pair = Zeroizing::new([0u8; ENCRYPTION_KEY_LEN + INTEGRITY_KEY_LEN]);
    pair[..ENCRYPTION_KEY_LEN].copy_from_slice(&record.encryption_key);
    pair[ENCRYPTION_KEY_LEN..].copy_from_slice(&record.integrity_key);
    let material = keys::derive_wrapping_key(pair.as_slice())?;

    vault.import_at(ENCRYPTION_KEY, &record.encryption_key, false)?;
    vault.import_at(INTEGRITY_KEY, &record.integrity_key, false)?;
    vault.import_at(WRAPPING_KEY, &material[..WRAPPING_KEY_LEN], false)?;
    vault.import_at(DEVICE_ID, &record.device_id, true)?;
    debug!(vault = %vault.id(), device_id_len = record.device_id.len(), "fixed handles installed");
    Ok(())
}

/// Remove exactly the fixed handles.
pub(crate) fn teardown(vault: &Vault) {
    let mut removed = 0usize;
    for handle in FIXED_HANDLES {
        if vault.remove_fixed(handle) {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(vault = %vault.id(), removed, "partner secrets torn down");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Read-only view of the provisioned partner secrets.
///
/// Keys are reported by handle only; their bytes stay sealed.
#[derive(Debug, Clone)]
pub struct PartnerSecurity {
    vault: Arc<Vault>,
}

impl PartnerSecurity {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// The vault the handles refer to.
    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    /// Length of the device identity, `None` when not provisioned.
    pub fn device_id_size(&self) -> Option<u16> {
        self.vault.size(DEVICE_ID).ok()
    }

    /// The device identity bytes.
    pub fn device_id(&self) -> Option<Vec<u8>> {
        let len = self.device_id_size()?;
        self.vault.export(DEVICE_ID, len).ok().map(|id| id.to_vec())
    }

    pub fn encryption_key(&self) -> Option<Handle> {
        self.available(ENCRYPTION_KEY)
    }

    pub fn integrity_key(&self) -> Option<Handle> {
        self.available(INTEGRITY_KEY)
    }

    pub fn wrapping_key(&self) -> Option<Handle> {
        self.available(WRAPPING_KEY)
    }

    fn available(&self, handle: Handle) -> Option<Handle> {
        self.vault.size_entry(handle, true).ok().map(|_| handle)
    }
}
