//! Handle-based secret storage.
//!
//! A vault maps opaque 32-bit handles to byte blobs. Blobs stored through
//! [`Vault::import`] are wrapped at rest with the vault's master key and carry
//! an exportable/sealed flag; blobs stored through [`Vault::put`] are kept
//! verbatim, always sealed, and only come back through [`Vault::get`].
//!
//! Sealed entries never leave the vault through the public API. The hash,
//! cipher and Diffie-Hellman engines read them through crate-internal calls.
//!
//! Every operation holds the vault lock for its full duration. Audit sinks
//! run after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::audit::{AuditLog, AuditRecord, AuditSink, Operation, Outcome, DEFAULT_CAPACITY};
use crate::cipher::{Cipher, CipherMode};
use crate::crypto::{self, IV_LEN};
use crate::dh::DiffieHellman;
use crate::error::VaultError;
use crate::hash::{Hash, HashAlgorithm};
use crate::keys::MasterKey;

/// First handle handed out by [`Vault::import`] and [`Vault::put`].
/// Handles below it are reserved for fixed-purpose provisioned secrets.
pub const FIRST_DYNAMIC_HANDLE: u32 = 0x8000_0001;

/// Upper bound on the stored length of any entry.
pub const MAX_STORED_LEN: usize = u16::MAX as usize;

/// Largest plaintext [`Vault::import`] accepts.
pub const MAX_IMPORT_LEN: usize = MAX_STORED_LEN - IV_LEN;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// An opaque reference to a vault entry. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Wrap a raw handle value. Returns `None` for 0.
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// The raw 32-bit value.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#010x})", self.get())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.get())
    }
}

/// Identifies a vault instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultId {
    /// The general-purpose process vault.
    Platform,
    /// The pre-provisioned partner vault.
    Partner,
    /// Any vault created directly by a caller.
    Standalone,
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Platform => "platform",
            Self::Partner => "partner",
            Self::Standalone => "standalone",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Zeroize, ZeroizeOnDrop)]
struct Entry {
    /// `[IV][ciphertext]` for imported entries, raw bytes for `put` entries.
    stored: Vec<u8>,
    exportable: bool,
    wrapped: bool,
}

impl Entry {
    fn logical_len(&self) -> usize {
        if self.wrapped {
            self.stored.len() - IV_LEN
        } else {
            self.stored.len()
        }
    }
}

struct VaultState {
    entries: HashMap<Handle, Entry>,
    next_handle: u32,
    audit: AuditLog,
}

impl VaultState {
    fn allocate(&mut self) -> Result<Handle, VaultError> {
        let handle = Handle::new(self.next_handle).ok_or(VaultError::Exhausted)?;
        self.next_handle = self.next_handle.wrapping_add(1);
        Ok(handle)
    }

    fn record(&mut self, vault: VaultId, operation: Operation, handle: u32, outcome: Outcome) {
        self.audit.append(AuditRecord::new(vault, operation, handle, outcome));
    }
}

fn outcome_of(err: &VaultError) -> Outcome {
    match err {
        VaultError::NotFound(_) => Outcome::NotFound,
        VaultError::Sealed(_) | VaultError::WrongChannel(_) => Outcome::Denied,
        _ => Outcome::Failed,
    }
}

fn check_max_len(max_len: u16) -> Result<usize, VaultError> {
    if max_len == 0 {
        return Err(VaultError::InvalidLength(0));
    }
    Ok(usize::from(max_len))
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A keyed store of secret and public material.
///
/// Shared as `Arc<Vault>`: every hash, cipher and Diffie-Hellman object
/// derived from a vault holds a clone of that `Arc`, so the vault outlives
/// all of them.
pub struct Vault {
    id: VaultId,
    master: MasterKey,
    state: Mutex<VaultState>,
    sinks: Mutex<Vec<Box<dyn AuditSink>>>,
    provisioned: bool,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("id", &self.id)
            .field("entries", &self.len())
            .field("provisioned", &self.provisioned)
            .finish()
    }
}

impl Vault {
    /// Create an empty standalone vault around `master`.
    pub fn new(master: MasterKey) -> Arc<Self> {
        Arc::new(Self::with_id(VaultId::Standalone, master, DEFAULT_CAPACITY))
    }

    /// Create an empty standalone vault with a fresh random master key.
    pub fn generate() -> Result<Arc<Self>, VaultError> {
        Ok(Self::new(MasterKey::generate()?))
    }

    pub(crate) fn with_id(id: VaultId, master: MasterKey, audit_capacity: usize) -> Self {
        debug!(vault = %id, "vault created");
        Self {
            id,
            master,
            state: Mutex::new(VaultState {
                entries: HashMap::new(),
                next_handle: FIRST_DYNAMIC_HANDLE,
                audit: AuditLog::with_capacity(audit_capacity),
            }),
            sinks: Mutex::new(Vec::new()),
            provisioned: false,
        }
    }

    pub(crate) fn mark_provisioned(&mut self) {
        self.provisioned = true;
    }

    pub(crate) fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    pub(crate) fn master_key(&self) -> &MasterKey {
        &self.master
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        // Entries stay consistent across a panic in another holder: every
        // mutation is a single map insert or remove.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the vault lock, then hand queued audit records to the sinks.
    ///
    /// The sink lock is taken before the vault lock is dropped, so sinks see
    /// records in the order they were appended.
    fn release(&self, mut state: MutexGuard<'_, VaultState>) {
        let pending = state.audit.take_pending();
        if pending.is_empty() {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(state);

        for record in pending {
            for sink in sinks.iter_mut() {
                sink.append(record.clone());
            }
        }
    }

    /// Which vault this is.
    pub fn id(&self) -> VaultId {
        self.id
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Public surface: imports are exportable, sealed entries stay inside.
    // -----------------------------------------------------------------------

    /// Logical size of an exportable entry.
    pub fn size(&self, handle: Handle) -> Result<u16, VaultError> {
        self.size_entry(handle, false)
    }

    /// Store `plaintext` wrapped at rest. Data arriving from outside is
    /// always exportable.
    pub fn import(&self, plaintext: &[u8]) -> Result<Handle, VaultError> {
        self.import_entry(plaintext, true)
    }

    /// Read back up to `max_len` bytes of an exportable entry.
    pub fn export(&self, handle: Handle, max_len: u16) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.export_entry(handle, max_len, false)
    }

    /// Store `data` verbatim and sealed, outside the at-rest wrapping.
    pub fn put(&self, data: &[u8]) -> Result<Handle, VaultError> {
        if data.is_empty() || data.len() > MAX_STORED_LEN {
            return Err(VaultError::InvalidLength(data.len()));
        }

        let mut state = self.lock();
        let result = state.allocate().map(|handle| {
            state.entries.insert(
                handle,
                Entry {
                    stored: data.to_vec(),
                    exportable: false,
                    wrapped: false,
                },
            );
            handle
        });

        match &result {
            Ok(handle) => {
                state.record(self.id, Operation::Put, handle.get(), Outcome::Ok);
                debug!(vault = %self.id, %handle, len = data.len(), "blob stored");
            }
            Err(err) => state.record(self.id, Operation::Put, 0, outcome_of(err)),
        }
        self.release(state);
        result
    }

    /// Read back up to `max_len` bytes of a [`put`](Self::put) entry.
    pub fn get(&self, handle: Handle, max_len: u16) -> Result<Vec<u8>, VaultError> {
        let max_len = check_max_len(max_len)?;

        let mut state = self.lock();
        let result = match state.entries.get(&handle) {
            None => Err(VaultError::NotFound(handle.get())),
            Some(entry) if entry.wrapped => Err(VaultError::WrongChannel(handle.get())),
            Some(entry) => {
                let len = entry.stored.len().min(max_len);
                Ok(entry.stored[..len].to_vec())
            }
        };

        let outcome = result.as_ref().map_or_else(outcome_of, |_| Outcome::Ok);
        state.record(self.id, Operation::Get, handle.get(), outcome);
        self.release(state);
        result
    }

    /// Remove an entry. Returns `false` if it was already absent.
    pub fn delete(&self, handle: Handle) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(&handle).is_some();
        let outcome = if removed { Outcome::Ok } else { Outcome::NotFound };
        state.record(self.id, Operation::Delete, handle.get(), outcome);
        self.release(state);
        removed
    }

    /// Forward every future audit record to `sink`.
    ///
    /// Sinks are called after the vault lock is released, one record at a
    /// time and in order. A slow sink delays the caller whose operation
    /// produced the record, not the other users of the vault.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        let mut state = self.lock();
        state.audit.enable_forwarding();
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).push(sink);
        drop(state);
    }

    /// Snapshot of the audit records held in memory, oldest first.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.lock().audit.iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Derived engines
    // -----------------------------------------------------------------------

    /// An HMAC context keyed by the secret under `secret`.
    ///
    /// A missing or unreadable secret yields a context that is already in
    /// its failed state.
    pub fn hmac(self: &Arc<Self>, algorithm: HashAlgorithm, secret: Handle) -> Hash {
        Hash::hmac(Arc::clone(self), algorithm, secret)
    }

    /// An AES cipher in `mode`, keyed by the entry under `key`.
    pub fn aes(self: &Arc<Self>, mode: CipherMode, key: Handle) -> Result<Cipher, VaultError> {
        Cipher::new(Arc::clone(self), mode, key)
    }

    /// A Diffie-Hellman engine storing its keys in this vault.
    pub fn diffie_hellman(self: &Arc<Self>) -> DiffieHellman {
        DiffieHellman::new(Arc::clone(self))
    }

    // -----------------------------------------------------------------------
    // Crate-internal surface
    // -----------------------------------------------------------------------

    /// Logical size of an entry. Sealed entries answer only when
    /// `allow_sealed` is set.
    pub(crate) fn size_entry(&self, handle: Handle, allow_sealed: bool) -> Result<u16, VaultError> {
        let state = self.lock();
        let entry = state
            .entries
            .get(&handle)
            .ok_or(VaultError::NotFound(handle.get()))?;

        if !entry.exportable && !allow_sealed {
            return Err(VaultError::Sealed(handle.get()));
        }

        u16::try_from(entry.logical_len()).map_err(|_| VaultError::InvalidLength(entry.logical_len()))
    }

    /// Wrap and store `plaintext` under the next free handle.
    pub(crate) fn import_entry(&self, plaintext: &[u8], exportable: bool) -> Result<Handle, VaultError> {
        if plaintext.is_empty() || plaintext.len() > MAX_IMPORT_LEN {
            return Err(VaultError::InvalidLength(plaintext.len()));
        }

        let mut state = self.lock();
        let result = state.allocate().and_then(|handle| {
            let stored = crypto::wrap(self.master.as_bytes(), plaintext)?;
            state.entries.insert(
                handle,
                Entry {
                    stored,
                    exportable,
                    wrapped: true,
                },
            );
            Ok(handle)
        });

        match &result {
            Ok(handle) => {
                state.record(self.id, Operation::Import, handle.get(), Outcome::Ok);
                debug!(vault = %self.id, %handle, len = plaintext.len(), exportable, "entry imported");
            }
            Err(err) => {
                state.record(self.id, Operation::Import, 0, outcome_of(err));
                warn!(vault = %self.id, %err, "import failed");
            }
        }
        self.release(state);
        result
    }

    /// Wrap and store `plaintext` under a fixed, caller-chosen handle.
    pub(crate) fn import_at(
        &self,
        handle: Handle,
        plaintext: &[u8],
        exportable: bool,
    ) -> Result<(), VaultError> {
        if plaintext.is_empty() || plaintext.len() > MAX_IMPORT_LEN {
            return Err(VaultError::InvalidLength(plaintext.len()));
        }

        let mut state = self.lock();
        if state.entries.contains_key(&handle) {
            return Err(VaultError::HandleInUse(handle.get()));
        }

        let stored = crypto::wrap(self.master.as_bytes(), plaintext)?;
        state.entries.insert(
            handle,
            Entry {
                stored,
                exportable,
                wrapped: true,
            },
        );
        state.record(self.id, Operation::Provision, handle.get(), Outcome::Ok);
        self.release(state);
        Ok(())
    }

    /// Unwrap an imported entry, truncated to `max_len` bytes.
    pub(crate) fn export_entry(
        &self,
        handle: Handle,
        max_len: u16,
        allow_sealed: bool,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let max_len = check_max_len(max_len)?;

        let mut state = self.lock();
        let result = match state.entries.get(&handle) {
            None => Err(VaultError::NotFound(handle.get())),
            Some(entry) if !entry.wrapped => Err(VaultError::WrongChannel(handle.get())),
            Some(entry) if !entry.exportable && !allow_sealed => Err(VaultError::Sealed(handle.get())),
            Some(entry) => crypto::unwrap(self.master.as_bytes(), &entry.stored).map(|mut plain| {
                plain.truncate(max_len);
                Zeroizing::new(plain)
            }),
        };

        match &result {
            Ok(_) => state.record(self.id, Operation::Export, handle.get(), Outcome::Ok),
            Err(err) => {
                if matches!(err, VaultError::Sealed(_)) {
                    warn!(vault = %self.id, %handle, "export of sealed entry refused");
                }
                state.record(self.id, Operation::Export, handle.get(), outcome_of(err));
            }
        }
        self.release(state);
        result
    }

    /// Remove a fixed handle during teardown.
    pub(crate) fn remove_fixed(&self, handle: Handle) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(&handle).is_some();
        if removed {
            state.record(self.id, Operation::Teardown, handle.get(), Outcome::Ok);
        }
        self.release(state);
        removed
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if self.provisioned {
            crate::partner::teardown(self);
        }
    }
}
