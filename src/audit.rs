//! Vault access audit trail.
//!
//! Records every handle-level vault operation and its outcome. Records carry
//! handles only, never entry contents. The in-memory log keeps the most recent
//! records up to a fixed capacity. Once forwarding is on, every record is also
//! queued until the owning vault hands it to its sinks.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vault::VaultId;

/// Default number of records kept in memory per vault.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Receives a copy of every audit record a vault appends.
pub trait AuditSink: Send {
    /// Append a record. Called for every audited vault operation.
    fn append(&mut self, record: AuditRecord);
}

/// The vault operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Import,
    Export,
    Put,
    Get,
    Delete,
    Provision,
    Teardown,
}

/// How the operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    NotFound,
    Denied,
    Failed,
}

/// A record of one vault operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The vault the operation ran against.
    pub vault: VaultId,
    pub operation: Operation,
    /// The handle involved, 0 when none was allocated.
    pub handle: u32,
    pub outcome: Outcome,
    /// When the operation completed.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub(crate) fn new(vault: VaultId, operation: Operation, handle: u32, outcome: Outcome) -> Self {
        Self {
            vault,
            operation,
            handle,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded in-memory log of vault operations, plus a queue of records
/// waiting for the forward sinks.
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    forwarding: bool,
    pending: Vec<AuditRecord>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("capacity", &self.capacity)
            .field("forwarding", &self.forwarding)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    /// Create a log that keeps at most `capacity` records in memory.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            forwarding: false,
            pending: Vec::new(),
        }
    }

    /// Queue a copy of every record appended from now on.
    pub fn enable_forwarding(&mut self) {
        self.forwarding = true;
    }

    /// Drain the records queued for forwarding, oldest first.
    pub fn take_pending(&mut self) -> Vec<AuditRecord> {
        std::mem::take(&mut self.pending)
    }

    /// Append a new record, evicting the oldest one past capacity.
    pub fn append(&mut self, record: AuditRecord) {
        if self.forwarding {
            self.pending.push(record.clone());
        }
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Return the number of records held in memory.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// File sink
// ---------------------------------------------------------------------------

/// Appends each record to a file as one line of JSON.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(err) = writeln!(self.file, "{line}").and_then(|()| self.file.flush()) {
                    tracing::warn!(%err, "audit sink write failed");
                }
            }
            Err(err) => tracing::warn!(%err, "audit record encoding failed"),
        }
    }
}
