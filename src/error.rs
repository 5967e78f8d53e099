//! Error types for sealvault.
//!
//! Every variant is a distinct failure mode. Messages name the handle or the
//! step that failed and never carry key material or plaintext.

use thiserror::Error;

/// Coarse classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The handle was never issued or has been deleted.
    NotFound,
    /// A sealed entry was read without internal privilege.
    AccessDenied,
    /// A buffer or stored value violates a length bound.
    SizeViolation,
    /// The primitive engine rejected input or failed.
    PrimitiveFailure,
    /// The handle space is used up.
    Exhaustion,
    /// Configuration or provisioning input could not be loaded.
    Configuration,
}

/// The single error type for all sealvault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No entry exists under this handle.
    #[error("unknown handle {0:#010x}")]
    NotFound(u32),

    /// The entry is sealed and the caller has no internal privilege.
    #[error("handle {0:#010x} is sealed")]
    Sealed(u32),

    /// The entry belongs to the other storage channel (`put`/`get` versus
    /// `import`/`export`).
    #[error("handle {0:#010x} belongs to another storage channel")]
    WrongChannel(u32),

    /// A length is zero or exceeds the 16-bit bound.
    #[error("invalid length {0}")]
    InvalidLength(usize),

    /// The caller's output buffer cannot hold the result.
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The handle counter wrapped around.
    #[error("handle space exhausted")]
    Exhausted,

    /// A fixed handle is already taken.
    #[error("handle {0:#010x} already in use")]
    HandleInUse(u32),

    /// The system random number generator failed.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Key bytes have the wrong length or shape.
    #[error("invalid key")]
    InvalidKey,

    /// No primitive exists for the requested algorithm combination.
    #[error("unsupported algorithm: {0}")]
    Unsupported(String),

    /// The IV does not match the length the cipher mode needs.
    #[error("invalid IV length: expected {expected}, got {actual}")]
    InvalidIv { expected: usize, actual: usize },

    /// The primitive engine failed at the named step.
    #[error("{0} failed")]
    Primitive(&'static str),

    /// Diffie-Hellman parameters failed validation.
    #[error("invalid Diffie-Hellman parameters")]
    InvalidParameters,

    /// A peer public value failed validation against the local parameters.
    #[error("invalid Diffie-Hellman public value")]
    InvalidPublicKey,

    /// A stored key blob could not be decoded.
    #[error("malformed key blob")]
    MalformedKey,

    /// The context latched into its failed state earlier.
    #[error("context has failed")]
    ContextFailed,

    /// The digest has already been produced.
    #[error("context already finalized")]
    Finalized,

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading or writing a persisted file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Sealed(_) | Self::WrongChannel(_) => ErrorKind::AccessDenied,
            Self::InvalidLength(_) | Self::BufferTooSmall { .. } | Self::InvalidIv { .. } => {
                ErrorKind::SizeViolation
            }
            Self::Exhausted | Self::HandleInUse(_) => ErrorKind::Exhaustion,
            Self::Config(_) | Self::Io(_) => ErrorKind::Configuration,
            Self::RandomnessFailure
            | Self::InvalidKey
            | Self::Unsupported(_)
            | Self::Primitive(_)
            | Self::InvalidParameters
            | Self::InvalidPublicKey
            | Self::MalformedKey
            | Self::ContextFailed
            | Self::Finalized => ErrorKind::PrimitiveFailure,
        }
    }
}
