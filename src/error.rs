//! Error types for rswidevine-policy.

use thiserror::Error;

use crate::key::KeyId;

/// Main error type for policy and usage-ledger operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument is out of range or malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested security level is not supported for this operation.
    #[error("Invalid security level: {0}")]
    InvalidSecurityLevel(String),

    /// The configuration file could not be interpreted.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The key is not part of the loaded license.
    #[error("Key {0} not found")]
    KeyNotFound(KeyId),

    /// The crypto session has no room for another usage entry.
    #[error("Insufficient resources for usage entry")]
    InsufficientResources,

    /// The usage entry is already loaded by another session.
    #[error("Usage entry {0} is in use")]
    EntryInUse(u32),

    /// The crypto session handed out an index below the current table size.
    #[error("New usage entry {index} is below table size {size}")]
    InvalidNewEntry { index: u32, size: usize },

    /// An index outside the usage table was supplied.
    #[error("Usage entry {index} out of range (table size {size})")]
    EntryOutOfRange { index: u32, size: usize },

    /// The Signature did not match.
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The stored master generation and the loaded one are too far apart.
    #[error("Generation skew: expected {expected}, found {found}")]
    GenerationSkew { expected: i64, found: i64 },

    /// A signed block carried the wrong magic.
    #[error("Bad magic in {0} block")]
    BadMagic(&'static str),

    /// A signed block could not be decrypted or parsed.
    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    /// A stored record names a different usage entry than expected.
    #[error("Usage entry number mismatch: expected {expected}, found {found}")]
    EntryNumberMismatch { expected: u32, found: u32 },

    /// A persisted file failed its hash check.
    #[error("Hash mismatch in file {0}")]
    FileHashMismatch(String),

    /// Generic crypto session failure.
    #[error("Crypto session error: {0}")]
    CryptoSession(String),

    /// The usage table header has not been created or loaded.
    #[error("Usage table header not loaded")]
    HeaderNotLoaded,

    /// The crypto session has no usage entry attached.
    #[error("No usage entry attached to the crypto session")]
    NoUsageEntry,

    /// The provider session token does not match the usage entry.
    #[error("Provider session token mismatch")]
    WrongPst,

    /// No license record is stored under the key set id.
    #[error("License {0} not found")]
    LicenseNotFound(String),

    /// No usage info record matches the key set id in the named file.
    #[error("Usage info {key_set_id} not found in {file_name}")]
    UsageInfoNotFound {
        file_name: String,
        key_set_id: String,
    },

    /// The usage entry slot has no backing storage kind.
    #[error("Usage entry {0} has unknown storage")]
    UnknownStorage(u32),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// YAML error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Broad class of an [`Error`], used by callers to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or configuration. Not retried.
    Configuration,
    /// Out of usage-table capacity. Recovered by eviction.
    ResourceExhausted,
    /// Signature, generation or hash verification failed.
    Integrity,
    /// Crypto session failure that may succeed on a later attempt, such as
    /// an entry still held by another session.
    Transient,
    /// A backing record is missing.
    MissingData,
    /// Persistent storage failed.
    Storage,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_)
            | Error::InvalidSecurityLevel(_)
            | Error::InvalidConfig(_)
            | Error::KeyNotFound(_)
            | Error::EntryOutOfRange { .. } => ErrorKind::Configuration,
            Error::InsufficientResources => ErrorKind::ResourceExhausted,
            Error::SignatureMismatch(_)
            | Error::GenerationSkew { .. }
            | Error::BadMagic(_)
            | Error::MalformedBlock(_)
            | Error::EntryNumberMismatch { .. }
            | Error::FileHashMismatch(_)
            | Error::InvalidNewEntry { .. } => ErrorKind::Integrity,
            Error::CryptoSession(_)
            | Error::EntryInUse(_)
            | Error::HeaderNotLoaded
            | Error::NoUsageEntry
            | Error::WrongPst
            | Error::Other(_) => ErrorKind::Transient,
            Error::LicenseNotFound(_)
            | Error::UsageInfoNotFound { .. }
            | Error::UnknownStorage(_) => ErrorKind::MissingData,
            Error::ProtobufDecodeError(_) | Error::YamlError(_) | Error::IoError(_) => {
                ErrorKind::Storage
            }
        }
    }
}

/// Result type alias for rswidevine-policy operations.
pub type Result<T> = std::result::Result<T, Error>;
