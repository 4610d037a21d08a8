//! Crypto session capability.
//!
//! The policy engine and usage ledger never touch keys or signatures
//! directly. They drive a [`CryptoSession`], which owns the secure usage
//! table: creating, loading, re-signing, moving and shrinking entries, and
//! reporting output protection. [`reference`] is a software implementation
//! of the capability.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::HdcpCapability;

pub mod codec;
pub mod entry;
pub mod reference;

/// Device robustness level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    L1,
    L2,
    L3,
    #[default]
    Unknown,
}

impl SecurityLevel {
    /// Directory name used to keep per-level storage apart.
    pub fn dir_name(self) -> &'static str {
        match self {
            SecurityLevel::L1 => "L1",
            SecurityLevel::L2 => "L2",
            SecurityLevel::L3 => "L3",
            SecurityLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L1" | "1" => Ok(SecurityLevel::L1),
            "L2" | "2" => Ok(SecurityLevel::L2),
            "L3" | "3" => Ok(SecurityLevel::L3),
            _ => Err(crate::error::Error::InvalidSecurityLevel(s.to_string())),
        }
    }
}

/// A secure session able to manage usage entries.
///
/// A session holds at most one usage entry at a time: the one it created,
/// loaded or imported most recently. Methods take `&self` so one session can
/// be shared by the policy engine and the usage ledger of the same CDM
/// session; implementations synchronise internally.
pub trait CryptoSession: Send + Sync {
    /// Robustness level of the secure environment behind this session.
    fn security_level(&self) -> SecurityLevel;

    /// Current and maximum output protection of the device.
    fn hdcp_capabilities(&self) -> Result<(HdcpCapability, HdcpCapability)>;

    /// Start a new, empty usage table and return its signed header.
    fn create_usage_table_header(&self) -> Result<Vec<u8>>;

    /// Verify and install a previously stored header.
    fn load_usage_table_header(&self, header: &[u8]) -> Result<()>;

    /// Create a usage entry and attach it to this session.
    ///
    /// Returns the new entry's index. Fails with
    /// [`Error::InsufficientResources`](crate::error::Error::InsufficientResources)
    /// when the table is full.
    fn create_usage_entry(&self) -> Result<u32>;

    /// Verify a stored entry blob and attach it to this session.
    fn load_usage_entry(&self, index: u32, entry: &[u8]) -> Result<()>;

    /// Re-sign the attached entry and the header.
    ///
    /// Returns `(header, entry)` blobs.
    fn update_usage_entry(&self) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Move the attached entry to `new_index`.
    fn move_usage_entry(&self, new_index: u32) -> Result<()>;

    /// Drop every entry at or above `new_entry_count` and return the header.
    fn shrink_usage_table_header(&self, new_entry_count: u32) -> Result<Vec<u8>>;

    /// Import legacy usage data for `provider_session_token` into the
    /// attached entry.
    fn copy_old_usage_entry(&self, provider_session_token: &[u8]) -> Result<()>;

    /// Index of the attached entry, if any.
    fn usage_entry_number(&self) -> Option<u32>;
}

/// Opens crypto sessions on demand.
///
/// The ledger needs short-lived sessions of its own to move entries and
/// check capacity.
pub trait CryptoSessionFactory: Send + Sync {
    fn open(&self, security_level: SecurityLevel) -> Result<Box<dyn CryptoSession>>;
}
