//! YAML configuration.
//!
//! Every field has a default, so an empty document is a valid config.
//!
//! ```yaml
//! policy:
//!   clock_skew_delta_seconds: 5
//!   hdcp_device_check_interval_seconds: 10
//! usage_table:
//!   max_crypto_retries: 3
//!   min_usage_entries_supported: 200
//! storage:
//!   base_path: /var/lib/wvpolicy
//! reference_crypto:
//!   device_key: 000102030405060708090a0b0c0d0e0f
//!   max_usage_entries: 50
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::SecurityLevel;
use crate::error::{Error, Result};
use crate::key::HdcpCapability;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub policy: PolicyConfig,
    pub usage_table: UsageTableConfig,
    pub storage: StorageConfig,
    pub reference_crypto: ReferenceCryptoConfig,
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.policy.clock_skew_delta_seconds < 0 {
            return Err(Error::InvalidConfig(
                "policy.clock_skew_delta_seconds must not be negative".to_string(),
            ));
        }
        if self.policy.hdcp_device_check_interval_seconds <= 0 {
            return Err(Error::InvalidConfig(
                "policy.hdcp_device_check_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Policy engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Clock readings further than this behind the last one are ignored.
    pub clock_skew_delta_seconds: i64,
    /// How often the timer re-reads device HDCP capability.
    pub hdcp_device_check_interval_seconds: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            clock_skew_delta_seconds: 5,
            hdcp_device_check_interval_seconds: 10,
        }
    }
}

/// Usage ledger tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageTableConfig {
    /// Evict-and-retry rounds after the first insufficient-resources failure.
    pub max_crypto_retries: u32,
    /// Tables larger than this get a capacity check on init.
    pub min_usage_entries_supported: usize,
}

impl Default for UsageTableConfig {
    fn default() -> Self {
        Self {
            max_crypto_retries: 3,
            min_usage_entries_supported: 200,
        }
    }
}

/// File store location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("wvpolicy"),
        }
    }
}

/// Settings of the software reference crypto engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceCryptoConfig {
    /// 16-byte key, hex encoded, used to sign and encrypt usage blobs.
    pub device_key: String,
    pub security_level: SecurityLevel,
    /// `None` for no limit.
    pub max_usage_entries: Option<usize>,
    pub current_hdcp: HdcpCapability,
    pub max_hdcp: HdcpCapability,
}

impl Default for ReferenceCryptoConfig {
    fn default() -> Self {
        Self {
            device_key: String::new(),
            security_level: SecurityLevel::L3,
            max_usage_entries: None,
            current_hdcp: HdcpCapability::None,
            max_hdcp: HdcpCapability::None,
        }
    }
}

impl ReferenceCryptoConfig {
    /// Decode the configured device key.
    pub fn device_key(&self) -> Result<[u8; 16]> {
        let bytes = hex::decode(self.device_key.trim()).map_err(|e| {
            Error::InvalidConfig(format!("reference_crypto.device_key is not hex: {}", e))
        })?;
        bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "reference_crypto.device_key must be 16 bytes, got {}",
                bytes.len()
            ))
        })
    }
}
