//! Device file store.
//!
//! [`DeviceFiles`] keeps the usage table info, offline license records and
//! usage info (secure stop) files of one security level. [`FileDeviceFiles`]
//! writes hashed protobuf files to disk; [`MemoryDeviceFiles`] keeps them in
//! memory.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::usage::{StorageKind, UsageEntryInfo};

pub mod file;
pub mod memory;
pub mod records;

pub use file::FileDeviceFiles;
pub use memory::MemoryDeviceFiles;
pub use records::{LicenseRecord, LicenseState, UsageInfoRecord};

use records::{UsageEntryInfoRecord, UsageEntryStorage};

pub(crate) const USAGE_TABLE_FILE_NAME: &str = "usgtable.bin";
pub(crate) const LICENSE_FILE_EXT: &str = ".lic";
const USAGE_INFO_PREFIX: &str = "usage";
const USAGE_INFO_EXT: &str = ".bin";

/// Name of the usage info file holding the records of `app_id`.
pub fn usage_info_file_name(app_id: &str) -> String {
    let hash = if app_id.is_empty() {
        String::new()
    } else {
        hex::encode(Sha256::digest(app_id.as_bytes()))
    };
    format!("{}{}{}", USAGE_INFO_PREFIX, hash, USAGE_INFO_EXT)
}

pub(crate) fn is_usage_info_file_name(name: &str) -> bool {
    name.starts_with(USAGE_INFO_PREFIX) && name.ends_with(USAGE_INFO_EXT)
}

/// Durable storage used by the usage ledger.
///
/// Retrieval of a missing record fails with
/// [`Error::LicenseNotFound`] or [`Error::UsageInfoNotFound`]; a missing
/// usage table is `Ok(None)` and a missing usage info file reads as empty.
pub trait DeviceFiles: Send + Sync {
    fn store_usage_table_info(&self, header: &[u8], entries: &[UsageEntryInfo]) -> Result<()>;

    fn retrieve_usage_table_info(&self) -> Result<Option<(Vec<u8>, Vec<UsageEntryInfo>)>>;

    fn delete_usage_table_info(&self) -> Result<()>;

    fn store_license(&self, record: &LicenseRecord) -> Result<()>;

    fn retrieve_license(&self, key_set_id: &str) -> Result<LicenseRecord>;

    fn delete_license(&self, key_set_id: &str) -> Result<()>;

    /// Key set ids of every stored license.
    fn list_licenses(&self) -> Result<Vec<String>>;

    fn delete_all_licenses(&self) -> Result<()>;

    /// Replace the whole content of a usage info file.
    fn store_usage_info(&self, file_name: &str, records: &[UsageInfoRecord]) -> Result<()>;

    fn retrieve_usage_info(&self, file_name: &str) -> Result<Vec<UsageInfoRecord>>;

    fn list_usage_info_files(&self) -> Result<Vec<String>>;

    fn delete_all_usage_info(&self) -> Result<()>;

    /// Append one record to a usage info file.
    fn add_usage_info(&self, file_name: &str, record: &UsageInfoRecord) -> Result<()> {
        let mut records = self.retrieve_usage_info(file_name)?;
        records.push(record.clone());
        self.store_usage_info(file_name, &records)
    }

    fn retrieve_usage_info_by_key_set_id(
        &self,
        file_name: &str,
        key_set_id: &str,
    ) -> Result<UsageInfoRecord> {
        self.retrieve_usage_info(file_name)?
            .into_iter()
            .find(|record| record.key_set_id == key_set_id)
            .ok_or_else(|| Error::UsageInfoNotFound {
                file_name: file_name.to_string(),
                key_set_id: key_set_id.to_string(),
            })
    }

    /// Replace the record with the same provider session token.
    fn update_usage_info(&self, file_name: &str, record: &UsageInfoRecord) -> Result<()> {
        let mut records = self.retrieve_usage_info(file_name)?;
        let slot = records
            .iter_mut()
            .find(|r| r.provider_session_token == record.provider_session_token)
            .ok_or_else(|| Error::UsageInfoNotFound {
                file_name: file_name.to_string(),
                key_set_id: record.key_set_id.clone(),
            })?;
        *slot = record.clone();
        self.store_usage_info(file_name, &records)
    }

    /// Remove the record for `provider_session_token`.
    ///
    /// Returns whether a record was removed.
    fn delete_usage_info(&self, file_name: &str, provider_session_token: &[u8]) -> Result<bool> {
        let mut records = self.retrieve_usage_info(file_name)?;
        let before = records.len();
        records.retain(|r| r.provider_session_token != provider_session_token);
        if records.len() == before {
            return Ok(false);
        }
        self.store_usage_info(file_name, &records)?;
        Ok(true)
    }
}

impl From<&UsageEntryInfo> for UsageEntryInfoRecord {
    fn from(info: &UsageEntryInfo) -> Self {
        let storage = match info.storage {
            StorageKind::License => UsageEntryStorage::License,
            StorageKind::UsageInfo => UsageEntryStorage::UsageInfo,
            StorageKind::Unknown => UsageEntryStorage::Unknown,
        };
        let usage_info_file_name = match info.storage {
            StorageKind::UsageInfo => info.usage_info_file_name.clone(),
            _ => String::new(),
        };
        Self {
            storage: storage as i32,
            key_set_id: info.key_set_id.clone(),
            usage_info_file_name,
            last_use_time: info.last_use_time,
        }
    }
}

impl From<UsageEntryInfoRecord> for UsageEntryInfo {
    fn from(record: UsageEntryInfoRecord) -> Self {
        let storage = match record.storage() {
            UsageEntryStorage::License => StorageKind::License,
            UsageEntryStorage::UsageInfo => StorageKind::UsageInfo,
            UsageEntryStorage::Unknown => StorageKind::Unknown,
        };
        let usage_info_file_name = match storage {
            StorageKind::UsageInfo => record.usage_info_file_name,
            _ => String::new(),
        };
        Self {
            storage,
            key_set_id: record.key_set_id,
            usage_info_file_name,
            last_use_time: record.last_use_time,
        }
    }
}
