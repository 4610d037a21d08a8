//! In-memory device file store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::storage::{DeviceFiles, LicenseRecord, UsageInfoRecord};
use crate::usage::UsageEntryInfo;

#[derive(Debug, Default)]
struct Files {
    usage_table: Option<(Vec<u8>, Vec<UsageEntryInfo>)>,
    licenses: BTreeMap<String, LicenseRecord>,
    usage_info: BTreeMap<String, Vec<UsageInfoRecord>>,
}

/// Device files kept in process memory. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeviceFiles {
    files: Arc<Mutex<Files>>,
}

impl MemoryDeviceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Files>> {
        self.files
            .lock()
            .map_err(|_| Error::Other("device files poisoned".to_string()))
    }
}

impl DeviceFiles for MemoryDeviceFiles {
    fn store_usage_table_info(&self, header: &[u8], entries: &[UsageEntryInfo]) -> Result<()> {
        self.lock()?.usage_table = Some((header.to_vec(), entries.to_vec()));
        Ok(())
    }

    fn retrieve_usage_table_info(&self) -> Result<Option<(Vec<u8>, Vec<UsageEntryInfo>)>> {
        Ok(self.lock()?.usage_table.clone())
    }

    fn delete_usage_table_info(&self) -> Result<()> {
        self.lock()?.usage_table = None;
        Ok(())
    }

    fn store_license(&self, record: &LicenseRecord) -> Result<()> {
        if record.key_set_id.is_empty() {
            return Err(Error::InvalidParameter("empty key set id".to_string()));
        }
        self.lock()?
            .licenses
            .insert(record.key_set_id.clone(), record.clone());
        Ok(())
    }

    fn retrieve_license(&self, key_set_id: &str) -> Result<LicenseRecord> {
        self.lock()?
            .licenses
            .get(key_set_id)
            .cloned()
            .ok_or_else(|| Error::LicenseNotFound(key_set_id.to_string()))
    }

    fn delete_license(&self, key_set_id: &str) -> Result<()> {
        self.lock()?.licenses.remove(key_set_id);
        Ok(())
    }

    fn list_licenses(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.licenses.keys().cloned().collect())
    }

    fn delete_all_licenses(&self) -> Result<()> {
        self.lock()?.licenses.clear();
        Ok(())
    }

    fn store_usage_info(&self, file_name: &str, records: &[UsageInfoRecord]) -> Result<()> {
        self.lock()?
            .usage_info
            .insert(file_name.to_string(), records.to_vec());
        Ok(())
    }

    fn retrieve_usage_info(&self, file_name: &str) -> Result<Vec<UsageInfoRecord>> {
        Ok(self
            .lock()?
            .usage_info
            .get(file_name)
            .cloned()
            .unwrap_or_default())
    }

    fn list_usage_info_files(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.usage_info.keys().cloned().collect())
    }

    fn delete_all_usage_info(&self) -> Result<()> {
        self.lock()?.usage_info.clear();
        Ok(())
    }
}
