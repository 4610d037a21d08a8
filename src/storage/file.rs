//! File-backed device store.
//!
//! Files live in `<base>/<level>/`. Each is a serialized [`HashedFile`]
//! whose SHA-256 is checked on read; a file that fails the check is removed.

use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::crypto::SecurityLevel;
use crate::error::{Error, Result};
use crate::storage::records::{
    HashedFile, UsageEntryInfoRecord, UsageInfoFile, UsageTableInfoRecord,
};
use crate::storage::{
    is_usage_info_file_name, DeviceFiles, LicenseRecord, UsageInfoRecord, LICENSE_FILE_EXT,
    USAGE_TABLE_FILE_NAME,
};
use crate::usage::UsageEntryInfo;
use crate::utils::ensure_parent_dir;

/// Device files stored under a per-security-level directory.
#[derive(Debug, Clone)]
pub struct FileDeviceFiles {
    dir: PathBuf,
}

impl FileDeviceFiles {
    pub fn new(base_path: &Path, security_level: SecurityLevel) -> Result<Self> {
        if security_level == SecurityLevel::Unknown {
            return Err(Error::InvalidSecurityLevel(security_level.to_string()));
        }
        Ok(Self {
            dir: base_path.join(security_level.dir_name()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn store_hashed(&self, name: &str, file: Vec<u8>) -> Result<()> {
        let hash = Sha256::digest(&file).to_vec();
        let wrapped = HashedFile { file, hash }.encode_to_vec();
        let path = self.path(name);
        ensure_parent_dir(&path)?;
        let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(&self.dir))?;
        tmp.write_all(&wrapped)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::IoError(e.error))?;
        trace!("stored {} ({} bytes)", path.display(), wrapped.len());
        Ok(())
    }

    /// Read and verify a hashed file. `Ok(None)` if it does not exist.
    fn retrieve_hashed(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checked = HashedFile::decode(data.as_slice())
            .map_err(Error::from)
            .and_then(|hashed| {
                if Sha256::digest(&hashed.file).as_slice() == hashed.hash.as_slice() {
                    Ok(hashed.file)
                } else {
                    Err(Error::FileHashMismatch(name.to_string()))
                }
            });
        match checked {
            Ok(file) => Ok(Some(file)),
            Err(e) => {
                warn!("removing corrupt file {}: {}", path.display(), &e);
                self.remove(name)?;
                Err(e)
            }
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl DeviceFiles for FileDeviceFiles {
    fn store_usage_table_info(&self, header: &[u8], entries: &[UsageEntryInfo]) -> Result<()> {
        let record = UsageTableInfoRecord {
            usage_table_header: header.to_vec(),
            entries: entries.iter().map(UsageEntryInfoRecord::from).collect(),
        };
        self.store_hashed(USAGE_TABLE_FILE_NAME, record.encode_to_vec())
    }

    fn retrieve_usage_table_info(&self) -> Result<Option<(Vec<u8>, Vec<UsageEntryInfo>)>> {
        let Some(file) = self.retrieve_hashed(USAGE_TABLE_FILE_NAME)? else {
            return Ok(None);
        };
        let record = UsageTableInfoRecord::decode(file.as_slice())?;
        let entries = record.entries.into_iter().map(UsageEntryInfo::from).collect();
        Ok(Some((record.usage_table_header, entries)))
    }

    fn delete_usage_table_info(&self) -> Result<()> {
        self.remove(USAGE_TABLE_FILE_NAME)
    }

    fn store_license(&self, record: &LicenseRecord) -> Result<()> {
        if record.key_set_id.is_empty() {
            return Err(Error::InvalidParameter("empty key set id".to_string()));
        }
        let name = format!("{}{}", record.key_set_id, LICENSE_FILE_EXT);
        self.store_hashed(&name, record.encode_to_vec())
    }

    fn retrieve_license(&self, key_set_id: &str) -> Result<LicenseRecord> {
        let name = format!("{}{}", key_set_id, LICENSE_FILE_EXT);
        let file = self
            .retrieve_hashed(&name)?
            .ok_or_else(|| Error::LicenseNotFound(key_set_id.to_string()))?;
        Ok(LicenseRecord::decode(file.as_slice())?)
    }

    fn delete_license(&self, key_set_id: &str) -> Result<()> {
        self.remove(&format!("{}{}", key_set_id, LICENSE_FILE_EXT))
    }

    fn list_licenses(&self) -> Result<Vec<String>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter_map(|name| name.strip_suffix(LICENSE_FILE_EXT).map(str::to_string))
            .collect())
    }

    fn delete_all_licenses(&self) -> Result<()> {
        for key_set_id in self.list_licenses()? {
            self.delete_license(&key_set_id)?;
        }
        Ok(())
    }

    fn store_usage_info(&self, file_name: &str, records: &[UsageInfoRecord]) -> Result<()> {
        if !is_usage_info_file_name(file_name) {
            return Err(Error::InvalidParameter(format!(
                "not a usage info file name: {}",
                file_name
            )));
        }
        let file = UsageInfoFile {
            sessions: records.to_vec(),
        };
        self.store_hashed(file_name, file.encode_to_vec())
    }

    fn retrieve_usage_info(&self, file_name: &str) -> Result<Vec<UsageInfoRecord>> {
        match self.retrieve_hashed(file_name)? {
            Some(file) => Ok(UsageInfoFile::decode(file.as_slice())?.sessions),
            None => Ok(Vec::new()),
        }
    }

    fn list_usage_info_files(&self) -> Result<Vec<String>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter(|name| is_usage_info_file_name(name))
            .collect())
    }

    fn delete_all_usage_info(&self) -> Result<()> {
        for name in self.list_usage_info_files()? {
            self.remove(&name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FileDeviceFiles;
    use crate::crypto::SecurityLevel;
    use crate::error::Error;
    use crate::storage::{usage_info_file_name, DeviceFiles, LicenseRecord, UsageInfoRecord};
    use crate::usage::{StorageKind, UsageEntryInfo};

    fn store() -> (tempfile::TempDir, FileDeviceFiles) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileDeviceFiles::new(dir.path(), SecurityLevel::L3).expect("device files");
        (dir, files)
    }

    #[test]
    fn usage_table_info_round_trip() {
        let (_dir, files) = store();
        assert!(files.retrieve_usage_table_info().expect("retrieve").is_none());

        let entries = vec![
            UsageEntryInfo::license("ksid0", 100),
            UsageEntryInfo {
                storage: StorageKind::UsageInfo,
                key_set_id: "ksid1".to_string(),
                usage_info_file_name: usage_info_file_name("app"),
                last_use_time: 200,
            },
            UsageEntryInfo::default(),
        ];
        files
            .store_usage_table_info(b"header", &entries)
            .expect("store");
        let (header, loaded) = files
            .retrieve_usage_table_info()
            .expect("retrieve")
            .expect("present");
        assert_eq!(header, b"header");
        assert_eq!(loaded, entries);
        assert!(files.dir().ends_with("L3"));

        files.delete_usage_table_info().expect("delete");
        assert!(files.retrieve_usage_table_info().expect("retrieve").is_none());
    }

    #[test]
    fn licenses_are_listed_and_deleted() {
        let (_dir, files) = store();
        for ksid in ["ksid_a", "ksid_b"] {
            let mut record = LicenseRecord::new(ksid);
            record.usage_entry_number = 3;
            record.app_parameters.insert("k".to_string(), "v".to_string());
            files.store_license(&record).expect("store");
        }
        assert_eq!(files.list_licenses().expect("list"), vec!["ksid_a", "ksid_b"]);
        let record = files.retrieve_license("ksid_b").expect("retrieve");
        assert_eq!(record.usage_entry_number, 3);
        assert_eq!(record.app_parameters.get("k").map(String::as_str), Some("v"));

        files.delete_license("ksid_a").expect("delete");
        assert!(matches!(
            files.retrieve_license("ksid_a"),
            Err(Error::LicenseNotFound(_))
        ));
        files.delete_all_licenses().expect("delete all");
        assert!(files.list_licenses().expect("list").is_empty());
    }

    #[test]
    fn usage_info_files() {
        let (_dir, files) = store();
        let name = usage_info_file_name("com.example");
        let record = UsageInfoRecord {
            provider_session_token: b"pst".to_vec(),
            key_set_id: "ksid".to_string(),
            ..Default::default()
        };
        files.add_usage_info(&name, &record).expect("add");
        files.store_license(&LicenseRecord::new("other")).expect("store license");
        assert_eq!(files.list_usage_info_files().expect("list"), vec![name.clone()]);
        assert_eq!(files.retrieve_usage_info(&name).expect("read"), vec![record]);
        assert!(files.store_usage_info("table.dat", &[]).is_err());

        files.delete_all_usage_info().expect("delete all");
        assert!(files.list_usage_info_files().expect("list").is_empty());
        assert_eq!(files.list_licenses().expect("list"), vec!["other"]);
    }

    #[test]
    fn corrupt_file_fails_hash_check_and_is_removed() {
        let (_dir, files) = store();
        files.store_license(&LicenseRecord::new("ksid")).expect("store");
        let path = files.dir().join("ksid.lic");
        let mut data = std::fs::read(&path).expect("read");
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).expect("write");

        assert!(matches!(
            files.retrieve_license("ksid"),
            Err(Error::FileHashMismatch(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn rewrites_replace_files_without_leftovers() {
        let (_dir, files) = store();
        let mut record = LicenseRecord::new("ksid");
        files.store_license(&record).expect("store");
        record.usage_entry_number = 9;
        files.store_license(&record).expect("overwrite");
        files
            .store_usage_table_info(b"header", &[UsageEntryInfo::license("ksid", 1)])
            .expect("store table");

        let mut names: Vec<String> = std::fs::read_dir(files.dir())
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["ksid.lic", "usgtable.bin"]);
        assert_eq!(files.retrieve_license("ksid").expect("retrieve").usage_entry_number, 9);
    }
}
