//! Usage ledger.
//!
//! [`UsageTableHeader`] mirrors the crypto session's usage table: the signed
//! header blob plus, for every entry number, which record (offline license or
//! usage info) owns it. Entry numbers are contiguous; a slot whose owner is
//! gone is kept as [`StorageKind::Unknown`] until it is reclaimed.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::UsageTableConfig;
use crate::crypto::{CryptoSession, CryptoSessionFactory, SecurityLevel};
use crate::error::{Error, ErrorKind, Result};
use crate::storage::DeviceFiles;

mod upgrade;

const SCRATCH_KEY_SET_ID: &str = "DummyKsid";

/// Which record owns a usage entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageKind {
    License,
    UsageInfo,
    #[default]
    Unknown,
}

/// Ledger metadata of one usage entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageEntryInfo {
    pub storage: StorageKind,
    pub key_set_id: String,
    /// Only meaningful for [`StorageKind::UsageInfo`].
    pub usage_info_file_name: String,
    pub last_use_time: i64,
}

impl UsageEntryInfo {
    pub fn license(key_set_id: impl Into<String>, last_use_time: i64) -> Self {
        Self {
            storage: StorageKind::License,
            key_set_id: key_set_id.into(),
            usage_info_file_name: String::new(),
            last_use_time,
        }
    }

    pub fn usage_info(
        key_set_id: impl Into<String>,
        usage_info_file_name: impl Into<String>,
        last_use_time: i64,
    ) -> Self {
        Self {
            storage: StorageKind::UsageInfo,
            key_set_id: key_set_id.into(),
            usage_info_file_name: usage_info_file_name.into(),
            last_use_time,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.storage == StorageKind::Unknown
    }
}

/// Reference to a ledger slot.
///
/// A handle stops resolving once its slot is reclaimed, reassigned or
/// truncated away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: u32,
    revision: u64,
}

impl EntryHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Usage table header and per-entry metadata of one security level.
pub struct UsageTableHeader {
    files: Box<dyn DeviceFiles>,
    factory: Arc<dyn CryptoSessionFactory>,
    clock: Arc<dyn Clock>,
    config: UsageTableConfig,
    security_level: SecurityLevel,
    header: Vec<u8>,
    entries: Vec<UsageEntryInfo>,
    revisions: Vec<u64>,
    next_revision: u64,
}

impl UsageTableHeader {
    pub fn new(
        files: Box<dyn DeviceFiles>,
        factory: Arc<dyn CryptoSessionFactory>,
        clock: Arc<dyn Clock>,
        config: UsageTableConfig,
    ) -> Self {
        Self {
            files,
            factory,
            clock,
            config,
            security_level: SecurityLevel::Unknown,
            header: Vec::new(),
            entries: Vec::new(),
            revisions: Vec::new(),
            next_revision: 0,
        }
    }

    /// Load the stored table into `crypto_session`, or create a new one.
    ///
    /// A table that fails to load or to take a scratch entry is discarded
    /// together with every license and usage info record. When no table
    /// exists, legacy records are imported into the new one.
    pub fn init(
        &mut self,
        security_level: SecurityLevel,
        crypto_session: &dyn CryptoSession,
    ) -> Result<()> {
        if !matches!(security_level, SecurityLevel::L1 | SecurityLevel::L3) {
            return Err(Error::InvalidSecurityLevel(security_level.to_string()));
        }
        self.security_level = security_level;

        let stored = self.files.retrieve_usage_table_info().unwrap_or_else(|e| {
            warn!("usage table info unreadable: {}", &e);
            None
        });

        match stored {
            Some((header, entries)) => {
                info!("loading usage table with {} entries", entries.len());
                self.header = header;
                self.set_entries(entries);
                if let Err(e) = self.load_and_check_capacity(crypto_session) {
                    error!(
                        "usage table at {} rejected, recreating: {}",
                        security_level,
                        &e
                    );
                    self.files.delete_all_licenses()?;
                    self.files.delete_all_usage_info()?;
                    self.files.delete_usage_table_info()?;
                    self.create_table(crypto_session)?;
                }
            }
            None => {
                self.create_table(crypto_session)?;
                self.upgrade_from_legacy();
                self.store_table()?;
            }
        }
        Ok(())
    }

    fn load_and_check_capacity(&mut self, crypto_session: &dyn CryptoSession) -> Result<()> {
        crypto_session.load_usage_table_header(&self.header)?;
        if self.entries.len() <= self.config.min_usage_entries_supported {
            return Ok(());
        }
        let scratch = self.factory.open(self.security_level)?;
        let handle = self.add_entry(&*scratch, true, SCRATCH_KEY_SET_ID, "")?;
        drop(scratch);
        self.delete_entry(handle.index)
    }

    fn create_table(&mut self, crypto_session: &dyn CryptoSession) -> Result<()> {
        self.header = crypto_session.create_usage_table_header()?;
        self.set_entries(Vec::new());
        info!("created usage table at {}", self.security_level);
        self.store_table()
    }

    /// Create a usage entry on `crypto_session` and record its owner.
    ///
    /// When the session runs out of room, the oldest deletable entry is
    /// evicted and creation retried.
    pub fn add_entry(
        &mut self,
        crypto_session: &dyn CryptoSession,
        is_license: bool,
        key_set_id: &str,
        usage_info_file_name: &str,
    ) -> Result<EntryHandle> {
        let mut result = crypto_session.create_usage_entry();
        for _ in 0..self.config.max_crypto_retries {
            if !matches!(&result, Err(e) if e.kind() == ErrorKind::ResourceExhausted) {
                break;
            }
            let Some(victim) = self.eviction_candidate(None) else {
                break;
            };
            warn!("usage table full, evicting entry {}", victim);
            self.delete_entry(victim)?;
            result = crypto_session.create_usage_entry();
        }
        let index = result?;

        let size = self.entries.len();
        if (index as usize) < size {
            error!("new usage entry {} below table size {}", index, size);
            return Err(Error::InvalidNewEntry { index, size });
        }
        if index as usize > size {
            warn!("new usage entry {} beyond table size {}", index, size);
        }
        while self.entries.len() < index as usize {
            self.push_slot(UsageEntryInfo::default());
        }
        let now = self.clock.now();
        let info = if is_license {
            UsageEntryInfo::license(key_set_id, now)
        } else {
            UsageEntryInfo::usage_info(key_set_id, usage_info_file_name, now)
        };
        let handle = self.push_slot(info);
        info!("added usage entry {} for {}", index, key_set_id);
        self.store_table()?;
        Ok(handle)
    }

    /// Load a stored entry blob into `crypto_session`.
    ///
    /// Evicts other entries when the session runs out of room; `index`
    /// itself is never disturbed.
    pub fn load_entry(
        &mut self,
        crypto_session: &dyn CryptoSession,
        entry: &[u8],
        index: u32,
    ) -> Result<()> {
        self.check_index(index)?;
        let mut result = crypto_session.load_usage_entry(index, entry);
        for _ in 0..self.config.max_crypto_retries {
            if !matches!(&result, Err(e) if e.kind() == ErrorKind::ResourceExhausted) {
                break;
            }
            let Some(victim) = self.eviction_candidate(Some(index)) else {
                break;
            };
            warn!("no room to load entry {}, evicting entry {}", index, victim);
            self.delete_entry_protecting(victim, Some(index))?;
            result = crypto_session.load_usage_entry(index, entry);
        }
        result
    }

    /// Re-sign the session's entry and the header, returning the entry blob.
    pub fn update_entry(&mut self, crypto_session: &dyn CryptoSession) -> Result<Vec<u8>> {
        let (header, entry) = crypto_session.update_usage_entry()?;
        self.header = header;
        if let Some(info) = crypto_session
            .usage_entry_number()
            .and_then(|index| self.entries.get_mut(index as usize))
        {
            info.last_use_time = self.clock.now();
        }
        self.store_table()?;
        Ok(entry)
    }

    /// Release entry `index`.
    ///
    /// The last valid entry is moved into the hole and the table shrunk
    /// behind it. If the move fails, the slot is kept as `Unknown`.
    pub fn delete_entry(&mut self, index: u32) -> Result<()> {
        self.delete_entry_protecting(index, None)
    }

    fn delete_entry_protecting(&mut self, index: u32, protected: Option<u32>) -> Result<()> {
        self.check_index(index)?;
        info!("deleting usage entry {}", index);

        let mut swap = self.entries.len() as u32 - 1;
        let mut swap_entry = None;
        while swap > index {
            if Some(swap) == protected {
                self.mark_unknown(index);
                return self.shrink_to(swap + 1);
            }
            if !self.entries[swap as usize].is_unknown() {
                match self.get_entry(swap) {
                    Ok(entry) => {
                        swap_entry = Some(entry);
                        break;
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::MissingData | ErrorKind::Integrity) => {
                        warn!("usage entry {} has no valid record, reclaiming: {}", swap, &e);
                        self.mark_unknown(swap);
                    }
                    Err(e) => return Err(e),
                }
            }
            swap -= 1;
        }

        let Some(entry) = swap_entry else {
            return self.shrink_to(index);
        };
        match self.move_entry(swap, &entry, index) {
            Ok(()) => self.shrink_to(swap),
            Err(e) => {
                warn!("moving usage entry {} to {} failed: {}", swap, index, &e);
                self.mark_unknown(index);
                self.shrink_to(swap + 1)
            }
        }
    }

    fn move_entry(&mut self, from: u32, entry: &[u8], to: u32) -> Result<()> {
        info!("moving usage entry {} -> {}", from, to);
        let session = self.factory.open(self.security_level)?;
        session.load_usage_entry(from, entry)?;
        session.move_usage_entry(to)?;

        let moved = self.entries[from as usize].clone();
        self.replace_slot(to, moved);

        let (header, entry) = session.update_usage_entry()?;
        self.header = header;
        self.store_table()?;
        self.store_entry(to, &entry)
    }

    /// Stored entry blob of slot `index`, checked against its record.
    fn get_entry(&self, index: u32) -> Result<Vec<u8>> {
        let info = &self.entries[index as usize];
        let (entry, number) = match info.storage {
            StorageKind::License => {
                let record = self.files.retrieve_license(&info.key_set_id)?;
                (record.usage_entry, record.usage_entry_number)
            }
            StorageKind::UsageInfo => {
                let record = self
                    .files
                    .retrieve_usage_info_by_key_set_id(
                        &info.usage_info_file_name,
                        &info.key_set_id,
                    )?;
                (record.usage_entry, record.usage_entry_number)
            }
            StorageKind::Unknown => return Err(Error::UnknownStorage(index)),
        };
        if number != index {
            return Err(Error::EntryNumberMismatch {
                expected: index,
                found: number,
            });
        }
        Ok(entry)
    }

    /// Rewrite the record owning slot `index` with a new entry blob.
    fn store_entry(&self, index: u32, entry: &[u8]) -> Result<()> {
        let info = &self.entries[index as usize];
        match info.storage {
            StorageKind::License => {
                let mut record = self.files.retrieve_license(&info.key_set_id)?;
                record.usage_entry = entry.to_vec();
                record.usage_entry_number = index;
                self.files.store_license(&record)
            }
            StorageKind::UsageInfo => {
                let mut record = self
                    .files
                    .retrieve_usage_info_by_key_set_id(
                        &info.usage_info_file_name,
                        &info.key_set_id,
                    )?;
                record.usage_entry = entry.to_vec();
                record.usage_entry_number = index;
                self.files.update_usage_info(&info.usage_info_file_name, &record)
            }
            StorageKind::Unknown => Err(Error::UnknownStorage(index)),
        }
    }

    /// Drop every slot at or above `new_len`.
    fn shrink_to(&mut self, new_len: u32) -> Result<()> {
        let new_len = new_len as usize;
        if new_len >= self.entries.len() {
            return self.store_table();
        }
        info!("shrinking usage table {} -> {}", self.entries.len(), new_len);
        let session = self.factory.open(self.security_level)?;
        self.header = session.shrink_usage_table_header(new_len as u32)?;
        self.entries.truncate(new_len);
        self.revisions.truncate(new_len);
        self.store_table()
    }

    /// Slot to evict: the first `Unknown` slot, else the least recently used
    /// one (lowest index on ties). `protected` is never chosen.
    fn eviction_candidate(&self, protected: Option<u32>) -> Option<u32> {
        let candidates = || {
            self.entries
                .iter()
                .enumerate()
                .map(|(i, info)| (i as u32, info))
                .filter(|(i, _)| Some(*i) != protected)
        };
        if let Some((index, _)) = candidates().find(|(_, info)| info.is_unknown()) {
            return Some(index);
        }
        candidates()
            .min_by_key(|(i, info)| (info.last_use_time, *i))
            .map(|(i, _)| i)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.entries.len() {
            return Err(Error::EntryOutOfRange {
                index,
                size: self.entries.len(),
            });
        }
        Ok(())
    }

    fn store_table(&self) -> Result<()> {
        self.files.store_usage_table_info(&self.header, &self.entries)
    }

    fn bump_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn set_entries(&mut self, entries: Vec<UsageEntryInfo>) {
        let revisions: Vec<u64> = (0..entries.len()).map(|_| self.bump_revision()).collect();
        self.revisions = revisions;
        self.entries = entries;
    }

    fn push_slot(&mut self, info: UsageEntryInfo) -> EntryHandle {
        let revision = self.bump_revision();
        self.entries.push(info);
        self.revisions.push(revision);
        EntryHandle {
            index: self.entries.len() as u32 - 1,
            revision,
        }
    }

    fn replace_slot(&mut self, index: u32, info: UsageEntryInfo) {
        let revision = self.bump_revision();
        self.entries[index as usize] = info;
        self.revisions[index as usize] = revision;
    }

    fn mark_unknown(&mut self, index: u32) {
        let last_use_time = self.entries[index as usize].last_use_time;
        self.replace_slot(
            index,
            UsageEntryInfo {
                last_use_time,
                ..Default::default()
            },
        );
    }

    /// Metadata behind `handle`, if the slot still holds the same entry.
    pub fn entry(&self, handle: EntryHandle) -> Option<&UsageEntryInfo> {
        let index = handle.index as usize;
        (self.revisions.get(index) == Some(&handle.revision)).then(|| &self.entries[index])
    }

    /// Current handle of slot `index`.
    pub fn handle(&self, index: u32) -> Option<EntryHandle> {
        self.revisions.get(index as usize).map(|&revision| EntryHandle { index, revision })
    }

    pub fn entries(&self) -> &[UsageEntryInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }
}
