//! Software reference crypto engine.
//!
//! [`ReferenceEngine`] keeps an in-memory usage table (generation numbers
//! and which entries are attached to a session) and seals headers and
//! entries with a 16-byte device key. The master generation number is kept
//! in "secure" storage, either process memory or a file, so a header that
//! was rolled back on disk is detected on load.
//!
//! The engine also carries knobs for exercising recovery paths: a table size
//! limit, injected creation and move failures, and configurable HDCP levels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rand_core::{OsRng, RngCore};

use crate::clock::Clock;
use crate::config::ReferenceCryptoConfig;
use crate::crypto::codec::{self, HeaderPayload, ENTRY_MAGIC, HEADER_MAGIC};
use crate::crypto::entry::{UsageEntry, UsageReport};
use crate::crypto::{CryptoSession, CryptoSessionFactory, SecurityLevel};
use crate::error::{Error, Result};
use crate::key::HdcpCapability;
use crate::utils::ensure_parent_dir;

/// Where the master generation number survives restarts.
#[derive(Debug, Clone)]
enum GenerationStore {
    Memory(Arc<Mutex<Option<i64>>>),
    File(PathBuf),
}

impl GenerationStore {
    fn load(&self) -> Result<Option<i64>> {
        match self {
            GenerationStore::Memory(cell) => Ok(*lock(cell)?),
            GenerationStore::File(path) => match std::fs::read(path) {
                Ok(bytes) => {
                    let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        Error::MalformedBlock(format!("generation file {}", path.display()))
                    })?;
                    Ok(Some(i64::from_le_bytes(bytes)))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn save(&self, generation: i64) -> Result<()> {
        match self {
            GenerationStore::Memory(cell) => {
                *lock(cell)? = Some(generation);
                Ok(())
            }
            GenerationStore::File(path) => {
                ensure_parent_dir(path)?;
                std::fs::write(path, generation.to_le_bytes())?;
                Ok(())
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::CryptoSession("reference engine state poisoned".to_string()))
}

#[derive(Debug)]
struct EngineState {
    device_key: [u8; 16],
    security_level: SecurityLevel,
    hdcp: (HdcpCapability, HdcpCapability),
    max_usage_entries: Option<usize>,
    generation_store: GenerationStore,
    legacy: HashMap<Vec<u8>, UsageEntry>,

    header_loaded: bool,
    master_generation: i64,
    generations: Vec<i64>,
    in_use: Vec<bool>,

    failing_creates: u32,
    failing_loads: u32,
    fail_moves: bool,
}

impl EngineState {
    fn ensure_header(&self) -> Result<()> {
        if self.header_loaded {
            Ok(())
        } else {
            Err(Error::HeaderNotLoaded)
        }
    }

    fn increment_generation(&mut self) -> Result<()> {
        self.master_generation += 1;
        self.generation_store.save(self.master_generation)
    }

    fn save_header(&mut self) -> Result<Vec<u8>> {
        self.generation_store.save(self.master_generation)?;
        let payload = HeaderPayload {
            master_generation: self.master_generation,
            generations: self.generations.clone(),
        };
        codec::seal(&self.device_key, HEADER_MAGIC, &payload.encode()?)
    }

    fn release(&mut self, index: u32) {
        if let Some(slot) = self.in_use.get_mut(index as usize) {
            *slot = false;
        }
    }

    fn check_skew(expected: i64, found: i64) -> Result<()> {
        if (found - expected).abs() > 1 {
            return Err(Error::GenerationSkew { expected, found });
        }
        if found != expected {
            warn!("generation skew {} -> {} tolerated", found, expected);
        }
        Ok(())
    }
}

/// Software stand-in for a secure usage table.
///
/// Clones share the same table.
#[derive(Clone)]
pub struct ReferenceEngine {
    state: Arc<Mutex<EngineState>>,
    clock: Arc<dyn Clock>,
}

impl ReferenceEngine {
    /// Create an engine whose generation number lives in memory.
    pub fn new(device_key: [u8; 16], security_level: SecurityLevel, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(
            device_key,
            security_level,
            clock,
            GenerationStore::Memory(Arc::new(Mutex::new(None))),
        )
    }

    /// Create an engine whose generation number is kept in `path`.
    pub fn with_generation_file(
        device_key: [u8; 16],
        security_level: SecurityLevel,
        clock: Arc<dyn Clock>,
        path: PathBuf,
    ) -> Self {
        Self::with_store(device_key, security_level, clock, GenerationStore::File(path))
    }

    /// Create an engine from configuration.
    pub fn from_config(
        config: &ReferenceCryptoConfig,
        clock: Arc<dyn Clock>,
        generation_file: Option<PathBuf>,
    ) -> Result<Self> {
        let device_key = config.device_key()?;
        let store = match generation_file {
            Some(path) => GenerationStore::File(path),
            None => GenerationStore::Memory(Arc::new(Mutex::new(None))),
        };
        let engine = Self::with_store(device_key, config.security_level, clock, store);
        engine.set_max_usage_entries(config.max_usage_entries)?;
        engine.set_hdcp(config.current_hdcp, config.max_hdcp)?;
        Ok(engine)
    }

    fn with_store(
        device_key: [u8; 16],
        security_level: SecurityLevel,
        clock: Arc<dyn Clock>,
        generation_store: GenerationStore,
    ) -> Self {
        let state = EngineState {
            device_key,
            security_level,
            hdcp: (HdcpCapability::None, HdcpCapability::None),
            max_usage_entries: None,
            generation_store,
            legacy: HashMap::new(),
            header_loaded: false,
            master_generation: 0,
            generations: Vec::new(),
            in_use: Vec::new(),
            failing_creates: 0,
            failing_loads: 0,
            fail_moves: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    /// A new engine over the same device key and secure generation store,
    /// with no header loaded.
    pub fn restart(&self) -> Result<Self> {
        let state = lock(&self.state)?;
        let restarted = Self::with_store(
            state.device_key,
            state.security_level,
            self.clock.clone(),
            state.generation_store.clone(),
        );
        {
            let mut next = lock(&restarted.state)?;
            next.hdcp = state.hdcp;
            next.max_usage_entries = state.max_usage_entries;
            next.legacy = state.legacy.clone();
        }
        Ok(restarted)
    }

    pub fn open_session(&self) -> ReferenceCryptoSession {
        ReferenceCryptoSession {
            state: self.state.clone(),
            clock: self.clock.clone(),
            entry: Mutex::new(None),
        }
    }

    /// Limit the number of usage entries; `None` removes the limit.
    pub fn set_max_usage_entries(&self, max: Option<usize>) -> Result<()> {
        lock(&self.state)?.max_usage_entries = max;
        Ok(())
    }

    pub fn set_hdcp(&self, current: HdcpCapability, max: HdcpCapability) -> Result<()> {
        lock(&self.state)?.hdcp = (current, max);
        Ok(())
    }

    /// Make the next `count` entry creations report insufficient resources.
    pub fn fail_next_creates(&self, count: u32) -> Result<()> {
        lock(&self.state)?.failing_creates = count;
        Ok(())
    }

    /// Make the next `count` entry loads report insufficient resources.
    pub fn fail_next_loads(&self, count: u32) -> Result<()> {
        lock(&self.state)?.failing_loads = count;
        Ok(())
    }

    /// Make every entry move fail.
    pub fn fail_moves(&self, fail: bool) -> Result<()> {
        lock(&self.state)?.fail_moves = fail;
        Ok(())
    }

    /// Register a usage record from a pre-table installation.
    pub fn add_legacy_entry(&self, entry: UsageEntry) -> Result<()> {
        lock(&self.state)?.legacy.insert(entry.pst.clone(), entry);
        Ok(())
    }

    pub fn entry_count(&self) -> Result<usize> {
        Ok(lock(&self.state)?.generations.len())
    }

    pub fn master_generation(&self) -> Result<i64> {
        Ok(lock(&self.state)?.master_generation)
    }
}

impl CryptoSessionFactory for ReferenceEngine {
    fn open(&self, security_level: SecurityLevel) -> Result<Box<dyn CryptoSession>> {
        let level = lock(&self.state)?.security_level;
        if level != security_level {
            return Err(Error::InvalidSecurityLevel(format!(
                "engine runs at {}, {} requested",
                level,
                security_level
            )));
        }
        Ok(Box::new(self.open_session()))
    }
}

/// Session on a [`ReferenceEngine`].
///
/// Dropping the session releases its usage entry.
pub struct ReferenceCryptoSession {
    state: Arc<Mutex<EngineState>>,
    clock: Arc<dyn Clock>,
    entry: Mutex<Option<UsageEntry>>,
}

impl ReferenceCryptoSession {
    // Replace the attached entry, releasing the old one's slot.
    fn attach(state: &mut EngineState, slot: &mut Option<UsageEntry>, entry: UsageEntry) {
        if let Some(previous) = slot.take() {
            state.release(previous.index);
        }
        *slot = Some(entry);
    }

    fn with_entry<T>(
        &self,
        f: impl FnOnce(&mut EngineState, &mut UsageEntry) -> Result<T>,
    ) -> Result<T> {
        let mut slot = lock(&self.entry)?;
        let entry = slot.as_mut().ok_or(Error::NoUsageEntry)?;
        let mut state = lock(&self.state)?;
        f(&mut state, entry)
    }

    /// Attach the license's provider session token to the entry.
    pub fn set_provider_session_token(&self, pst: &[u8]) -> Result<()> {
        let now = self.clock.now();
        self.with_entry(|_, entry| entry.set_pst(pst, now))
    }

    pub fn set_mac_keys(&self, server: &[u8], client: &[u8]) -> Result<()> {
        self.with_entry(|_, entry| entry.set_mac_keys(server, client))
    }

    /// Note a decrypt with the entry's license.
    pub fn record_decrypt(&self) -> Result<()> {
        let now = self.clock.now();
        self.with_entry(|state, entry| {
            if entry.check_for_use(now)? {
                state.increment_generation()?;
            }
            Ok(())
        })
    }

    /// Stop further use of the entry's license.
    pub fn deactivate(&self, pst: &[u8]) -> Result<()> {
        self.with_entry(|state, entry| {
            entry.verify_pst(pst)?;
            entry.deactivate();
            state.increment_generation()
        })
    }

    /// Signed usage report for `pst`.
    pub fn report_usage(&self, pst: &[u8]) -> Result<UsageReport> {
        let now = self.clock.now();
        self.with_entry(|_, entry| entry.report(pst, now))
    }

    /// Copy of the attached entry.
    pub fn usage_entry(&self) -> Option<UsageEntry> {
        lock(&self.entry).ok().and_then(|slot| slot.clone())
    }
}

impl Drop for ReferenceCryptoSession {
    fn drop(&mut self) {
        let index = match self.entry.get_mut() {
            Ok(slot) => slot.as_ref().map(|e| e.index),
            Err(_) => None,
        };
        if let (Some(index), Ok(mut state)) = (index, self.state.lock()) {
            state.release(index);
        }
    }
}

impl CryptoSession for ReferenceCryptoSession {
    fn security_level(&self) -> SecurityLevel {
        lock(&self.state)
            .map(|state| state.security_level)
            .unwrap_or_default()
    }

    fn hdcp_capabilities(&self) -> Result<(HdcpCapability, HdcpCapability)> {
        Ok(lock(&self.state)?.hdcp)
    }

    fn create_usage_table_header(&self) -> Result<Vec<u8>> {
        let mut state = lock(&self.state)?;
        if let Some(index) = state.in_use.iter().position(|used| *used) {
            return Err(Error::EntryInUse(index as u32));
        }
        state.master_generation = match state.generation_store.load()? {
            Some(generation) => generation,
            None => (OsRng.next_u64() >> 16) as i64,
        };
        state.generations.clear();
        state.in_use.clear();
        state.header_loaded = true;
        debug!("created usage table header at generation {}", state.master_generation);
        state.save_header()
    }

    fn load_usage_table_header(&self, header: &[u8]) -> Result<()> {
        let mut state = lock(&self.state)?;
        let stored = state.generation_store.load()?.ok_or_else(|| {
            Error::CryptoSession("no stored generation number".to_string())
        })?;
        let payload = HeaderPayload::decode(&codec::open(
            &state.device_key,
            HEADER_MAGIC,
            "header",
            header,
        )?)?;
        if let Some(max) = state.max_usage_entries {
            if payload.generations.len() > max {
                return Err(Error::InsufficientResources);
            }
        }
        EngineState::check_skew(stored, payload.master_generation)?;

        state.master_generation = stored;
        state.in_use = vec![false; payload.generations.len()];
        state.generations = payload.generations;
        state.header_loaded = true;
        Ok(())
    }

    fn create_usage_entry(&self) -> Result<u32> {
        let mut slot = lock(&self.entry)?;
        let mut state = lock(&self.state)?;
        state.ensure_header()?;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(Error::InsufficientResources);
        }
        let index = state.generations.len();
        if state.max_usage_entries.is_some_and(|max| index >= max) {
            return Err(Error::InsufficientResources);
        }
        let generation = state.master_generation;
        state.generations.push(generation);
        state.in_use.push(true);
        state.increment_generation()?;
        let index = index as u32;
        Self::attach(&mut state, &mut slot, UsageEntry::new(index, generation));
        Ok(index)
    }

    fn load_usage_entry(&self, index: u32, entry: &[u8]) -> Result<()> {
        let mut slot = lock(&self.entry)?;
        let mut state = lock(&self.state)?;
        state.ensure_header()?;
        let position = index as usize;
        if position >= state.generations.len() {
            return Err(Error::EntryOutOfRange {
                index,
                size: state.generations.len(),
            });
        }
        if state.in_use[position] {
            return Err(Error::EntryInUse(index));
        }
        if state.failing_loads > 0 {
            state.failing_loads -= 1;
            return Err(Error::InsufficientResources);
        }
        let loaded = UsageEntry::decode(&codec::open(
            &state.device_key,
            ENTRY_MAGIC,
            "entry",
            entry,
        )?)?;
        if loaded.index != index {
            return Err(Error::EntryNumberMismatch {
                expected: index,
                found: loaded.index,
            });
        }
        EngineState::check_skew(state.generations[position], loaded.generation_number)?;
        state.in_use[position] = true;
        Self::attach(&mut state, &mut slot, loaded);
        Ok(())
    }

    fn update_usage_entry(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let now = self.clock.now();
        self.with_entry(|state, entry| {
            state.ensure_header()?;
            entry.update_and_increment(now);
            state.increment_generation()?;
            let slot = state
                .generations
                .get_mut(entry.index as usize)
                .ok_or(Error::NoUsageEntry)?;
            *slot = entry.generation_number;
            let entry_blob = codec::seal(&state.device_key, ENTRY_MAGIC, &entry.encode()?)?;
            let header_blob = state.save_header()?;
            Ok((header_blob, entry_blob))
        })
    }

    fn move_usage_entry(&self, new_index: u32) -> Result<()> {
        self.with_entry(|state, entry| {
            state.ensure_header()?;
            let target = new_index as usize;
            if target >= state.generations.len() {
                return Err(Error::EntryOutOfRange {
                    index: new_index,
                    size: state.generations.len(),
                });
            }
            if state.in_use[target] {
                return Err(Error::EntryInUse(new_index));
            }
            if state.fail_moves {
                return Err(Error::CryptoSession("move rejected".to_string()));
            }
            state.release(entry.index);
            state.in_use[target] = true;
            entry.index = new_index;
            entry.generation_number = state.master_generation;
            state.generations[target] = state.master_generation;
            state.increment_generation()
        })
    }

    fn shrink_usage_table_header(&self, new_entry_count: u32) -> Result<Vec<u8>> {
        let mut state = lock(&self.state)?;
        state.ensure_header()?;
        let count = new_entry_count as usize;
        if count > state.generations.len() {
            return Err(Error::InvalidParameter(format!(
                "cannot shrink {} entries to {}",
                state.generations.len(),
                count
            )));
        }
        if let Some(index) = state.in_use[count..].iter().position(|used| *used) {
            return Err(Error::EntryInUse((count + index) as u32));
        }
        state.generations.truncate(count);
        state.in_use.truncate(count);
        state.master_generation += 1;
        state.save_header()
    }

    fn copy_old_usage_entry(&self, provider_session_token: &[u8]) -> Result<()> {
        self.with_entry(|state, entry| {
            let legacy = state
                .legacy
                .get(provider_session_token)
                .ok_or(Error::WrongPst)?;
            entry.pst = legacy.pst.clone();
            entry.status = legacy.status;
            entry.time_of_license_received = legacy.time_of_license_received;
            entry.time_of_first_decrypt = legacy.time_of_first_decrypt;
            entry.time_of_last_decrypt = legacy.time_of_last_decrypt;
            entry.mac_key_server = legacy.mac_key_server;
            entry.mac_key_client = legacy.mac_key_client;
            Ok(())
        })
    }

    fn usage_entry_number(&self) -> Option<u32> {
        lock(&self.entry)
            .ok()
            .and_then(|slot| slot.as_ref().map(|e| e.index))
    }
}
