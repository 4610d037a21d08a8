//! Import of records written before the usage table existed.
//!
//! Each license or usage info record that carries a provider session token
//! gets a fresh entry, filled from the crypto session's legacy usage data.
//! Records that fail to import are left untouched and their slot is shrunk
//! away.

use crate::crypto::CryptoSession;
use crate::error::Result;
use crate::usage::{EntryHandle, UsageTableHeader};

impl UsageTableHeader {
    pub(super) fn upgrade_from_legacy(&mut self) {
        self.upgrade_licenses();
        self.upgrade_usage_info();
    }

    fn upgrade_licenses(&mut self) {
        let key_set_ids = match self.files.list_licenses() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("cannot list licenses for upgrade: {}", &e);
                return;
            }
        };

        for key_set_id in key_set_ids {
            let mut record = match self.files.retrieve_license(&key_set_id) {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping license {}: {}", &key_set_id, &e);
                    continue;
                }
            };
            if record.provider_session_token.is_empty() {
                continue;
            }
            let Some((handle, entry)) =
                self.import_entry(true, &key_set_id, "", &record.provider_session_token)
            else {
                continue;
            };
            record.usage_entry = entry;
            record.usage_entry_number = handle.index();
            if let Err(e) = self.files.store_license(&record) {
                error!("storing upgraded license {} failed: {}", &key_set_id, &e);
            }
        }
    }

    fn upgrade_usage_info(&mut self) {
        let file_names = match self.files.list_usage_info_files() {
            Ok(names) => names,
            Err(e) => {
                warn!("cannot list usage info files for upgrade: {}", &e);
                return;
            }
        };

        for file_name in file_names {
            let mut records = match self.files.retrieve_usage_info(&file_name) {
                Ok(records) => records,
                Err(e) => {
                    warn!("skipping usage info file {}: {}", &file_name, &e);
                    continue;
                }
            };
            for record in records.iter_mut() {
                if record.provider_session_token.is_empty() {
                    warn!("usage info record without provider session token in {}", &file_name);
                    continue;
                }
                let key_set_id = record.key_set_id.clone();
                if let Some((handle, entry)) = self.import_entry(
                    false,
                    &key_set_id,
                    &file_name,
                    &record.provider_session_token,
                ) {
                    record.usage_entry = entry;
                    record.usage_entry_number = handle.index();
                }
            }
            if let Err(e) = self.files.store_usage_info(&file_name, &records) {
                error!("storing upgraded usage info {} failed: {}", &file_name, &e);
            }
        }
    }

    /// Create an entry and copy the legacy usage data for `pst` into it.
    fn import_entry(
        &mut self,
        is_license: bool,
        key_set_id: &str,
        usage_info_file_name: &str,
        pst: &[u8],
    ) -> Option<(EntryHandle, Vec<u8>)> {
        let session = match self.factory.open(self.security_level) {
            Ok(session) => session,
            Err(e) => {
                warn!("cannot open session to import {}: {}", key_set_id, &e);
                return None;
            }
        };
        let handle = match self.add_entry(&*session, is_license, key_set_id, usage_info_file_name) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("cannot add entry for {}: {}", key_set_id, &e);
                return None;
            }
        };

        let copied = self.copy_and_update(&*session, pst);
        drop(session);
        match copied {
            Ok(entry) => {
                info!("imported legacy usage for {} as entry {}", key_set_id, handle.index());
                Some((handle, entry))
            }
            Err(e) => {
                warn!("importing legacy usage for {} failed: {}", key_set_id, &e);
                if let Err(e) = self.shrink_to(handle.index()) {
                    error!("dropping entry {} failed: {}", handle.index(), &e);
                }
                None
            }
        }
    }

    fn copy_and_update(&mut self, session: &dyn CryptoSession, pst: &[u8]) -> Result<Vec<u8>> {
        session.copy_old_usage_entry(pst)?;
        self.update_entry(session)
    }
}
