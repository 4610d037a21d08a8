//! Usage entries held by the reference crypto engine.
//!
//! An entry records when its license was received, first used and last
//! used. It is sealed into a blob for storage and can produce a signed usage
//! report for the license server.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

pub const MAC_KEY_SIZE: usize = 32;
pub const MAX_PST_LENGTH: usize = 255;

/// Lifecycle of a usage entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    #[default]
    Unused = 0,
    Active = 1,
    InactiveUsed = 3,
    InactiveUnused = 4,
}

impl EntryStatus {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryStatus::Unused),
            1 => Ok(EntryStatus::Active),
            3 => Ok(EntryStatus::InactiveUsed),
            4 => Ok(EntryStatus::InactiveUnused),
            other => Err(Error::MalformedBlock(format!("entry status {}", other))),
        }
    }

    pub fn is_inactive(self) -> bool {
        matches!(self, EntryStatus::InactiveUsed | EntryStatus::InactiveUnused)
    }
}

/// One usage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEntry {
    pub index: u32,
    pub generation_number: i64,
    pub status: EntryStatus,
    pub time_of_license_received: i64,
    pub time_of_first_decrypt: i64,
    pub time_of_last_decrypt: i64,
    pub mac_key_server: [u8; MAC_KEY_SIZE],
    pub mac_key_client: [u8; MAC_KEY_SIZE],
    pub pst: Vec<u8>,
    // Not persisted.
    recent_decrypt: bool,
    forbid_report: bool,
}

impl UsageEntry {
    pub fn new(index: u32, generation_number: i64) -> Self {
        Self {
            index,
            generation_number,
            status: EntryStatus::Unused,
            time_of_license_received: 0,
            time_of_first_decrypt: 0,
            time_of_last_decrypt: 0,
            mac_key_server: [0u8; MAC_KEY_SIZE],
            mac_key_client: [0u8; MAC_KEY_SIZE],
            pst: Vec::new(),
            recent_decrypt: false,
            forbid_report: true,
        }
    }

    /// Attach the provider session token and stamp the receive time.
    pub fn set_pst(&mut self, pst: &[u8], now: i64) -> Result<()> {
        if pst.is_empty() || pst.len() > MAX_PST_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "provider session token length {}",
                pst.len()
            )));
        }
        self.pst = pst.to_vec();
        self.time_of_license_received = now;
        Ok(())
    }

    pub fn verify_pst(&self, pst: &[u8]) -> Result<()> {
        if pst.is_empty() || pst != self.pst.as_slice() {
            return Err(Error::WrongPst);
        }
        Ok(())
    }

    pub fn set_mac_keys(&mut self, server: &[u8], client: &[u8]) -> Result<()> {
        self.mac_key_server = server.try_into().map_err(|_| {
            Error::InvalidParameter(format!("server mac key length {}", server.len()))
        })?;
        self.mac_key_client = client.try_into().map_err(|_| {
            Error::InvalidParameter(format!("client mac key length {}", client.len()))
        })?;
        Ok(())
    }

    /// Record a decrypt. Returns true if the generation moved.
    pub fn check_for_use(&mut self, now: i64) -> Result<bool> {
        if self.status.is_inactive() {
            return Err(Error::CryptoSession("usage entry is inactive".to_string()));
        }
        self.recent_decrypt = true;
        if self.status == EntryStatus::Unused {
            self.status = EntryStatus::Active;
            self.time_of_first_decrypt = now;
            self.generation_number += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stop further use.
    pub fn deactivate(&mut self) {
        self.status = match self.status {
            EntryStatus::Unused => EntryStatus::InactiveUnused,
            EntryStatus::Active => EntryStatus::InactiveUsed,
            other => other,
        };
        self.forbid_report = true;
        self.generation_number += 1;
    }

    /// Fold the last decrypt in and bump the generation before saving.
    pub fn update_and_increment(&mut self, now: i64) {
        if self.recent_decrypt {
            self.time_of_last_decrypt = now;
            self.recent_decrypt = false;
        }
        self.generation_number += 1;
        self.forbid_report = false;
    }

    /// Produce a signed usage report for `pst`.
    pub fn report(&self, pst: &[u8], now: i64) -> Result<UsageReport> {
        if self.forbid_report || self.recent_decrypt {
            return Err(Error::CryptoSession(
                "usage entry needs an update before reporting".to_string(),
            ));
        }
        self.verify_pst(pst)?;
        let report = UsageReport {
            status: self.status,
            seconds_since_license_received: now - self.time_of_license_received,
            seconds_since_first_decrypt: now - self.time_of_first_decrypt,
            seconds_since_last_decrypt: now - self.time_of_last_decrypt,
            pst: self.pst.clone(),
            signature: Vec::new(),
        };
        report.signed(&self.mac_key_client)
    }

    /// Plain field layout sealed into an entry blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + 8 * 4 + 1 + 2 * MAC_KEY_SIZE + 1 + self.pst.len());
        out.write_u32::<LittleEndian>(self.index)?;
        out.write_i64::<LittleEndian>(self.generation_number)?;
        out.write_i64::<LittleEndian>(self.time_of_license_received)?;
        out.write_i64::<LittleEndian>(self.time_of_first_decrypt)?;
        out.write_i64::<LittleEndian>(self.time_of_last_decrypt)?;
        out.write_u8(self.status as u8)?;
        out.extend_from_slice(&self.mac_key_server);
        out.extend_from_slice(&self.mac_key_client);
        out.write_u8(self.pst.len() as u8)?;
        out.extend_from_slice(&self.pst);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = data;
        let index = reader.read_u32::<LittleEndian>()?;
        let mut entry = Self::new(index, reader.read_i64::<LittleEndian>()?);
        entry.time_of_license_received = reader.read_i64::<LittleEndian>()?;
        entry.time_of_first_decrypt = reader.read_i64::<LittleEndian>()?;
        entry.time_of_last_decrypt = reader.read_i64::<LittleEndian>()?;
        entry.status = EntryStatus::from_u8(reader.read_u8()?)?;
        if reader.len() < 2 * MAC_KEY_SIZE + 1 {
            return Err(Error::MalformedBlock("entry truncated".to_string()));
        }
        let (server, rest) = reader.split_at(MAC_KEY_SIZE);
        let (client, rest) = rest.split_at(MAC_KEY_SIZE);
        entry.set_mac_keys(server, client)?;
        let mut reader = rest;
        let pst_length = reader.read_u8()? as usize;
        if reader.len() != pst_length {
            return Err(Error::MalformedBlock(format!(
                "entry pst length {} but {} bytes remain",
                pst_length,
                reader.len()
            )));
        }
        entry.pst = reader.to_vec();
        Ok(entry)
    }
}

/// Usage report for one provider session token.
///
/// Wire layout: signature (20) | status | clock security level | pst length |
/// padding | three big-endian i64 durations | pst. The signature is
/// HMAC-SHA1 with the client MAC key over everything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub status: EntryStatus,
    pub seconds_since_license_received: i64,
    pub seconds_since_first_decrypt: i64,
    pub seconds_since_last_decrypt: i64,
    pub pst: Vec<u8>,
    pub signature: Vec<u8>,
}

const SIGNATURE_LEN: usize = 20;
const SECURE_TIMER: u8 = 2;

impl UsageReport {
    fn body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(28 + self.pst.len());
        body.write_u8(self.status as u8)?;
        body.write_u8(SECURE_TIMER)?;
        body.write_u8(self.pst.len() as u8)?;
        body.write_u8(0)?;
        body.write_i64::<BigEndian>(self.seconds_since_license_received)?;
        body.write_i64::<BigEndian>(self.seconds_since_first_decrypt)?;
        body.write_i64::<BigEndian>(self.seconds_since_last_decrypt)?;
        body.extend_from_slice(&self.pst);
        Ok(body)
    }

    fn signed(mut self, mac_key_client: &[u8]) -> Result<Self> {
        let mut mac = HmacSha1::new_from_slice(mac_key_client)
            .map_err(|e| Error::Other(format!("Invalid HMAC key: {}", e)))?;
        mac.update(&self.body()?);
        self.signature = mac.finalize().into_bytes().to_vec();
        Ok(self)
    }

    /// Serialized report as sent to the server.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(SIGNATURE_LEN + 28 + self.pst.len());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.body()?);
        Ok(out)
    }

    /// Check the signature against the client MAC key.
    pub fn verify(&self, mac_key_client: &[u8]) -> Result<()> {
        let mut mac = HmacSha1::new_from_slice(mac_key_client)
            .map_err(|e| Error::Other(format!("Invalid HMAC key: {}", e)))?;
        mac.update(&self.body()?);
        mac.verify_slice(&self.signature)
            .map_err(|_| Error::SignatureMismatch("usage report".to_string()))
    }
}
