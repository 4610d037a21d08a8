//! Protobuf records persisted by the device file store.

use std::collections::HashMap;

/// Envelope of every stored file: the serialized record and its SHA-256.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashedFile {
    #[prost(bytes = "vec", tag = "1")]
    pub file: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UsageEntryStorage {
    Unknown = 0,
    License = 1,
    UsageInfo = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsageEntryInfoRecord {
    #[prost(enumeration = "UsageEntryStorage", tag = "1")]
    pub storage: i32,
    #[prost(string, tag = "2")]
    pub key_set_id: String,
    #[prost(string, tag = "3")]
    pub usage_info_file_name: String,
    #[prost(int64, tag = "4")]
    pub last_use_time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsageTableInfoRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub usage_table_header: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<UsageEntryInfoRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LicenseState {
    Active = 0,
    Releasing = 1,
}

/// An offline license and the state needed to restore its session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseRecord {
    #[prost(string, tag = "1")]
    pub key_set_id: String,
    #[prost(enumeration = "LicenseState", tag = "2")]
    pub state: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub pssh_data: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub license_request: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub license: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub renewal_request: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub renewal: Vec<u8>,
    #[prost(string, tag = "8")]
    pub release_server_url: String,
    #[prost(int64, tag = "9")]
    pub playback_start_time: i64,
    #[prost(int64, tag = "10")]
    pub last_playback_time: i64,
    #[prost(int64, tag = "11")]
    pub grace_period_end_time: i64,
    #[prost(map = "string, string", tag = "12")]
    pub app_parameters: HashMap<String, String>,
    #[prost(bytes = "vec", tag = "13")]
    pub usage_entry: Vec<u8>,
    #[prost(uint32, tag = "14")]
    pub usage_entry_number: u32,
    #[prost(bytes = "vec", tag = "15")]
    pub provider_session_token: Vec<u8>,
}

impl LicenseRecord {
    pub fn new(key_set_id: impl Into<String>) -> Self {
        Self {
            key_set_id: key_set_id.into(),
            ..Default::default()
        }
    }
}

/// Secure-stop record of one streaming license.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsageInfoRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub provider_session_token: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub license_request: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub license: Vec<u8>,
    #[prost(string, tag = "4")]
    pub key_set_id: String,
    #[prost(bytes = "vec", tag = "5")]
    pub usage_entry: Vec<u8>,
    #[prost(uint32, tag = "6")]
    pub usage_entry_number: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsageInfoFile {
    #[prost(message, repeated, tag = "1")]
    pub sessions: Vec<UsageInfoRecord>,
}
