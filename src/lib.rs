//! rswidevine-policy - license policy engine and usage ledger for a
//! Widevine-style CDM.
//!
//! This crate provides:
//! - A per-session license policy engine with key status tracking.
//! - A persistent usage table ledger with eviction and compaction.
//! - Device file storage (in memory or hashed files on disk).
//! - A software reference crypto engine implementing the secure usage table.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `chrono`: use chrono for date handling in the CLI.
//! - `tracing`: enable tracing macros and subscriber.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Time sources.
pub mod clock;
/// YAML configuration.
pub mod config;
/// Crypto session capability and the software reference engine.
pub mod crypto;
/// Common error types and Result alias.
pub mod error;
/// Session event listeners.
pub mod events;
/// Key ids and license key descriptions.
pub mod key;
/// License and policy description.
pub mod license;
/// Per-key status tracking.
pub mod license_keys;
/// License policy engine.
pub mod policy;
/// Session identifiers.
pub mod session;
/// Persistent device files.
pub mod storage;
/// Usage table ledger.
pub mod usage;
/// Shared helper utilities.
pub mod utils;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::Config;
pub use crate::crypto::{CryptoSession, CryptoSessionFactory, SecurityLevel};
pub use crate::error::{Error, Result};
pub use crate::events::EventListener;
pub use crate::license::License;
pub use crate::policy::{LicenseState, PolicyEngine};
pub use crate::session::SessionId;
pub use crate::storage::DeviceFiles;
pub use crate::usage::UsageTableHeader;
