#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use rand_core::{OsRng, RngCore};

use rswidevine_policy::clock::{Clock, ManualClock, SystemClock};
use rswidevine_policy::config::Config;
use rswidevine_policy::crypto::reference::ReferenceEngine;
use rswidevine_policy::crypto::SecurityLevel;
use rswidevine_policy::events::{EventListener, LoggingListener};
use rswidevine_policy::key::{EntitledKey, KeyId, KeyKind};
use rswidevine_policy::license::License;
use rswidevine_policy::policy::PolicyEngine;
use rswidevine_policy::session::SessionId;
use rswidevine_policy::storage::{
    usage_info_file_name, DeviceFiles, FileDeviceFiles, LicenseRecord, UsageInfoRecord,
};
use rswidevine_policy::usage::{StorageKind, UsageTableHeader};

#[cfg(feature = "chrono")]
use chrono::Datelike;

use tracing::{info, warn, Level};

const GENERATION_FILE_NAME: &str = "generation.bin";

#[derive(Parser)]
#[command(
    name = "rswidevine-policy",
    version,
    disable_version_flag = true,
    about = "rswidevine-policy CLI"
)]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// YAML configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run a license through the policy engine on a simulated clock.
    ///
    /// The license is a YAML document. The clock starts at the license
    /// start time (or `--start`) and advances by `--step` seconds until
    /// `--duration` has elapsed, firing the timer at every step.
    Simulate {
        license_path: PathBuf,
        /// Simulation start, in seconds since the epoch.
        #[arg(long = "start")]
        start: Option<i64>,
        #[arg(long = "duration", default_value = "3600")]
        duration: i64,
        #[arg(long = "step", default_value = "60")]
        step: i64,
        /// Offset from the start at which decryption begins.
        #[arg(long = "begin-at")]
        begin_at: Option<i64>,
        /// Entitled key binding, as CONTENT_KID=ENTITLEMENT_KID.
        #[arg(long = "entitled")]
        entitled: Vec<String>,
    },
    /// Inspect or edit the usage table stored in a directory.
    Ledger {
        /// Storage directory; defaults to `storage.base_path` of the config.
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
        /// Security level of the table; defaults to the reference crypto level.
        #[arg(short = 'l', long = "level")]
        level: Option<SecurityLevel>,
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// List every usage entry.
    List,
    /// Create an entry and the record that owns it.
    Add {
        key_set_id: String,
        /// Store as a usage info record of this app instead of a license.
        #[arg(long = "usage-info")]
        usage_info: Option<String>,
    },
    /// Delete an entry and the record that owns it.
    Delete { index: u32 },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("rswidevine-policy version {} ({})", version, current_year());

    if cli.version {
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Some(Commands::Simulate {
            license_path,
            start,
            duration,
            step,
            begin_at,
            entitled,
        }) => run_simulate(
            &config,
            &license_path,
            start,
            duration,
            step,
            begin_at,
            &entitled,
        ),
        Some(Commands::Ledger { dir, level, action }) => {
            let dir = dir.unwrap_or_else(|| config.storage.base_path.clone());
            let level = level.unwrap_or(config.reference_crypto.security_level);
            run_ledger(&config, &dir, level, action)
        }
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2024) as i64
    }
}

fn format_time(seconds: i64) -> String {
    #[cfg(feature = "chrono")]
    {
        chrono::DateTime::from_timestamp(seconds, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| seconds.to_string())
    }
    #[cfg(not(feature = "chrono"))]
    {
        seconds.to_string()
    }
}

fn parse_entitled(pair: &str) -> anyhow::Result<EntitledKey> {
    let Some((content, entitlement)) = pair.split_once('=') else {
        bail!("Invalid entitled key binding {:?}, expected CONTENT=ENTITLEMENT", pair);
    };
    Ok(EntitledKey::new(KeyId::parse(entitlement), KeyId::parse(content)))
}

fn simulation_device_key(config: &Config) -> anyhow::Result<[u8; 16]> {
    if config.reference_crypto.device_key.trim().is_empty() {
        let mut key = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        return Ok(key);
    }
    Ok(config.reference_crypto.device_key()?)
}

fn run_simulate(
    config: &Config,
    license_path: &Path,
    start: Option<i64>,
    duration: i64,
    step: i64,
    begin_at: Option<i64>,
    entitled: &[String],
) -> anyhow::Result<()> {
    if step <= 0 {
        bail!("--step must be positive");
    }
    let text = std::fs::read_to_string(license_path)
        .with_context(|| format!("Failed to read {}", license_path.display()))?;
    let license = License::from_yaml_str(&text).context("Failed to parse license")?;
    let entitled = entitled
        .iter()
        .map(|pair| parse_entitled(pair))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let start = start
        .or(license.license_start_time)
        .unwrap_or_else(|| SystemClock.now());
    let clock = ManualClock::new(start);
    let mut crypto_config = config.reference_crypto.clone();
    crypto_config.device_key = hex::encode(simulation_device_key(config)?);
    let crypto = ReferenceEngine::from_config(&crypto_config, Arc::new(clock.clone()), None)?;
    info!("[+] Loaded reference crypto ({})", crypto_config.security_level);

    let session_id = SessionId::random();
    let listener: Arc<dyn EventListener> = Arc::new(LoggingListener);
    let mut engine = PolicyEngine::new(
        session_id.clone(),
        Some(listener),
        Arc::new(crypto.open_session()),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_config(config.policy);
    info!("[+] Opened session {}", session_id);

    engine.set_license(&license);
    if !entitled.is_empty() {
        let bound = engine.set_entitled_license_keys(&entitled);
        info!("[+] Bound {}/{} entitled keys", bound, entitled.len());
    }

    let mut key_ids: Vec<KeyId> = license
        .keys
        .iter()
        .filter(|k| k.kind == KeyKind::Content)
        .map(|k| k.id.clone())
        .collect();
    key_ids.extend(entitled.iter().map(|k| k.key_id.clone()));

    let mut playing = false;
    let mut offset = 0;
    while offset <= duration {
        clock.set(start + offset);
        if playing {
            engine.decryption_event();
        } else if begin_at.is_some_and(|at| at <= offset) {
            playing = engine.begin_decryption();
            if playing {
                info!("[{}] decryption began", offset);
            } else {
                warn!("[{}] decryption refused", offset);
            }
        }
        engine.on_timer_event();

        let usable = key_ids
            .iter()
            .filter(|id| engine.can_decrypt_content(id))
            .count();
        info!(
            "[{}] state {:?}, {} of {} keys usable",
            offset,
            engine.state(),
            usable,
            key_ids.len()
        );
        offset += step;
    }

    print!("{}", serde_yaml::to_string(&engine.query())?);
    Ok(())
}

fn open_ledger(
    config: &Config,
    dir: &Path,
    level: SecurityLevel,
) -> anyhow::Result<(FileDeviceFiles, ReferenceEngine, UsageTableHeader)> {
    let files = FileDeviceFiles::new(dir, level)?;
    let mut crypto_config = config.reference_crypto.clone();
    crypto_config.security_level = level;
    let crypto = ReferenceEngine::from_config(
        &crypto_config,
        Arc::new(SystemClock),
        Some(files.dir().join(GENERATION_FILE_NAME)),
    )
    .context("A fixed reference_crypto.device_key is required for a stored ledger")?;

    let mut ledger = UsageTableHeader::new(
        Box::new(files.clone()),
        Arc::new(crypto.clone()),
        Arc::new(SystemClock),
        config.usage_table,
    );
    let session = crypto.open_session();
    ledger.init(level, &session)?;
    info!("[+] Loaded usage table from {} ({} entries)", files.dir().display(), ledger.len());
    Ok((files, crypto, ledger))
}

fn run_ledger(
    config: &Config,
    dir: &Path,
    level: SecurityLevel,
    action: LedgerAction,
) -> anyhow::Result<()> {
    let (files, crypto, mut ledger) = open_ledger(config, dir, level)?;

    match action {
        LedgerAction::List => {
            for (index, entry) in ledger.entries().iter().enumerate() {
                match entry.storage {
                    StorageKind::Unknown => println!("{:>4}  <unknown>", index),
                    StorageKind::License => println!(
                        "{:>4}  license     {}  {}",
                        index,
                        entry.key_set_id,
                        format_time(entry.last_use_time)
                    ),
                    StorageKind::UsageInfo => println!(
                        "{:>4}  usage-info  {}  {}  {}",
                        index,
                        entry.key_set_id,
                        entry.usage_info_file_name,
                        format_time(entry.last_use_time)
                    ),
                }
            }
        }
        LedgerAction::Add {
            key_set_id,
            usage_info,
        } => {
            let file_name = usage_info.as_deref().map(usage_info_file_name);
            let session = crypto.open_session();
            let handle = ledger.add_entry(
                &session,
                file_name.is_none(),
                &key_set_id,
                file_name.as_deref().unwrap_or(""),
            )?;
            session.set_provider_session_token(key_set_id.as_bytes())?;
            let usage_entry = ledger.update_entry(&session)?;

            match &file_name {
                None => {
                    let mut record = LicenseRecord::new(&key_set_id);
                    record.provider_session_token = key_set_id.as_bytes().to_vec();
                    record.usage_entry = usage_entry;
                    record.usage_entry_number = handle.index();
                    files.store_license(&record)?;
                }
                Some(file_name) => {
                    let record = UsageInfoRecord {
                        provider_session_token: key_set_id.as_bytes().to_vec(),
                        key_set_id: key_set_id.clone(),
                        usage_entry,
                        usage_entry_number: handle.index(),
                        ..Default::default()
                    };
                    files.add_usage_info(file_name, &record)?;
                }
            }
            info!("[+] Added usage entry {} for {}", handle.index(), key_set_id);
        }
        LedgerAction::Delete { index } => {
            let Some(entry) = ledger.entries().get(index as usize).cloned() else {
                bail!("No usage entry {} (table size {})", index, ledger.len());
            };
            ledger.delete_entry(index)?;
            match entry.storage {
                StorageKind::License => files.delete_license(&entry.key_set_id)?,
                StorageKind::UsageInfo => {
                    let record = files.retrieve_usage_info_by_key_set_id(
                        &entry.usage_info_file_name,
                        &entry.key_set_id,
                    )?;
                    files.delete_usage_info(
                        &entry.usage_info_file_name,
                        &record.provider_session_token,
                    )?;
                }
                StorageKind::Unknown => {}
            }
            info!("[+] Deleted usage entry {}", index);
        }
    }
    Ok(())
}
