//! Configuration loading from environment variables.
//!
//! Every daemon reads:
//! - `VMTEST_DATABASE_URL`: PostgreSQL connection string (required)
//! - `VMTEST_DATABASE_MAX_CONNECTIONS`: pool size (default: 5)
//! - `VMTEST_POLL_MIN_MS` / `VMTEST_POLL_MAX_MS`: jitter bounds for the sleep
//!   between ticks (defaults differ per daemon)
//!
//! The spawner and runner also read:
//! - `VMTEST_HEARTBEAT_INTERVAL_MS`: heartbeat cadence while a child lives (default: 5000)
//! - `VMTEST_TEMPFAIL_EXIT_CODE`: exit code that means "retry elsewhere" (default: 75)
//!
//! Scheduler:
//! - `VMTEST_TEST_INACTIVE_RESET_SECS`: staleness interval (default: 120)
//! - `VMTEST_ARTIFACT_RETENTION_DAYS`: artifact retention age (default: 30)
//!
//! Spawner:
//! - `VMTEST_IMAGE_CACHE_PATH` (default: /var/cache/vmtest/images)
//! - `VMTEST_VM_MEMORY_MB` (default: 4096), `VMTEST_VM_CORES` (default: 2),
//!   `VMTEST_VM_DISK_GB` (default: 40)
//! - `VMTEST_CHECKSUM_DOMAINS`: comma separated hosts publishing `SHA256SUMS`
//!
//! Runner:
//! - `VMTEST_HARNESS_BINARY` (default: yarf)
//!
//! Storage (scheduler and runner), selected by `VMTEST_STORAGE_PROVIDER`:
//! - `local`: `VMTEST_STORAGE_OBJECT_PATH`, `VMTEST_STORAGE_OBJECT_HOST`,
//!   `VMTEST_STORAGE_OBJECT_PORT`
//! - `swift`: `VMTEST_SWIFT_USER`, `VMTEST_SWIFT_API_KEY`, `VMTEST_SWIFT_AUTH_URL`,
//!   `VMTEST_SWIFT_DOMAIN`, `VMTEST_SWIFT_TENANT`

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// `EX_TEMPFAIL` from sysexits.h.
pub const DEFAULT_TEMPFAIL_EXIT_CODE: i32 = 75;
pub const DEFAULT_TEST_INACTIVE_RESET_SECS: u64 = 120;
pub const DEFAULT_ARTIFACT_RETENTION_DAYS: u64 = 30;
pub const DEFAULT_IMAGE_CACHE_PATH: &str = "/var/cache/vmtest/images";
pub const DEFAULT_CHECKSUM_DOMAINS: &str = "cdimage.ubuntu.com,localhost";
pub const DEFAULT_HARNESS_BINARY: &str = "yarf";
/// First TCP port used by VNC display `:0`.
pub const VNC_BASE_PORT: u16 = 5900;

/// Source of configuration values, keyed by variable name.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// Process environment, after loading `.env` if present.
fn process_env() -> impl Lookup {
    dotenvy::dotenv().ok();
    |key: &str| env::var(key).ok().filter(|value| !value.is_empty())
}

fn required(lookup: &impl Lookup, key: &str) -> Result<String> {
    lookup
        .get(key)
        .with_context(|| format!("{key} environment variable is required"))
}

fn parsed_or<T>(lookup: &impl Lookup, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} value: {raw}")),
        None => Ok(default),
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    fn from_lookup(lookup: &impl Lookup) -> Result<Self> {
        Ok(Self {
            url: required(lookup, "VMTEST_DATABASE_URL")?,
            max_connections: parsed_or(
                lookup,
                "VMTEST_DATABASE_MAX_CONNECTIONS",
                DEFAULT_MAX_CONNECTIONS,
            )?,
        })
    }
}

/// Bounds of the randomized sleep between daemon ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    pub min: Duration,
    pub max: Duration,
}

impl PollInterval {
    pub const SCHEDULER: Self = Self::from_millis(15_000, 45_000);
    pub const WORKER: Self = Self::from_millis(5_000, 15_000);

    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    fn from_lookup(lookup: &impl Lookup, default: Self) -> Result<Self> {
        let min = parsed_or(lookup, "VMTEST_POLL_MIN_MS", default.min.as_millis() as u64)?;
        let max = parsed_or(lookup, "VMTEST_POLL_MAX_MS", default.max.as_millis() as u64)?;
        if min > max {
            bail!("VMTEST_POLL_MIN_MS ({min}) must not exceed VMTEST_POLL_MAX_MS ({max})");
        }
        Ok(Self::from_millis(min, max))
    }
}

/// Keystone v3 credentials for the Swift object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwiftConfig {
    pub user: String,
    pub api_key: String,
    pub auth_url: String,
    pub domain: String,
    pub tenant: String,
}

/// Storage backend selection, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        object_path: PathBuf,
        host: String,
        port: u16,
    },
    Swift(SwiftConfig),
}

impl StorageConfig {
    fn from_lookup(lookup: &impl Lookup) -> Result<Self> {
        let provider = required(lookup, "VMTEST_STORAGE_PROVIDER")?;
        match provider.as_str() {
            "local" => Ok(Self::Local {
                object_path: PathBuf::from(required(lookup, "VMTEST_STORAGE_OBJECT_PATH")?),
                host: required(lookup, "VMTEST_STORAGE_OBJECT_HOST")?,
                port: required(lookup, "VMTEST_STORAGE_OBJECT_PORT")?
                    .parse()
                    .context("invalid VMTEST_STORAGE_OBJECT_PORT")?,
            }),
            "swift" => Ok(Self::Swift(SwiftConfig {
                user: required(lookup, "VMTEST_SWIFT_USER")?,
                api_key: required(lookup, "VMTEST_SWIFT_API_KEY")?,
                auth_url: required(lookup, "VMTEST_SWIFT_AUTH_URL")?,
                domain: required(lookup, "VMTEST_SWIFT_DOMAIN")?,
                tenant: required(lookup, "VMTEST_SWIFT_TENANT")?,
            })),
            other => bail!("unknown VMTEST_STORAGE_PROVIDER: {other} (expected local or swift)"),
        }
    }
}

/// Settings shared by the two lease-holding daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub heartbeat_interval: Duration,
    pub tempfail_exit_code: i32,
}

impl LeaseConfig {
    fn from_lookup(lookup: &impl Lookup) -> Result<Self> {
        let heartbeat_ms = parsed_or(
            lookup,
            "VMTEST_HEARTBEAT_INTERVAL_MS",
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        )?;
        if heartbeat_ms == 0 {
            bail!("VMTEST_HEARTBEAT_INTERVAL_MS must be positive");
        }
        Ok(Self {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            tempfail_exit_code: parsed_or(
                lookup,
                "VMTEST_TEMPFAIL_EXIT_CODE",
                DEFAULT_TEMPFAIL_EXIT_CODE,
            )?,
        })
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            tempfail_exit_code: DEFAULT_TEMPFAIL_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub poll: PollInterval,
    pub storage: StorageConfig,
    /// Heartbeat age after which `spawning`/`running` tests are reclaimed.
    pub test_inactive_reset: Duration,
    pub artifact_retention: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&process_env())
    }

    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self> {
        let reset_secs = parsed_or(
            lookup,
            "VMTEST_TEST_INACTIVE_RESET_SECS",
            DEFAULT_TEST_INACTIVE_RESET_SECS,
        )?;
        let retention_days = parsed_or(
            lookup,
            "VMTEST_ARTIFACT_RETENTION_DAYS",
            DEFAULT_ARTIFACT_RETENTION_DAYS,
        )?;
        let Some(retention_secs) = retention_days.checked_mul(24 * 60 * 60) else {
            bail!("VMTEST_ARTIFACT_RETENTION_DAYS ({retention_days}) is too large");
        };
        Ok(Self {
            database: DatabaseConfig::from_lookup(lookup)?,
            poll: PollInterval::from_lookup(lookup, PollInterval::SCHEDULER)?,
            storage: StorageConfig::from_lookup(lookup)?,
            test_inactive_reset: Duration::from_secs(reset_secs),
            artifact_retention: Duration::from_secs(retention_secs),
        })
    }
}

/// Sizing of each provisioned VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub memory_mb: u32,
    pub cores: u32,
    pub disk_gb: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cores: 2,
            disk_gb: 40,
        }
    }
}

/// VNC endpoint this spawner advertises to runners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncEndpoint {
    pub host: String,
    pub port: u16,
}

impl VncEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            bail!("VNC host must not be empty");
        }
        if port < VNC_BASE_PORT {
            bail!("VNC port {port} is below {VNC_BASE_PORT}");
        }
        Ok(Self { host, port })
    }

    /// Display number passed to the hypervisor.
    pub fn display(&self) -> u16 {
        self.port - VNC_BASE_PORT
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerConfig {
    pub database: DatabaseConfig,
    pub poll: PollInterval,
    pub lease: LeaseConfig,
    pub vnc: VncEndpoint,
    pub image_cache: PathBuf,
    pub vm: VmConfig,
    pub checksum_domains: Vec<String>,
}

impl SpawnerConfig {
    pub fn from_env(vnc: VncEndpoint) -> Result<Self> {
        Self::from_lookup(&process_env(), vnc)
    }

    pub fn from_lookup(lookup: &impl Lookup, vnc: VncEndpoint) -> Result<Self> {
        let defaults = VmConfig::default();
        let checksum_domains = lookup
            .get("VMTEST_CHECKSUM_DOMAINS")
            .unwrap_or_else(|| DEFAULT_CHECKSUM_DOMAINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            database: DatabaseConfig::from_lookup(lookup)?,
            poll: PollInterval::from_lookup(lookup, PollInterval::WORKER)?,
            lease: LeaseConfig::from_lookup(lookup)?,
            vnc,
            image_cache: lookup
                .get("VMTEST_IMAGE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_CACHE_PATH)),
            vm: VmConfig {
                memory_mb: parsed_or(lookup, "VMTEST_VM_MEMORY_MB", defaults.memory_mb)?,
                cores: parsed_or(lookup, "VMTEST_VM_CORES", defaults.cores)?,
                disk_gb: parsed_or(lookup, "VMTEST_VM_DISK_GB", defaults.disk_gb)?,
            },
            checksum_domains,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub database: DatabaseConfig,
    pub poll: PollInterval,
    pub lease: LeaseConfig,
    pub storage: StorageConfig,
    pub harness_binary: String,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&process_env())
    }

    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_lookup(lookup)?,
            poll: PollInterval::from_lookup(lookup, PollInterval::WORKER)?,
            lease: LeaseConfig::from_lookup(lookup)?,
            storage: StorageConfig::from_lookup(lookup)?,
            harness_binary: lookup
                .get("VMTEST_HARNESS_BINARY")
                .unwrap_or_else(|| DEFAULT_HARNESS_BINARY.to_string()),
        })
    }
}
