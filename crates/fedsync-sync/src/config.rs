use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fedsync_core::{SyncMode, SyncType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("reading {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{sync_type}: {reason}")]
    Invalid { sync_type: SyncType, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBackend {
    Api,
    File,
}

impl FromStr for SourceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "http" => Ok(SourceBackend::Api),
            "file" => Ok(SourceBackend::File),
            other => Err(other.to_string()),
        }
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub store: StoreBackend,
    pub source: SourceBackend,
    pub data_dir: PathBuf,
    pub sam_api_base_url: String,
    pub sam_api_key: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_types_file: PathBuf,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            store: parse_var(&lookup, "FEDSYNC_STORE", StoreBackend::Postgres)?,
            source: parse_var(&lookup, "FEDSYNC_SOURCE", SourceBackend::File)?,
            data_dir: non_empty("FEDSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/sam-gov")),
            sam_api_base_url: non_empty("SAM_API_BASE_URL")
                .unwrap_or_else(|| "https://api.sam.gov".to_string()),
            sam_api_key: non_empty("SAM_API_KEY"),
            user_agent: non_empty("FEDSYNC_USER_AGENT"),
            http_timeout_secs: parse_var(&lookup, "FEDSYNC_HTTP_TIMEOUT_SECS", 20)?,
            scheduler_enabled: lookup("FEDSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
            sync_types_file: non_empty("FEDSYNC_SYNC_TYPES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sync_types.yaml")),
            web_port: parse_var(&lookup, "FEDSYNC_WEB_PORT", 8000)?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

/// Exponential backoff for page fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per page, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_attempts.saturating_sub(1) as usize,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Six-field cron expression (seconds first).
    pub cron: String,
    #[serde(default)]
    pub mode: SyncMode,
}

impl ScheduleEntry {
    pub fn new(cron: &str, mode: SyncMode) -> Self {
        Self {
            cron: cron.to_string(),
            mode,
        }
    }
}

pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTypeSettings {
    pub enabled: bool,
    pub schedules: Vec<ScheduleEntry>,
    pub page_size: usize,
    pub retry: RetrySettings,
    pub concurrency: usize,
    pub page_timeout_secs: u64,
    pub record_timeout_secs: u64,
    pub max_run_secs: u64,
    pub stale_after_secs: u64,
    pub max_recorded_errors: usize,
}

impl Default for SyncTypeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedules: Vec::new(),
            page_size: 100,
            retry: RetrySettings::default(),
            concurrency: 4,
            page_timeout_secs: 60,
            record_timeout_secs: 30,
            max_run_secs: 3_600,
            stale_after_secs: 10_800,
            max_recorded_errors: 100,
        }
    }
}

impl SyncTypeSettings {
    /// Built-in settings used when a type has no entry in the settings file.
    pub fn defaults_for(sync_type: SyncType) -> Self {
        let schedules = match sync_type {
            SyncType::Opportunities => vec![
                ScheduleEntry::new("0 */15 * * * *", SyncMode::Incremental),
                ScheduleEntry::new("0 30 2 * * *", SyncMode::Full),
            ],
            SyncType::Awards => vec![ScheduleEntry::new("0 0 3 * * *", SyncMode::Full)],
            SyncType::Organizations => vec![ScheduleEntry::new("0 0 4 * * *", SyncMode::Full)],
        };
        Self {
            schedules,
            ..Self::default()
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }

    pub fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    fn validate(&self, sync_type: SyncType) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            sync_type,
            reason: reason.to_string(),
        };
        if self.page_size == 0 {
            return Err(invalid("page_size must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.page_timeout_secs == 0 || self.record_timeout_secs == 0 || self.max_run_secs == 0 {
            return Err(invalid("timeouts must be greater than zero"));
        }
        // A live run must never look abandoned to the next trigger.
        if self.stale_after_secs <= self.max_run_secs {
            return Err(invalid("stale_after_secs must exceed max_run_secs"));
        }
        if self.schedules.iter().any(|s| s.cron.trim().is_empty()) {
            return Err(invalid("schedule cron expressions must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SyncTypesFile {
    #[serde(default)]
    sync_types: BTreeMap<SyncType, SyncTypeSettings>,
}

/// Per-type settings, always populated for every [`SyncType`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTypeRegistry {
    types: BTreeMap<SyncType, SyncTypeSettings>,
}

impl Default for SyncTypeRegistry {
    fn default() -> Self {
        Self::defaults()
    }
}

impl SyncTypeRegistry {
    pub fn defaults() -> Self {
        Self {
            types: SyncType::ALL
                .iter()
                .map(|t| (*t, SyncTypeSettings::defaults_for(*t)))
                .collect(),
        }
    }

    /// Loads `path`; a missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml_str(&text).map_err(|err| match err {
                ConfigError::Parse { source, .. } => ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                },
                other => other,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "sync types file not found, using defaults");
                Ok(Self::defaults())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: SyncTypesFile = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let mut registry = Self::defaults();
        for (sync_type, settings) in file.sync_types {
            registry.types.insert(sync_type, settings);
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.types.iter().try_for_each(|(t, s)| s.validate(*t))
    }

    pub fn with_settings(mut self, sync_type: SyncType, settings: SyncTypeSettings) -> Self {
        self.types.insert(sync_type, settings);
        self
    }

    pub fn settings(&self, sync_type: SyncType) -> SyncTypeSettings {
        self.types
            .get(&sync_type)
            .cloned()
            .unwrap_or_else(|| SyncTypeSettings::defaults_for(sync_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SyncType, &SyncTypeSettings)> {
        self.types.iter().map(|(t, s)| (*t, s))
    }
}
