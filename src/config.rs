//! TOML configuration.
//!
//! ```toml
//! data_dir = "/var/lib/space-indexer"
//!
//! [remote]
//! base_url = "https://wiki.example.com/api"
//! username = "indexer"
//!
//! [spaces]
//! exclude = ["ARCHIVE"]
//!
//! [schedule]
//! max_jobs = 4
//! full_update_cron = "0 0 3 * * *"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::{FullUpdateSchedule, ScheduleConfig};
use crate::job::{DEFAULT_SINGLE_SHOT_BATCH, SyncMode};
use crate::model::SpaceKey;
use crate::search::MappingConfig;

pub const CONFIG_ENV: &str = "SPACE_INDEXER_CONFIG";
pub const PASSWORD_ENV: &str = "SPACE_INDEXER_REMOTE_PASSWORD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Request every document's detail endpoint while indexing.
    #[serde(default)]
    pub fetch_details: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpacesConfig {
    /// Explicit space list; empty means discover from the remote.
    pub include: Vec<String>,
    /// Discovered spaces to leave alone.
    pub exclude: Vec<String>,
}

impl SpacesConfig {
    pub fn include_keys(&self) -> Vec<SpaceKey> {
        self.include.iter().map(|k| SpaceKey::new(k.as_str())).collect()
    }

    pub fn exclude_keys(&self) -> Vec<SpaceKey> {
        self.exclude.iter().map(|k| SpaceKey::new(k.as_str())).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleSettings {
    pub max_jobs: usize,
    pub index_update_period_mins: i64,
    pub full_update_period_mins: Option<i64>,
    /// Cron expression with a seconds field; wins over the period.
    pub full_update_cron: Option<String>,
    pub sync_mode: SyncMode,
    pub single_shot_batch_size: usize,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            max_jobs: 2,
            index_update_period_mins: 5,
            full_update_period_mins: None,
            full_update_cron: None,
            sync_mode: SyncMode::Watermark,
            single_shot_batch_size: DEFAULT_SINGLE_SHOT_BATCH,
        }
    }
}

impl ScheduleSettings {
    pub fn to_schedule(&self) -> Result<ScheduleConfig, ConfigError> {
        if self.max_jobs == 0 {
            return Err(ConfigError::Invalid("schedule.max_jobs must be at least 1".into()));
        }
        if self.index_update_period_mins < 0 {
            return Err(ConfigError::Invalid(
                "schedule.index_update_period_mins must not be negative".into(),
            ));
        }
        let full_update = match (&self.full_update_cron, self.full_update_period_mins) {
            (Some(expr), _) => {
                let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                    ConfigError::Invalid(format!("schedule.full_update_cron {expr:?}: {e}"))
                })?;
                FullUpdateSchedule::Cron(Box::new(schedule))
            }
            (None, Some(mins)) if mins < 1 => {
                return Err(ConfigError::Invalid(
                    "schedule.full_update_period_mins must be at least 1".into(),
                ));
            }
            (None, Some(mins)) => FullUpdateSchedule::Period(minutes(mins, "full_update_period_mins")?),
            (None, None) => FullUpdateSchedule::None,
        };
        Ok(ScheduleConfig {
            max_jobs: self.max_jobs,
            index_update_period: minutes(self.index_update_period_mins, "index_update_period_mins")?,
            full_update,
            sync_mode: self.sync_mode,
            single_shot_batch_size: self.single_shot_batch_size.max(1),
        })
    }
}

fn minutes(value: i64, name: &str) -> Result<Duration, ConfigError> {
    Duration::try_minutes(value)
        .ok_or_else(|| ConfigError::Invalid(format!("schedule.{name} is out of range")))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub remote: Option<RemoteConfig>,
    pub spaces: SpacesConfig,
    pub schedule: ScheduleSettings,
    pub mapping: MappingConfig,
}

impl Config {
    /// Load from `path`, or from the default location when not given. A
    /// missing default file yields the default configuration; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Self::default().finish(),
            },
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Self::default().finish();
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        if let (Some(remote), Ok(password)) = (self.remote.as_mut(), std::env::var(PASSWORD_ENV))
            && !password.is_empty()
        {
            remote.password = Some(password);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(remote) = &self.remote {
            if remote.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("remote.base_url must not be empty".into()));
            }
            if remote.page_size == 0 {
                return Err(ConfigError::Invalid("remote.page_size must be at least 1".into()));
            }
        }
        self.schedule.to_schedule()?;
        Ok(())
    }

    /// The `[remote]` section, required by commands that talk to the remote.
    pub fn require_remote(&self) -> Result<&RemoteConfig, ConfigError> {
        self.remote
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("missing [remote] section".into()))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("space-indexer").join("config.toml"))
}
