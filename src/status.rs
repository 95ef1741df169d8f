//! Persisted outcome of the last finished run per space.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::SpaceKey;
use crate::stats::RunStats;

/// Result of the last run of a space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Run completed without recorded errors.
    Success,
    /// Run completed, but some documents or index operations failed.
    PartialFailure(String),
    /// Run aborted.
    Failed(String),
    /// No run finished yet.
    #[default]
    Skipped,
}

/// Last run information for a single space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpaceRunInfo {
    /// Start of the last finished run, epoch millis.
    pub last_run: Option<i64>,
    pub last_result: RunOutcome,
    pub full_update: bool,
    pub updated: u64,
    pub deleted: u64,
    pub deleted_secondary: u64,
    pub with_error: u64,
    pub duration_ms: u64,
}

/// Persistent run status for all spaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatus {
    /// Keyed by space key.
    pub spaces: BTreeMap<String, SpaceRunInfo>,
}

impl IndexStatus {
    /// Load status from disk; a missing file is an empty status.
    pub fn load(data_dir: &Path) -> Result<Self, std::io::Error> {
        let path = Self::status_path(data_dir);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), std::io::Error> {
        let path = Self::status_path(data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
    }

    /// Record the frozen statistics of a finished run.
    pub fn update(&mut self, stats: &RunStats) {
        let message = stats.error_message.clone().unwrap_or_default();
        let result = if !stats.succeeded() {
            RunOutcome::Failed(message)
        } else if stats.with_error > 0 {
            RunOutcome::PartialFailure(message)
        } else {
            RunOutcome::Success
        };

        self.spaces.insert(
            stats.space_key.to_string(),
            SpaceRunInfo {
                last_run: Some(stats.start_time.timestamp_millis()),
                last_result: result,
                full_update: stats.full_update,
                updated: stats.updated,
                deleted: stats.deleted,
                deleted_secondary: stats.deleted_secondary,
                with_error: stats.with_error,
                duration_ms: stats.elapsed_ms,
            },
        );
    }

    pub fn get(&self, key: &SpaceKey) -> Option<&SpaceRunInfo> {
        self.spaces.get(key.as_str())
    }

    pub fn status_path(data_dir: &Path) -> PathBuf {
        data_dir.join("index_status.json")
    }
}
