//! Per-run statistics.
//!
//! A [`RunStats`] is owned and mutated by exactly one job. Anything that
//! wants to look at a run while it is in flight reads a cloned snapshot from
//! the job's [`StatsSlot`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::SpaceKey;

/// Lifecycle of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_done(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Counters and outcome of one synchronization run of one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub space_key: SpaceKey,
    pub full_update: bool,
    /// Records written (optimistically counted before the bulk commit).
    pub updated: u64,
    /// Primary records removed.
    pub deleted: u64,
    /// Secondary records (comments) removed.
    pub deleted_secondary: u64,
    /// Documents or operations that failed without aborting the run.
    pub with_error: u64,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub state: JobState,
    /// `"; "`-joined log of non-fatal problems and the fatal one, if any.
    pub error_message: Option<String>,
}

impl RunStats {
    pub fn new(space_key: SpaceKey, full_update: bool) -> Self {
        Self {
            space_key,
            full_update,
            updated: 0,
            deleted: 0,
            deleted_secondary: 0,
            with_error: 0,
            start_time: Utc::now(),
            elapsed_ms: 0,
            state: JobState::Created,
            error_message: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }

    pub fn add_error_message(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        match &mut self.error_message {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(message);
            }
            None => self.error_message = Some(message.to_string()),
        }
    }

    /// Account for a partially failed bulk request whose writes were already
    /// counted in `updated`.
    pub fn record_partial_failure(&mut self, failed: u64) {
        self.with_error += failed;
        self.updated = self.updated.saturating_sub(failed);
    }

    pub fn mark_running(&mut self) {
        self.start_time = Utc::now();
        self.state = JobState::Running;
    }

    pub fn finish(&mut self, succeeded: bool) {
        let elapsed = Utc::now() - self.start_time;
        self.elapsed_ms = u64::try_from(elapsed.num_milliseconds()).unwrap_or(0);
        self.state = if succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
    }
}

/// Read-only view of a job's statistics, refreshed by the job at page
/// boundaries.
#[derive(Debug)]
pub struct StatsSlot {
    snapshot: RwLock<RunStats>,
}

impl StatsSlot {
    pub fn new(initial: RunStats) -> Self {
        Self {
            snapshot: RwLock::new(initial),
        }
    }

    pub fn publish(&self, stats: &RunStats) {
        *self.snapshot.write() = stats.clone();
    }

    pub fn snapshot(&self) -> RunStats {
        self.snapshot.read().clone()
    }
}
