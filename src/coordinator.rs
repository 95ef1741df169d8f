//! The indexing coordinator.
//!
//! A single thread polls every space, queues the ones that are due and hands
//! them to job threads, never more than `max_jobs` at once and never two for
//! the same space:
//!
//! ```text
//!   space_keys() ──is_update_due──> due queue ──dispatch──> active jobs
//!        ^                                                      │
//!        └──────────────── report_job_finished <────────────────┘
//! ```
//!
//! The registry (active jobs plus due queue) is only touched under one lock.
//! Scheduling state lives in watermarks, so it survives restarts and can be
//! changed from another process (`force-full`) without talking to this one.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::job::{
    CancelToken, DEFAULT_SINGLE_SHOT_BATCH, JobListener, SyncJob, SyncMode, SyncServices,
};
use crate::model::SpaceKey;
use crate::ports::Integration;
use crate::stats::{RunStats, StatsSlot};
use crate::status::IndexStatus;
use crate::watermark::WatermarkPurpose;

/// Poll interval while nothing is queued; also the queue refill period.
pub const SLOW_INTERVAL: StdDuration = StdDuration::from_secs(15);
/// Poll interval while keys are waiting for a free slot.
pub const QUICK_INTERVAL: StdDuration = StdDuration::from_secs(2);

/// When full updates (with delete sweep) are due besides forced ones.
#[derive(Debug, Clone, Default)]
pub enum FullUpdateSchedule {
    #[default]
    None,
    /// Due once the last full update is older than this.
    Period(Duration),
    /// Due once the next fire time after the last full update has passed.
    Cron(Box<cron::Schedule>),
}

impl FullUpdateSchedule {
    pub fn is_configured(&self) -> bool {
        !matches!(self, FullUpdateSchedule::None)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub max_jobs: usize,
    pub index_update_period: Duration,
    pub full_update: FullUpdateSchedule,
    pub sync_mode: SyncMode,
    pub single_shot_batch_size: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_jobs: 2,
            index_update_period: Duration::minutes(5),
            full_update: FullUpdateSchedule::None,
            sync_mode: SyncMode::Watermark,
            single_shot_batch_size: DEFAULT_SINGLE_SHOT_BATCH,
        }
    }
}

struct ActiveJob {
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
    stats: Arc<StatsSlot>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<SpaceKey, ActiveJob>,
    due: VecDeque<SpaceKey>,
}

struct Inner {
    services: SyncServices,
    schedule: ScheduleConfig,
    registry: Mutex<Registry>,
    finished: Mutex<BTreeMap<SpaceKey, RunStats>>,
    status: Mutex<IndexStatus>,
    status_dir: Option<PathBuf>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Cheap to clone; all clones drive the same registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// `status_dir`, when given, receives the status file after every run.
    pub fn new(
        services: SyncServices,
        schedule: ScheduleConfig,
        status_dir: Option<PathBuf>,
    ) -> Self {
        let status = match &status_dir {
            Some(dir) => IndexStatus::load(dir).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring unreadable status file");
                IndexStatus::default()
            }),
            None => IndexStatus::default(),
        };
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            inner: Arc::new(Inner {
                services,
                schedule,
                registry: Mutex::new(Registry::default()),
                finished: Mutex::new(BTreeMap::new()),
                status: Mutex::new(status),
                status_dir,
                wake_tx,
                wake_rx,
            }),
        }
    }

    fn integration(&self) -> &dyn Integration {
        self.inner.services.integration.as_ref()
    }

    fn read(&self, key: &SpaceKey, purpose: WatermarkPurpose) -> SyncResult<Option<DateTime<Utc>>> {
        self.integration().read_watermark(key, purpose)
    }

    /// Whether `key` should be queued: a forced full update is pending, the
    /// update period elapsed, or a scheduled full update is due.
    pub fn is_update_due(&self, key: &SpaceKey) -> SyncResult<bool> {
        if self.read(key, WatermarkPurpose::ForcedFullUpdate)?.is_some() {
            return Ok(true);
        }
        match self.read(key, WatermarkPurpose::LastSchedulingStart)? {
            None => return Ok(true),
            Some(started) if Utc::now() - started >= self.inner.schedule.index_update_period => {
                return Ok(true);
            }
            Some(_) => {}
        }
        if self.inner.schedule.full_update.is_configured() {
            return self.is_full_update_due(key);
        }
        Ok(false)
    }

    /// Whether the next run of `key` must be a full update.
    pub fn is_full_update_due(&self, key: &SpaceKey) -> SyncResult<bool> {
        if self.read(key, WatermarkPurpose::ForcedFullUpdate)?.is_some() {
            return Ok(true);
        }
        let now = Utc::now();
        match &self.inner.schedule.full_update {
            FullUpdateSchedule::Cron(schedule) => {
                let last = self
                    .read(key, WatermarkPurpose::LastFullUpdate)?
                    .unwrap_or(DateTime::UNIX_EPOCH);
                Ok(schedule.after(&last).next().is_some_and(|fire| fire <= now))
            }
            FullUpdateSchedule::Period(period) => {
                Ok(match self.read(key, WatermarkPurpose::LastFullUpdate)? {
                    None => true,
                    Some(last) => now - last >= *period,
                })
            }
            FullUpdateSchedule::None => Ok(false),
        }
    }

    /// Queue every due space that is neither running nor queued yet.
    pub fn refill(&self) -> SyncResult<()> {
        let keys = self.integration().space_keys()?;
        let (active, queued): (HashSet<SpaceKey>, HashSet<SpaceKey>) = {
            let registry = self.inner.registry.lock();
            (
                registry.active.keys().cloned().collect(),
                registry.due.iter().cloned().collect(),
            )
        };

        let mut due = Vec::new();
        for key in keys {
            if active.contains(&key) || queued.contains(&key) {
                continue;
            }
            if self.integration().is_shutdown() {
                return Err(SyncError::Cancelled);
            }
            match self.is_update_due(&key) {
                Ok(true) => due.push(key),
                Ok(false) => {}
                Err(e) => tracing::warn!(space = %key, error = %e, "could not check whether space is due"),
            }
        }

        let mut registry = self.inner.registry.lock();
        for key in due {
            if !registry.active.contains_key(&key) && !registry.due.contains(&key) {
                tracing::debug!(space = %key, "space due for update");
                registry.due.push_back(key);
            }
        }
        Ok(())
    }

    /// Start queued jobs while slots are free.
    ///
    /// With more than one slot, the last free slot is kept for an incremental
    /// job: keys needing a full update are rotated to the back of the queue,
    /// and the pass ends when the first rotated key comes round again.
    pub fn dispatch(&self) {
        let max_jobs = self.inner.schedule.max_jobs;
        let mut registry = self.inner.registry.lock();
        let mut first_skipped: Option<SpaceKey> = None;

        while registry.active.len() < max_jobs {
            if self.integration().is_shutdown() {
                break;
            }
            let Some(key) = registry.due.pop_front() else {
                break;
            };
            if first_skipped.as_ref() == Some(&key) {
                registry.due.push_back(key);
                break;
            }

            let full_needed = match self.is_full_update_due(&key) {
                Ok(full) => full,
                Err(e) => {
                    tracing::warn!(space = %key, error = %e, "could not check for full update, dropping from queue");
                    continue;
                }
            };
            if full_needed && max_jobs > 1 && max_jobs - registry.active.len() == 1 {
                tracing::debug!(space = %key, "keeping last slot for an incremental update");
                if first_skipped.is_none() {
                    first_skipped = Some(key.clone());
                }
                registry.due.push_back(key);
                continue;
            }

            self.start_job(&mut registry, key, full_needed);
        }
    }

    fn start_job(&self, registry: &mut Registry, key: SpaceKey, full_needed: bool) {
        let schedule = &self.inner.schedule;
        let full_update = full_needed || schedule.sync_mode.always_full();

        if let Err(e) = self.integration().write_watermark(
            &key,
            WatermarkPurpose::LastSchedulingStart,
            Utc::now(),
        ) {
            tracing::warn!(space = %key, error = %e, "could not record scheduling start, not starting job");
            return;
        }

        let job = SyncJob::new(
            key.clone(),
            full_update,
            self.inner.services.clone(),
            schedule.sync_mode.build_strategy(schedule.single_shot_batch_size),
            Arc::new(self.clone()),
        );
        registry.active.insert(
            key.clone(),
            ActiveJob {
                handle: None,
                cancel: job.cancel_token(),
                stats: job.stats_slot(),
            },
        );

        tracing::info!(space = %key, full_update, "dispatching sync job");
        let spawned = std::thread::Builder::new()
            .name(format!("sync-{key}"))
            .spawn(move || {
                job.run();
            });
        match spawned {
            Ok(handle) => {
                if let Some(entry) = registry.active.get_mut(&key) {
                    entry.handle = Some(handle);
                }
            }
            Err(e) => {
                tracing::error!(space = %key, error = %e, "failed to spawn sync job thread");
                registry.active.remove(&key);
            }
        }
    }

    /// Completion of the job for `key`. Frees the slot and records the
    /// outcome of full updates; a failed full update is forced again unless
    /// a recurring schedule will pick it up anyway.
    pub fn report_job_finished(&self, key: &SpaceKey, succeeded: bool, was_full_update: bool) {
        self.inner.registry.lock().active.remove(key);

        if was_full_update {
            let integration = self.integration();
            let result = if succeeded {
                integration
                    .delete_watermark(key, WatermarkPurpose::ForcedFullUpdate)
                    .and_then(|_| {
                        integration.write_watermark(key, WatermarkPurpose::LastFullUpdate, Utc::now())
                    })
            } else if !self.inner.schedule.full_update.is_configured() {
                tracing::info!(space = %key, "full update failed, forcing it again");
                integration.write_watermark(key, WatermarkPurpose::ForcedFullUpdate, Utc::now())
            } else {
                Ok(())
            };
            if let Err(e) = result {
                tracing::error!(space = %key, error = ?e, "failed to record full update outcome");
            }
        }
        self.wake();
    }

    /// Request a full update of `key` on the next pass.
    pub fn force_full(&self, key: &SpaceKey) -> SyncResult<()> {
        self.integration()
            .write_watermark(key, WatermarkPurpose::ForcedFullUpdate, Utc::now())?;
        self.wake();
        Ok(())
    }

    /// Drop a pending forced full update and make `key` due for an
    /// incremental update on the next pass. Returns whether a forced full
    /// update was pending.
    pub fn force_incremental(&self, key: &SpaceKey) -> SyncResult<bool> {
        let integration = self.integration();
        let was_forced = integration.delete_watermark(key, WatermarkPurpose::ForcedFullUpdate)?;
        integration.delete_watermark(key, WatermarkPurpose::LastSchedulingStart)?;
        self.wake();
        Ok(was_forced)
    }

    /// Per space: the live statistics of the running job, else those of the
    /// last finished run.
    pub fn current_run_stats(&self) -> Vec<RunStats> {
        let mut all = self.inner.finished.lock().clone();
        for (key, job) in &self.inner.registry.lock().active {
            all.insert(key.clone(), job.stats.snapshot());
        }
        all.into_values().collect()
    }

    pub fn active_keys(&self) -> Vec<SpaceKey> {
        let mut keys: Vec<_> = self.inner.registry.lock().active.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn queued_keys(&self) -> Vec<SpaceKey> {
        self.inner.registry.lock().due.iter().cloned().collect()
    }

    /// Interrupt the current sleep of the loop.
    pub fn wake(&self) {
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Signal every running job to stop and forget all scheduling state.
    /// Does not wait for the jobs to exit, so a space may still be syncing
    /// after it leaves `active`; only called once the loop has stopped
    /// dispatching.
    fn cancel_all(&self) {
        let mut registry = self.inner.registry.lock();
        for (key, job) in registry.active.drain() {
            tracing::debug!(space = %key, "cancelling sync job");
            job.cancel.cancel();
            drop(job.handle);
        }
        registry.due.clear();
    }

    /// Run the polling loop on its own thread.
    pub fn spawn(&self) -> SyncResult<JoinHandle<()>> {
        let this = self.clone();
        Ok(std::thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || this.run_loop())?)
    }

    /// Poll until the integration reports shutdown, then cancel all jobs.
    pub fn run_loop(&self) {
        tracing::info!(
            max_jobs = self.inner.schedule.max_jobs,
            mode = ?self.inner.schedule.sync_mode,
            "coordinator started"
        );
        let mut last_refill: Option<Instant> = None;
        while !self.integration().is_shutdown() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.poll_once(&mut last_refill)));
            let sleep = match outcome {
                Ok(Ok(sleep)) => sleep,
                Ok(Err(e)) if e.is_cancelled() => break,
                Ok(Err(e)) => {
                    log_loop_error(&e);
                    SLOW_INTERVAL
                }
                Err(_) => {
                    tracing::error!("coordinator pass panicked");
                    SLOW_INTERVAL
                }
            };

            if self.integration().is_shutdown() {
                break;
            }
            match self.inner.wake_rx.recv_timeout(sleep) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.cancel_all();
        tracing::info!("coordinator stopped");
    }

    /// One scheduling pass; returns how long to sleep afterwards.
    fn poll_once(&self, last_refill: &mut Option<Instant>) -> SyncResult<StdDuration> {
        let queue_empty = self.inner.registry.lock().due.is_empty();
        let refill_stale = last_refill.is_none_or(|at| at.elapsed() > SLOW_INTERVAL);
        if queue_empty || refill_stale {
            match self.refill() {
                Ok(()) => *last_refill = Some(Instant::now()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log_loop_error(&e),
            }
        }

        if self.inner.registry.lock().due.is_empty() {
            return Ok(SLOW_INTERVAL);
        }
        self.dispatch();
        Ok(QUICK_INTERVAL)
    }

    fn record_status(&self, stats: &RunStats) {
        let Some(dir) = &self.inner.status_dir else {
            return;
        };
        let mut status = self.inner.status.lock();
        status.update(stats);
        if let Err(e) = status.save(dir) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

fn log_loop_error(e: &SyncError) {
    if e.is_operational() {
        tracing::warn!(error = %e, "coordinator pass failed");
    } else {
        tracing::error!(error = ?e, "coordinator pass failed");
    }
}

impl JobListener for Coordinator {
    fn job_finished(&self, stats: RunStats) {
        self.record_status(&stats);
        let key = stats.space_key.clone();
        let succeeded = stats.succeeded();
        let full_update = stats.full_update;
        self.inner.finished.lock().insert(key.clone(), stats);
        self.report_job_finished(&key, succeeded, full_update);
    }
}
