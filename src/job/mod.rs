//! One-shot synchronization jobs.
//!
//! A [`SyncJob`] synchronizes exactly one space, exactly once. The shared
//! behaviour (detail fetching, bulk commits, the deletion sweep, cancellation
//! checks) lives on [`JobContext`]; how the remote is walked is decided by the
//! [`UpdateStrategy`] the job was built with:
//!
//! - [`WatermarkJob`]: incremental, driven by the last seen update time
//! - [`PaginatingJob`]: full re-scan by offset pagination
//! - [`SingleShotJob`]: full re-scan from a single unpaginated listing
//!
//! ```text
//! Created ──run()──> Running ──> Succeeded
//!                        └─────> Failed
//! ```
//!
//! Whatever happens inside, `run()` notifies its [`JobListener`] exactly once.

pub mod paginating;
pub mod single_shot;
pub mod watermark;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::model::{Batch, Hit, RawDocument, RecordKind, SpaceKey};
use crate::ports::{DocumentWriter, Integration, RemoteSource};
use crate::stats::{RunStats, StatsSlot};

pub use paginating::PaginatingJob;
pub use single_shot::SingleShotJob;
pub use watermark::WatermarkJob;

/// Page size used when scrolling over records to delete.
pub const DELETE_PAGE_SIZE: usize = 100;

/// Default bulk size of [`SingleShotJob`].
pub const DEFAULT_SINGLE_SHOT_BATCH: usize = 50;

/// The ports a job works through.
#[derive(Clone)]
pub struct SyncServices {
    pub integration: Arc<dyn Integration>,
    pub remote: Arc<dyn RemoteSource>,
    pub writer: Arc<dyn DocumentWriter>,
}

impl SyncServices {
    pub fn new(
        integration: Arc<dyn Integration>,
        remote: Arc<dyn RemoteSource>,
        writer: Arc<dyn DocumentWriter>,
    ) -> Self {
        Self {
            integration,
            remote,
            writer,
        }
    }
}

/// Cooperative cancellation flag for one job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives the frozen statistics of a finished job.
pub trait JobListener: Send + Sync {
    fn job_finished(&self, stats: RunStats);
}

/// How a job walks the remote source.
pub trait UpdateStrategy: Send {
    fn name(&self) -> &'static str;

    /// Index everything this strategy considers changed.
    fn process_update(&mut self, ctx: &mut JobContext) -> SyncResult<()>;
}

/// Which strategy the coordinator instantiates for every space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Watermark,
    Paginating,
    SingleShot,
}

impl SyncMode {
    /// Strategies without a cursor can only ever run full updates.
    pub fn always_full(self) -> bool {
        !matches!(self, SyncMode::Watermark)
    }

    pub fn build_strategy(self, single_shot_batch: usize) -> Box<dyn UpdateStrategy> {
        match self {
            SyncMode::Watermark => Box::new(WatermarkJob::new()),
            SyncMode::Paginating => Box::new(PaginatingJob::new()),
            SyncMode::SingleShot => Box::new(SingleShotJob::new(single_shot_batch)),
        }
    }
}

/// Outcome of [`JobContext::fetch_detail`].
#[derive(Debug)]
pub enum DetailFetch {
    /// Go on indexing, with the extra detail if the remote provided some.
    Ready(Option<RawDocument>),
    /// The document vanished from the remote; do not index it.
    Skip,
}

/// Everything a strategy needs while it runs, plus the shared operations.
pub struct JobContext {
    space_key: SpaceKey,
    services: SyncServices,
    stats: RunStats,
    cancel: CancelToken,
    slot: Arc<StatsSlot>,
}

impl JobContext {
    pub fn space_key(&self) -> &SpaceKey {
        &self.space_key
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn is_full_update(&self) -> bool {
        self.stats.full_update
    }

    /// Turn the running job into a full update (e.g. no cursor exists yet).
    pub fn promote_to_full_update(&mut self) {
        self.stats.full_update = true;
    }

    pub fn integration(&self) -> Arc<dyn Integration> {
        Arc::clone(&self.services.integration)
    }

    pub fn remote(&self) -> Arc<dyn RemoteSource> {
        Arc::clone(&self.services.remote)
    }

    pub fn writer(&self) -> Arc<dyn DocumentWriter> {
        Arc::clone(&self.services.writer)
    }

    /// Fails with [`SyncError::Cancelled`] once the job or the service is
    /// asked to stop.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() || self.services.integration.is_shutdown() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Make the current counters visible to status readers.
    pub fn publish(&self) {
        self.slot.publish(&self.stats);
    }

    pub fn require_id(&self, document: &RawDocument) -> SyncResult<String> {
        self.services
            .writer
            .extract_id(document)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SyncError::MissingId {
                space: self.space_key.to_string(),
            })
    }

    pub fn require_updated(&self, id: &str, document: &RawDocument) -> SyncResult<DateTime<Utc>> {
        self.services
            .writer
            .extract_updated(document)
            .ok_or_else(|| SyncError::MissingUpdated { id: id.to_string() })
    }

    /// Fetch detail for one document. A document missing on the remote is
    /// recorded and skipped; any other failure aborts the run.
    pub fn fetch_detail(&mut self, id: &str, document: &RawDocument) -> SyncResult<DetailFetch> {
        match self
            .services
            .remote
            .fetch_detail(&self.space_key, id, document)
        {
            Ok(detail) => Ok(DetailFetch::Ready(detail)),
            Err(SyncError::NotFound { id }) => {
                tracing::error!(space = %self.space_key, id = %id, "document detail not found on remote, skipping");
                self.stats.with_error += 1;
                self.stats
                    .add_error_message(format!("Detail for document {id} not found"));
                Ok(DetailFetch::Skip)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue the index writes of one document and count it as updated.
    pub fn index_document(
        &mut self,
        batch: &mut Batch,
        document: &RawDocument,
        detail: Option<&RawDocument>,
    ) -> SyncResult<()> {
        self.services
            .writer
            .write_index_ops(batch, &self.space_key, document, detail)?;
        self.stats.updated += 1;
        Ok(())
    }

    /// Commit update writes. A partially failed bulk request is reconciled
    /// against the optimistic `updated` counter and does not abort the run.
    pub fn commit_batch(&mut self, batch: Batch) -> SyncResult<()> {
        match self.services.integration.commit_batch(batch) {
            Ok(()) => Ok(()),
            Err(SyncError::PartialFailure { count }) => {
                tracing::warn!(space = %self.space_key, failed = count, "bulk request partially failed");
                self.stats.record_partial_failure(count as u64);
                self.stats
                    .add_error_message(format!("{count} index operations failed"));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commit deletions; failed deletes only count as errors.
    fn commit_delete_batch(&mut self, batch: Batch) -> SyncResult<()> {
        match self.services.integration.commit_batch(batch) {
            Ok(()) => Ok(()),
            Err(SyncError::PartialFailure { count }) => {
                tracing::warn!(space = %self.space_key, failed = count, "bulk delete partially failed");
                self.stats.with_error += count as u64;
                self.stats
                    .add_error_message(format!("{count} delete operations failed"));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn count_deleted(&mut self, hit: &Hit) {
        match self.services.writer.classify(hit) {
            RecordKind::Primary => self.stats.deleted += 1,
            RecordKind::Secondary => self.stats.deleted_secondary += 1,
        }
    }

    /// Queue deletion of every record belonging to the remote document `id`.
    /// Returns the number of delete operations added to `batch`.
    pub fn prepare_delete_by_id(&mut self, batch: &mut Batch, id: &str) -> SyncResult<usize> {
        let integration = self.integration();
        let query = self.services.writer.records_by_id(&self.space_key, id);
        let mut scroll = integration.scroll(&query, DELETE_PAGE_SIZE)?;
        let mut queued = 0;
        loop {
            self.check_cancelled()?;
            let hits = scroll.next_page()?;
            if hits.is_empty() {
                break;
            }
            for hit in &hits {
                batch.delete(hit.record_id.clone());
                self.count_deleted(hit);
                queued += 1;
            }
        }
        tracing::debug!(space = %self.space_key, id = %id, records = queued, "queued delete of remotely deleted document");
        Ok(queued)
    }

    /// Delete every record of the space that was not written at or after
    /// `boundary`. Only meaningful after a full update.
    pub fn process_delete(&mut self, boundary: DateTime<Utc>) -> SyncResult<()> {
        self.check_cancelled()?;
        let integration = self.integration();
        integration.refresh_index()?;
        let query = self.services.writer.stale_records(&self.space_key, boundary);
        let mut scroll = integration.scroll(&query, DELETE_PAGE_SIZE)?;
        loop {
            self.check_cancelled()?;
            let hits = scroll.next_page()?;
            if hits.is_empty() {
                break;
            }
            let mut batch = integration.begin_batch();
            for hit in &hits {
                batch.delete(hit.record_id.clone());
                self.count_deleted(hit);
            }
            self.commit_delete_batch(batch)?;
            self.publish();
        }
        tracing::debug!(
            space = %self.space_key,
            deleted = self.stats.deleted,
            deleted_secondary = self.stats.deleted_secondary,
            "delete sweep finished"
        );
        Ok(())
    }
}

/// A single synchronization run of one space.
pub struct SyncJob {
    ctx: JobContext,
    strategy: Box<dyn UpdateStrategy>,
    listener: Arc<dyn JobListener>,
}

impl SyncJob {
    pub fn new(
        space_key: SpaceKey,
        full_update: bool,
        services: SyncServices,
        strategy: Box<dyn UpdateStrategy>,
        listener: Arc<dyn JobListener>,
    ) -> Self {
        let stats = RunStats::new(space_key.clone(), full_update);
        let slot = Arc::new(StatsSlot::new(stats.clone()));
        Self {
            ctx: JobContext {
                space_key,
                services,
                stats,
                cancel: CancelToken::new(),
                slot,
            },
            strategy,
            listener,
        }
    }

    pub fn space_key(&self) -> &SpaceKey {
        &self.ctx.space_key
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.ctx.cancel.clone()
    }

    pub fn stats_slot(&self) -> Arc<StatsSlot> {
        Arc::clone(&self.ctx.slot)
    }

    /// Run the job to completion. Never fails: the outcome is in the returned
    /// statistics, which the listener has already received.
    pub fn run(self) -> RunStats {
        let SyncJob {
            mut ctx,
            mut strategy,
            listener,
        } = self;

        ctx.stats.mark_running();
        ctx.publish();
        let started = ctx.stats.start_time;
        tracing::info!(
            space = %ctx.space_key,
            strategy = strategy.name(),
            full_update = ctx.stats.full_update,
            "sync job started"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> SyncResult<()> {
            strategy.process_update(&mut ctx)?;
            if ctx.stats.full_update {
                ctx.process_delete(started)?;
            }
            Ok(())
        }));

        let succeeded = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                if e.is_operational() {
                    tracing::warn!(space = %ctx.space_key, error = %e, "sync job failed");
                } else {
                    tracing::error!(space = %ctx.space_key, error = ?e, "sync job failed");
                }
                ctx.stats.add_error_message(e.to_string());
                false
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(space = %ctx.space_key, panic = %message, "sync job panicked");
                ctx.stats.add_error_message(format!("panic: {message}"));
                false
            }
        };

        ctx.stats.finish(succeeded);
        ctx.publish();
        tracing::info!(
            space = %ctx.space_key,
            succeeded,
            full_update = ctx.stats.full_update,
            updated = ctx.stats.updated,
            deleted = ctx.stats.deleted,
            deleted_secondary = ctx.stats.deleted_secondary,
            with_error = ctx.stats.with_error,
            elapsed_ms = ctx.stats.elapsed_ms,
            "sync job finished"
        );

        let stats = ctx.stats;
        listener.job_finished(stats.clone());
        stats
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
