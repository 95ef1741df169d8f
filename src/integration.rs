//! The hosting service as seen by the coordinator and its jobs: the SQLite
//! watermark store, the tantivy index, space discovery and the shutdown flag.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};
use crate::model::{Batch, RecordQuery, SpaceKey};
use crate::ports::{HitScroll, Integration, RemoteSource};
use crate::search::SpaceIndex;
use crate::search::tantivy::index_dir;
use crate::watermark::{WatermarkPurpose, WatermarkStore};

/// Watermark database file name inside the data directory.
pub const WATERMARK_DB: &str = "watermarks.db";

pub struct LocalIntegration {
    store: WatermarkStore,
    index: SpaceIndex,
    remote: Arc<dyn RemoteSource>,
    include: Vec<SpaceKey>,
    exclude: Vec<SpaceKey>,
    shutdown: Arc<AtomicBool>,
}

impl LocalIntegration {
    pub fn new(store: WatermarkStore, index: SpaceIndex, remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            store,
            index,
            remote,
            include: Vec::new(),
            exclude: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the store and index under `data_dir`.
    pub fn open(data_dir: &Path, remote: Arc<dyn RemoteSource>) -> SyncResult<Self> {
        let store = WatermarkStore::open(&data_dir.join(WATERMARK_DB))?;
        let index = SpaceIndex::open_or_create(&index_dir(data_dir)?)?;
        Ok(Self::new(store, index, remote))
    }

    /// Explicit spaces to index; when empty, spaces are discovered from the
    /// remote and `exclude` is applied.
    pub fn with_spaces(mut self, include: Vec<SpaceKey>, exclude: Vec<SpaceKey>) -> Self {
        self.include = include;
        self.exclude = exclude;
        self
    }

    pub fn index(&self) -> &SpaceIndex {
        &self.index
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

impl Integration for LocalIntegration {
    fn space_keys(&self) -> SyncResult<Vec<SpaceKey>> {
        if !self.include.is_empty() {
            return Ok(self.include.clone());
        }
        let mut keys = self.remote.list_spaces()?;
        keys.retain(|k| !self.exclude.contains(k));
        Ok(keys)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn read_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        self.store.read(key, purpose)
    }

    fn write_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
        value: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.store.write(key, purpose, value)
    }

    fn delete_watermark(&self, key: &SpaceKey, purpose: WatermarkPurpose) -> SyncResult<bool> {
        self.store.delete(key, purpose)
    }

    fn commit_batch(&self, batch: Batch) -> SyncResult<()> {
        let (ops, watermarks) = batch.into_parts();
        let failed = if ops.is_empty() {
            0
        } else {
            self.index.apply(&ops, Utc::now())?
        };
        if !watermarks.is_empty() {
            self.store.write_all(&watermarks)?;
        }
        if failed > 0 {
            return Err(SyncError::PartialFailure { count: failed });
        }
        Ok(())
    }

    fn refresh_index(&self) -> SyncResult<()> {
        self.index.refresh()
    }

    fn scroll<'a>(
        &'a self,
        query: &RecordQuery,
        page_size: usize,
    ) -> SyncResult<Box<dyn HitScroll + 'a>> {
        Ok(Box::new(self.index.scroll(query, page_size)?))
    }
}
