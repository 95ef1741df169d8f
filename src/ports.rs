//! The narrow interfaces the synchronization core talks through.
//!
//! Implementations must be safe to call from several job threads at once.

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::model::{Batch, ChangedPage, Hit, RawDocument, RecordKind, RecordQuery, SpaceKey};
use crate::watermark::WatermarkPurpose;

/// Persistence, bulk writing and lifecycle of the hosting service.
pub trait Integration: Send + Sync {
    /// Every space that should be considered for scheduling.
    fn space_keys(&self) -> SyncResult<Vec<SpaceKey>>;

    fn is_shutdown(&self) -> bool;

    fn read_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
    ) -> SyncResult<Option<DateTime<Utc>>>;

    fn write_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
        value: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Returns whether the watermark existed.
    fn delete_watermark(&self, key: &SpaceKey, purpose: WatermarkPurpose) -> SyncResult<bool>;

    fn begin_batch(&self) -> Batch {
        Batch::new()
    }

    /// Apply a batch. Watermarks carried by the batch are persisted even when
    /// some index operations fail; such failures surface as
    /// [`SyncError::PartialFailure`](crate::error::SyncError::PartialFailure).
    fn commit_batch(&self, batch: Batch) -> SyncResult<()>;

    /// Make all committed writes visible to subsequent searches.
    fn refresh_index(&self) -> SyncResult<()>;

    /// Point-in-time, paged iteration over the records matching `query`.
    fn scroll<'a>(
        &'a self,
        query: &RecordQuery,
        page_size: usize,
    ) -> SyncResult<Box<dyn HitScroll + 'a>>;
}

/// Cursor over a point-in-time search result.
pub trait HitScroll {
    /// Next page of hits; an empty page means the scroll is exhausted.
    fn next_page(&mut self) -> SyncResult<Vec<Hit>>;
}

/// Read access to one remote system holding many spaces.
pub trait RemoteSource: Send + Sync {
    /// All space keys the remote exposes.
    fn list_spaces(&self) -> SyncResult<Vec<SpaceKey>>;

    /// One page of documents of `key`, starting at `offset`, updated at or
    /// after `updated_after` when given. Cursor-capable remotes return the
    /// documents in ascending update-time order.
    fn fetch_page(
        &self,
        key: &SpaceKey,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangedPage>;

    /// Every document of `key` in one response, for remotes without
    /// server-side pagination. Sources that do page must override this so
    /// the request carries no page limit.
    fn fetch_all(&self, key: &SpaceKey) -> SyncResult<ChangedPage> {
        self.fetch_page(key, 0, None)
    }

    /// Extra detail for one document. `Ok(None)` means the page document is
    /// complete on its own; a document gone from the remote is reported as
    /// [`SyncError::NotFound`](crate::error::SyncError::NotFound).
    fn fetch_detail(
        &self,
        key: &SpaceKey,
        id: &str,
        document: &RawDocument,
    ) -> SyncResult<Option<RawDocument>>;
}

/// Turns remote documents into index writes and knows the index layout.
pub trait DocumentWriter: Send + Sync {
    fn extract_id(&self, document: &RawDocument) -> Option<String>;

    fn extract_updated(&self, document: &RawDocument) -> Option<DateTime<Utc>>;

    fn extract_deleted(&self, document: &RawDocument) -> bool;

    /// Append the write operations for one document to `batch`.
    fn write_index_ops(
        &self,
        batch: &mut Batch,
        key: &SpaceKey,
        document: &RawDocument,
        detail: Option<&RawDocument>,
    ) -> SyncResult<()>;

    fn classify(&self, hit: &Hit) -> RecordKind;

    /// Records of `key` not written at or after `boundary`.
    fn stale_records(&self, key: &SpaceKey, boundary: DateTime<Utc>) -> RecordQuery {
        RecordQuery::StaleSince {
            space_key: key.clone(),
            boundary,
        }
    }

    /// Records of `key` that belong to the remote document `remote_id`.
    fn records_by_id(&self, key: &SpaceKey, remote_id: &str) -> RecordQuery {
        RecordQuery::ByRemoteId {
            space_key: key.clone(),
            remote_id: remote_id.to_string(),
        }
    }
}
