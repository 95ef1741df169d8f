//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{SyncError, SyncResult};
use crate::job::{JobListener, SyncServices};
use crate::model::{
    Batch, ChangedPage, Hit, IndexOp, RawDocument, RecordKind, RecordQuery, SpaceKey,
};
use crate::ports::{HitScroll, Integration, RemoteSource};
use crate::search::JsonDocumentMapper;
use crate::search::mapper::parse_timestamp;
use crate::stats::RunStats;
use crate::watermark::WatermarkPurpose;

#[derive(Debug, Clone)]
struct StoredRecord {
    space_key: SpaceKey,
    remote_id: String,
    kind: RecordKind,
    synced_at: DateTime<Utc>,
}

/// Watermarks and index records held in maps.
#[derive(Default)]
pub struct MemoryIntegration {
    watermarks: Mutex<HashMap<(SpaceKey, WatermarkPurpose), DateTime<Utc>>>,
    records: Mutex<BTreeMap<String, StoredRecord>>,
    spaces: Mutex<Vec<SpaceKey>>,
    failures: Mutex<Vec<usize>>,
    listing_failures: AtomicUsize,
    shutdown: AtomicBool,
    refreshes: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryIntegration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_spaces(&self, keys: &[&str]) {
        *self.spaces.lock() = keys.iter().map(|k| SpaceKey::new(*k)).collect();
    }

    /// Make the next `count` space listings fail with a transport error.
    pub fn fail_space_keys(&self, count: usize) {
        self.listing_failures.store(count, Ordering::SeqCst);
    }

    pub fn pending_listing_failures(&self) -> usize {
        self.listing_failures.load(Ordering::SeqCst)
    }

    pub fn set_watermark(&self, space: &str, purpose: WatermarkPurpose, value: DateTime<Utc>) {
        self.watermarks
            .lock()
            .insert((SpaceKey::new(space), purpose), value);
    }

    pub fn watermark(&self, space: &str, purpose: WatermarkPurpose) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .get(&(SpaceKey::new(space), purpose))
            .copied()
    }

    pub fn seed_record(
        &self,
        space: &str,
        remote_id: &str,
        kind: RecordKind,
        synced_at: DateTime<Utc>,
    ) {
        self.records.lock().insert(
            format!("{space}/{remote_id}"),
            StoredRecord {
                space_key: SpaceKey::new(space),
                remote_id: remote_id.to_string(),
                kind,
                synced_at,
            },
        );
    }

    pub fn seed_comment(&self, space: &str, parent: &str, comment: &str, synced_at: DateTime<Utc>) {
        self.records.lock().insert(
            format!("{space}/{parent}/comment/{comment}"),
            StoredRecord {
                space_key: SpaceKey::new(space),
                remote_id: parent.to_string(),
                kind: RecordKind::Secondary,
                synced_at,
            },
        );
    }

    /// Record ids of one space, sorted.
    pub fn record_ids(&self, space: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(_, r)| r.space_key.as_str() == space)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The next commit drops its last `count` index operations.
    pub fn fail_next_commit(&self, count: usize) {
        self.failures.lock().push(count);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl Integration for MemoryIntegration {
    fn space_keys(&self) -> SyncResult<Vec<SpaceKey>> {
        let failing = self
            .listing_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Transport("space listing unavailable".into()));
        }
        Ok(self.spaces.lock().clone())
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn read_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.watermarks.lock().get(&(key.clone(), purpose)).copied())
    }

    fn write_watermark(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
        value: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.watermarks.lock().insert((key.clone(), purpose), value);
        Ok(())
    }

    fn delete_watermark(&self, key: &SpaceKey, purpose: WatermarkPurpose) -> SyncResult<bool> {
        Ok(self.watermarks.lock().remove(&(key.clone(), purpose)).is_some())
    }

    fn commit_batch(&self, batch: Batch) -> SyncResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let (ops, watermarks) = batch.into_parts();
        let failed = {
            let mut failures = self.failures.lock();
            if failures.is_empty() {
                0
            } else {
                failures.remove(0).min(ops.len())
            }
        };

        let now = Utc::now();
        let applied = ops.len() - failed;
        {
            let mut records = self.records.lock();
            for op in ops.into_iter().take(applied) {
                match op {
                    IndexOp::Upsert(record) => {
                        records.insert(
                            record.record_id,
                            StoredRecord {
                                space_key: record.space_key,
                                remote_id: record.remote_id,
                                kind: record.kind,
                                synced_at: now,
                            },
                        );
                    }
                    IndexOp::Delete { record_id } => {
                        records.remove(&record_id);
                    }
                }
            }
        }
        {
            let mut stored = self.watermarks.lock();
            for mark in watermarks {
                stored.insert((mark.space_key, mark.purpose), mark.value);
            }
        }

        if failed > 0 {
            return Err(SyncError::PartialFailure { count: failed });
        }
        Ok(())
    }

    fn refresh_index(&self) -> SyncResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scroll<'a>(
        &'a self,
        query: &RecordQuery,
        page_size: usize,
    ) -> SyncResult<Box<dyn HitScroll + 'a>> {
        let hits = self
            .records
            .lock()
            .iter()
            .map(|(id, r)| Hit {
                record_id: id.clone(),
                space_key: r.space_key.clone(),
                remote_id: r.remote_id.clone(),
                kind: r.kind,
                synced_at: r.synced_at,
            })
            .filter(|hit| query.matches(hit))
            .collect();
        Ok(Box::new(SnapshotScroll {
            hits,
            page_size: page_size.max(1),
        }))
    }
}

struct SnapshotScroll {
    hits: Vec<Hit>,
    page_size: usize,
}

impl HitScroll for SnapshotScroll {
    fn next_page(&mut self) -> SyncResult<Vec<Hit>> {
        let take = self.page_size.min(self.hits.len());
        Ok(self.hits.drain(..take).collect())
    }
}

type RequestKey = (SpaceKey, usize, Option<DateTime<Utc>>);

enum Scripted {
    Page(ChangedPage),
    Fail,
}

/// Remote answering from pages registered per `(space, offset, after)`.
/// Unscripted requests get an empty page.
#[derive(Default)]
pub struct ScriptedRemote {
    pages: Mutex<HashMap<RequestKey, Scripted>>,
    missing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<RequestKey>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        &self,
        space: &str,
        offset: usize,
        after: Option<DateTime<Utc>>,
        page: ChangedPage,
    ) {
        self.pages
            .lock()
            .insert((SpaceKey::new(space), offset, after), Scripted::Page(page));
    }

    pub fn fail_request(&self, space: &str, offset: usize, after: Option<DateTime<Utc>>) {
        self.pages
            .lock()
            .insert((SpaceKey::new(space), offset, after), Scripted::Fail);
    }

    /// Detail requests for `id` answer "not found".
    pub fn mark_missing(&self, id: &str) {
        self.missing.lock().insert(id.to_string());
    }

    pub fn requests(&self) -> Vec<RequestKey> {
        self.requests.lock().clone()
    }
}

impl RemoteSource for ScriptedRemote {
    fn list_spaces(&self) -> SyncResult<Vec<SpaceKey>> {
        let mut keys: Vec<SpaceKey> = self.pages.lock().keys().map(|k| k.0.clone()).collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn fetch_page(
        &self,
        key: &SpaceKey,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangedPage> {
        let request = (key.clone(), offset, updated_after);
        self.requests.lock().push(request.clone());
        match self.pages.lock().get(&request) {
            Some(Scripted::Page(page)) => Ok(page.clone()),
            Some(Scripted::Fail) => Err(SyncError::Remote {
                status: 503,
                message: "service unavailable".into(),
            }),
            None => Ok(ChangedPage::empty()),
        }
    }

    fn fetch_detail(
        &self,
        _key: &SpaceKey,
        id: &str,
        _document: &RawDocument,
    ) -> SyncResult<Option<RawDocument>> {
        if self.missing.lock().contains(id) {
            return Err(SyncError::NotFound { id: id.to_string() });
        }
        Ok(None)
    }
}

/// Remote serving a mutable document set the way a cursor-capable server
/// does: inclusive `updated_after` filter, ascending update order, fixed
/// page size.
pub struct DatasetRemote {
    documents: Mutex<Vec<RawDocument>>,
    requests: Mutex<Vec<RequestKey>>,
    page_size: usize,
    report_total: bool,
    listings: AtomicUsize,
}

impl DatasetRemote {
    pub fn new(page_size: usize, report_total: bool) -> Self {
        Self {
            documents: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            listings: AtomicUsize::new(0),
            page_size,
            report_total,
        }
    }

    pub fn push(&self, document: RawDocument) {
        self.documents.lock().push(document);
    }

    pub fn requests(&self) -> Vec<RequestKey> {
        self.requests.lock().clone()
    }

    /// Number of unpaged complete-listing requests.
    pub fn all_requests(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

fn updated_of(document: &RawDocument) -> Option<DateTime<Utc>> {
    document.get("updated").and_then(parse_timestamp)
}

impl RemoteSource for DatasetRemote {
    fn list_spaces(&self) -> SyncResult<Vec<SpaceKey>> {
        Ok(vec![SpaceKey::new("ORG")])
    }

    fn fetch_page(
        &self,
        key: &SpaceKey,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangedPage> {
        self.requests
            .lock()
            .push((key.clone(), offset, updated_after));
        let mut matching: Vec<RawDocument> = self
            .documents
            .lock()
            .iter()
            .filter(|d| match (updated_after, updated_of(d)) {
                (Some(after), Some(updated)) => updated >= after,
                _ => true,
            })
            .cloned()
            .collect();
        matching.sort_by_key(updated_of);
        let total = self.report_total.then_some(matching.len());
        let documents = matching
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .collect();
        Ok(ChangedPage::new(documents, offset, total))
    }

    fn fetch_all(&self, _key: &SpaceKey) -> SyncResult<ChangedPage> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().clone();
        documents.sort_by_key(updated_of);
        let total = self.report_total.then_some(documents.len());
        Ok(ChangedPage::new(documents, 0, total))
    }

    fn fetch_detail(
        &self,
        _key: &SpaceKey,
        _id: &str,
        _document: &RawDocument,
    ) -> SyncResult<Option<RawDocument>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct RecordingListener {
    finished: Mutex<Vec<RunStats>>,
}

impl RecordingListener {
    pub fn finished(&self) -> Vec<RunStats> {
        self.finished.lock().clone()
    }
}

impl JobListener for RecordingListener {
    fn job_finished(&self, stats: RunStats) {
        self.finished.lock().push(stats);
    }
}

/// A minimal remote document.
pub fn doc(id: &str, updated: &str) -> RawDocument {
    json!({
        "id": id,
        "updated": updated,
        "title": format!("Document {id}"),
        "body": format!("Body of {id}"),
    })
}

pub fn services<R: RemoteSource + 'static>(
    integration: &Arc<MemoryIntegration>,
    remote: &Arc<R>,
) -> SyncServices {
    SyncServices::new(
        integration.clone(),
        remote.clone(),
        Arc::new(JsonDocumentMapper::default()),
    )
}
