//! End-to-end runs against the on-disk watermark store and tantivy index.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use space_indexer::error::SyncResult;
use space_indexer::integration::LocalIntegration;
use space_indexer::job::{JobListener, SyncJob, SyncMode, SyncServices};
use space_indexer::model::{ChangedPage, RawDocument, SpaceKey};
use space_indexer::ports::RemoteSource;
use space_indexer::search::JsonDocumentMapper;
use space_indexer::stats::RunStats;
use space_indexer::watermark::WatermarkPurpose;

/// A remote holding one space whose documents can be edited between runs.
struct FakeRemote {
    key: SpaceKey,
    page_size: usize,
    documents: Mutex<Vec<Value>>,
    requests: Mutex<Vec<(usize, Option<DateTime<Utc>>)>>,
}

impl FakeRemote {
    fn new(key: &str, page_size: usize) -> Self {
        Self {
            key: SpaceKey::new(key),
            page_size,
            documents: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn put(&self, id: &str, updated: DateTime<Utc>, body: &str) {
        let mut docs = self.documents.lock().unwrap();
        docs.retain(|d| d["id"] != id);
        docs.push(json!({
            "id": id,
            "updated": updated.to_rfc3339(),
            "title": format!("Page {id}"),
            "body": body,
        }));
    }

    fn remove(&self, id: &str) {
        self.documents.lock().unwrap().retain(|d| d["id"] != id);
    }

    fn take_requests(&self) -> Vec<(usize, Option<DateTime<Utc>>)> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

fn updated_of(doc: &Value) -> DateTime<Utc> {
    doc["updated"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap()
}

impl RemoteSource for FakeRemote {
    fn list_spaces(&self) -> SyncResult<Vec<SpaceKey>> {
        Ok(vec![self.key.clone()])
    }

    fn fetch_page(
        &self,
        key: &SpaceKey,
        offset: usize,
        updated_after: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangedPage> {
        self.requests.lock().unwrap().push((offset, updated_after));
        if key != &self.key {
            return Ok(ChangedPage::empty());
        }
        let mut matching: Vec<Value> = self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|d| updated_after.is_none_or(|after| updated_of(d) >= after))
            .cloned()
            .collect();
        matching.sort_by_key(updated_of);
        let total = matching.len();
        let documents = matching
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .collect();
        Ok(ChangedPage::new(documents, offset, Some(total)))
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
struct Collect(Mutex<Vec<RunStats>>);

impl JobListener for Collect {
    fn job_finished(&self, stats: RunStats) {
        self.0.lock().unwrap().push(stats);
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

struct Harness {
    _dir: TempDir,
    integration: Arc<LocalIntegration>,
    remote: Arc<FakeRemote>,
    key: SpaceKey,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::new("DOCS", 2));
        let integration = Arc::new(LocalIntegration::open(dir.path(), remote.clone()).unwrap());
        Self {
            _dir: dir,
            integration,
            remote,
            key: SpaceKey::new("DOCS"),
        }
    }

    fn run(&self, full_update: bool) -> RunStats {
        let services = SyncServices::new(
            self.integration.clone(),
            self.remote.clone(),
            Arc::new(JsonDocumentMapper::default()),
        );
        let listener = Arc::new(Collect::default());
        let job = SyncJob::new(
            self.key.clone(),
            full_update,
            services,
            SyncMode::Watermark.build_strategy(10),
            listener.clone(),
        );
        let stats = job.run();
        assert_eq!(listener.0.lock().unwrap().len(), 1);
        stats
    }

    fn records(&self) -> u64 {
        self.integration.index().refresh().unwrap();
        self.integration.index().num_records()
    }

    fn cursor(&self) -> Option<DateTime<Utc>> {
        self.integration
            .store()
            .read(&self.key, WatermarkPurpose::LastDocumentUpdate)
            .unwrap()
    }
}

#[test]
fn full_update_indexes_everything_and_sweeps_removed_documents() {
    let h = Harness::new();
    h.remote.put("1", at(8), "alpha release notes");
    h.remote.put("2", at(9), "beta planning");
    h.remote.put("3", at(10), "gamma retrospective");

    let first = h.run(true);
    assert!(first.succeeded(), "{:?}", first.error_message);
    // Document 2 sits on the page boundary and is seen twice.
    assert!(first.updated >= 3);
    assert_eq!(h.records(), 3);
    assert_eq!(h.cursor(), Some(at(10)));

    h.remote.remove("2");
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = h.run(true);
    assert!(second.succeeded());
    assert_eq!(second.updated, 2);
    assert_eq!(second.deleted, 1);
    assert_eq!(h.records(), 2);

    let hits = h.integration.index().search("planning", None, 10).unwrap();
    assert!(hits.is_empty());
    let hits = h
        .integration
        .index()
        .search("retrospective", Some(&h.key), 10)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record_id, "DOCS/3");
}

#[test]
fn incremental_update_resumes_from_cursor() {
    let h = Harness::new();
    h.remote.put("1", at(8), "first");
    h.remote.put("2", at(9), "second");

    let initial = h.run(false);
    assert!(initial.full_update, "missing cursor promotes to a full update");
    assert_eq!(h.cursor(), Some(at(9)));
    h.remote.take_requests();

    h.remote.put("2", at(11), "second edited");
    h.remote.put("3", at(12), "third");
    let incremental = h.run(false);
    assert!(incremental.succeeded());
    assert!(!incremental.full_update);
    assert_eq!(incremental.updated, 2);
    assert_eq!(incremental.deleted, 0);
    assert_eq!(h.cursor(), Some(at(12)));

    let requests = h.remote.take_requests();
    assert_eq!(requests.first(), Some(&(0, Some(at(9)))));
    assert_eq!(h.records(), 3);
    let hits = h.integration.index().search("edited", None, 10).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn index_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(FakeRemote::new("DOCS", 5));
    remote.put("1", at(8), "persistent content");
    {
        let integration = Arc::new(LocalIntegration::open(dir.path(), remote.clone()).unwrap());
        let services = SyncServices::new(
            integration.clone(),
            remote.clone(),
            Arc::new(JsonDocumentMapper::default()),
        );
        let stats = SyncJob::new(
            SpaceKey::new("DOCS"),
            true,
            services,
            SyncMode::Paginating.build_strategy(10),
            Arc::new(Collect::default()),
        )
        .run();
        assert!(stats.succeeded());
    }

    let reopened = LocalIntegration::open(dir.path(), remote).unwrap();
    assert_eq!(reopened.index().num_records(), 1);
    assert!(
        reopened
            .store()
            .read(&SpaceKey::new("DOCS"), WatermarkPurpose::LastFullUpdate)
            .unwrap()
            .is_none(),
        "only the coordinator records full-update completion"
    );
}
