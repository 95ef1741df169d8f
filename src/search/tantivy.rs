use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tantivy::collector::{DocSetCollector, TopDocs};
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, RangeQuery, TermQuery};
use tantivy::schema::*;
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term,
    doc,
};

use crate::error::{SyncError, SyncResult};
use crate::model::{Hit, IndexOp, IndexRecord, RecordKind, RecordQuery, SpaceKey};
use crate::ports::HitScroll;

const SCHEMA_VERSION: &str = "v1";

// Bump this when schema/tokenizer changes. Used to trigger rebuilds.
pub const SCHEMA_HASH: &str = "space-index-v1-synced-at";

const WRITER_HEAP_BYTES: usize = 50_000_000;
const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Copy)]
pub struct Fields {
    pub record_id: Field,
    pub space_key: Field,
    pub remote_id: Field,
    pub kind: Field,
    pub updated_at: Field,
    pub synced_at: Field,
    pub title: Field,
    pub content: Field,
    pub preview: Field,
}

/// One full-text search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record_id: String,
    pub space_key: String,
    pub kind: String,
    pub title: Option<String>,
    pub preview: String,
    pub score: f32,
}

/// The tantivy index holding the records of every space.
///
/// Writes are serialized through one writer; each [`SpaceIndex::apply`] call
/// commits on its own so a batch is never half-visible after a crash. An index
/// opened with [`SpaceIndex::open_reader`] has no writer and does not take the
/// directory lock, so it can search while the service is writing.
pub struct SpaceIndex {
    index: Index,
    writer: Option<Mutex<IndexWriter>>,
    reader: IndexReader,
    fields: Fields,
}

impl SpaceIndex {
    pub fn open_or_create(path: &Path) -> SyncResult<Self> {
        let schema = build_schema();
        std::fs::create_dir_all(path)?;

        let meta_path = path.join("schema_hash.json");
        let mut needs_rebuild = true;
        if meta_path.exists() {
            let meta = std::fs::read_to_string(&meta_path)?;
            if meta.contains(SCHEMA_HASH) {
                needs_rebuild = false;
            }
        }

        if needs_rebuild {
            tracing::info!(path = %path.display(), "creating search index");
            // Recreate index directory completely to avoid stale lock files.
            let _ = std::fs::remove_dir_all(path);
            std::fs::create_dir_all(path)?;
        }

        let index = if path.join("meta.json").exists() && !needs_rebuild {
            Index::open_in_dir(path)?
        } else {
            Index::create_in_dir(path, schema.clone())?
        };

        std::fs::write(
            &meta_path,
            format!("{{\"schema_hash\":\"{}\"}}", SCHEMA_HASH),
        )?;

        Self::from_index(index, &schema, true)
    }

    /// Open an existing index for searching only. `None` when there is no
    /// index at `path` yet, or it was built with another schema.
    pub fn open_reader(path: &Path) -> SyncResult<Option<Self>> {
        let meta_path = path.join("schema_hash.json");
        if !meta_path.exists() || !path.join("meta.json").exists() {
            return Ok(None);
        }
        if !std::fs::read_to_string(&meta_path)?.contains(SCHEMA_HASH) {
            tracing::debug!(path = %path.display(), "index schema outdated, not reading it");
            return Ok(None);
        }
        let index = Index::open_in_dir(path)?;
        Self::from_index(index, &build_schema(), false).map(Some)
    }

    pub fn create_in_ram() -> SyncResult<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::from_index(index, &schema, true)
    }

    fn from_index(mut index: Index, schema: &Schema, writable: bool) -> SyncResult<Self> {
        ensure_tokenizer(&mut index);
        let writer = if writable {
            Some(Mutex::new(index.writer(WRITER_HEAP_BYTES)?))
        } else {
            None
        };
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            writer,
            reader,
            fields: fields_from_schema(schema)?,
        })
    }

    /// Apply `ops` in order and commit. Upserts are stamped with
    /// `synced_at`. Returns how many operations could not be applied.
    pub fn apply(&self, ops: &[IndexOp], synced_at: DateTime<Utc>) -> SyncResult<usize> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| SyncError::Config("search index was opened read-only".into()))?;
        let mut writer = writer.lock();
        let mut failed = 0usize;
        for op in ops {
            match op {
                IndexOp::Upsert(record) => {
                    writer.delete_term(self.id_term(&record.record_id));
                    if let Err(e) = writer.add_document(self.to_document(record, synced_at)) {
                        tracing::warn!(record = %record.record_id, error = %e, "failed to index record");
                        failed += 1;
                    }
                }
                IndexOp::Delete { record_id } => {
                    writer.delete_term(self.id_term(record_id));
                }
            }
        }
        writer.commit()?;
        Ok(failed)
    }

    /// Make committed writes visible to searches and scrolls.
    pub fn refresh(&self) -> SyncResult<()> {
        self.reader.reload()?;
        Ok(())
    }

    pub fn num_records(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Point-in-time scroll over the records matching `query`.
    pub fn scroll(&self, query: &RecordQuery, page_size: usize) -> SyncResult<TantivyScroll> {
        let searcher = self.reader.searcher();
        let mut addresses: Vec<DocAddress> = searcher
            .search(self.record_query(query).as_ref(), &DocSetCollector)?
            .into_iter()
            .collect();
        addresses.sort();
        Ok(TantivyScroll {
            searcher,
            fields: self.fields,
            filter: query.clone(),
            addresses,
            position: 0,
            page_size: page_size.max(1),
        })
    }

    /// Full-text search over titles and content, optionally within one space.
    pub fn search(
        &self,
        text: &str,
        space: Option<&SpaceKey>,
        limit: usize,
    ) -> SyncResult<Vec<SearchHit>> {
        self.refresh()?;
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.fields.title, self.fields.content]);
        let (parsed, errors) = parser.parse_query_lenient(text);
        if !errors.is_empty() {
            tracing::debug!(query = text, errors = errors.len(), "query parsed leniently");
        }
        let query: Box<dyn Query> = match space {
            Some(key) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, parsed),
                (Occur::Must, self.term_query(self.fields.space_key, key.as_str())),
            ])),
            None => parsed,
        };

        let top = searcher.search(query.as_ref(), &TopDocs::with_limit(limit.max(1)))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(SearchHit {
                record_id: text_of(&doc, self.fields.record_id).unwrap_or_default(),
                space_key: text_of(&doc, self.fields.space_key).unwrap_or_default(),
                kind: text_of(&doc, self.fields.kind).unwrap_or_default(),
                title: text_of(&doc, self.fields.title),
                preview: text_of(&doc, self.fields.preview).unwrap_or_default(),
                score,
            });
        }
        Ok(hits)
    }

    fn id_term(&self, record_id: &str) -> Term {
        Term::from_field_text(self.fields.record_id, record_id)
    }

    fn term_query(&self, field: Field, value: &str) -> Box<dyn Query> {
        Box::new(TermQuery::new(
            Term::from_field_text(field, value),
            IndexRecordOption::Basic,
        ))
    }

    fn record_query(&self, query: &RecordQuery) -> Box<dyn Query> {
        let space = self.term_query(self.fields.space_key, query.space_key().as_str());
        match query {
            RecordQuery::StaleSince { boundary, .. } => {
                let written_before = RangeQuery::new(
                    Bound::Unbounded,
                    Bound::Excluded(Term::from_field_i64(
                        self.fields.synced_at,
                        boundary.timestamp_millis(),
                    )),
                );
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, space),
                    (Occur::Must, Box::new(written_before)),
                ]))
            }
            RecordQuery::ByRemoteId { remote_id, .. } => Box::new(BooleanQuery::new(vec![
                (Occur::Must, space),
                (Occur::Must, self.term_query(self.fields.remote_id, remote_id)),
            ])),
        }
    }

    fn to_document(&self, record: &IndexRecord, synced_at: DateTime<Utc>) -> TantivyDocument {
        let f = &self.fields;
        let mut d = doc! {
            f.record_id => record.record_id.clone(),
            f.space_key => record.space_key.as_str(),
            f.remote_id => record.remote_id.clone(),
            f.kind => record.kind.as_str(),
            f.synced_at => synced_at.timestamp_millis(),
            f.content => record.content.clone(),
            f.preview => build_preview(&record.content, PREVIEW_CHARS),
        };
        if let Some(updated) = record.updated_at {
            d.add_i64(f.updated_at, updated.timestamp_millis());
        }
        if let Some(title) = &record.title {
            d.add_text(f.title, title);
        }
        d
    }
}

/// Scroll over a searcher snapshot taken when the scroll was opened.
pub struct TantivyScroll {
    searcher: Searcher,
    fields: Fields,
    filter: RecordQuery,
    addresses: Vec<DocAddress>,
    position: usize,
    page_size: usize,
}

impl TantivyScroll {
    fn hit_at(&self, address: DocAddress) -> SyncResult<Option<Hit>> {
        let doc: TantivyDocument = self.searcher.doc(address)?;
        let f = &self.fields;
        let (Some(record_id), Some(space_key), Some(synced)) = (
            text_of(&doc, f.record_id),
            text_of(&doc, f.space_key),
            doc.get_first(f.synced_at).and_then(|v| v.as_i64()),
        ) else {
            return Ok(None);
        };
        let synced_at = DateTime::from_timestamp_millis(synced).ok_or_else(|| {
            SyncError::Config(format!("record {record_id} has invalid synced_at {synced}"))
        })?;
        Ok(Some(Hit {
            remote_id: text_of(&doc, f.remote_id).unwrap_or_default(),
            kind: text_of(&doc, f.kind)
                .and_then(|k| RecordKind::parse(&k))
                .unwrap_or(RecordKind::Primary),
            record_id,
            space_key: SpaceKey::new(space_key),
            synced_at,
        }))
    }
}

impl HitScroll for TantivyScroll {
    fn next_page(&mut self) -> SyncResult<Vec<Hit>> {
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size && self.position < self.addresses.len() {
            let address = self.addresses[self.position];
            self.position += 1;
            if let Some(hit) = self.hit_at(address)?
                && self.filter.matches(&hit)
            {
                page.push(hit);
            }
        }
        Ok(page)
    }
}

fn text_of(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    let text = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("hyphen_normalize")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let text_not_stored = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("hyphen_normalize")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );

    schema_builder.add_text_field("record_id", STRING | STORED);
    schema_builder.add_text_field("space_key", STRING | STORED);
    schema_builder.add_text_field("remote_id", STRING | STORED);
    schema_builder.add_text_field("kind", STRING | STORED);
    schema_builder.add_i64_field("updated_at", INDEXED | STORED | FAST);
    schema_builder.add_i64_field("synced_at", INDEXED | STORED | FAST);
    schema_builder.add_text_field("title", text);
    schema_builder.add_text_field("content", text_not_stored);
    schema_builder.add_text_field("preview", STORED);
    schema_builder.build()
}

pub fn fields_from_schema(schema: &Schema) -> SyncResult<Fields> {
    let get = |name: &str| {
        schema
            .get_field(name)
            .map_err(|_| SyncError::Config(format!("schema missing {name}")))
    };
    Ok(Fields {
        record_id: get("record_id")?,
        space_key: get("space_key")?,
        remote_id: get("remote_id")?,
        kind: get("kind")?,
        updated_at: get("updated_at")?,
        synced_at: get("synced_at")?,
        title: get("title")?,
        content: get("content")?,
        preview: get("preview")?,
    })
}

fn build_preview(content: &str, max_chars: usize) -> String {
    let char_count = content.chars().count();
    if char_count <= max_chars {
        return content.to_string();
    }
    let mut out: String = content.chars().take(max_chars).collect();
    out.push('…');
    out
}

pub fn index_dir(base: &Path) -> SyncResult<PathBuf> {
    let dir = base.join("index").join(SCHEMA_VERSION);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn ensure_tokenizer(index: &mut Index) {
    use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer};
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(RemoveLongFilter::limit(40))
        .build();
    index.tokenizers().register("hyphen_normalize", analyzer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn record(space: &str, remote_id: &str, kind: RecordKind, content: &str) -> IndexRecord {
        let record_id = match kind {
            RecordKind::Primary => format!("{space}/{remote_id}"),
            RecordKind::Secondary => format!("{space}/{remote_id}/comment/1"),
        };
        IndexRecord {
            record_id,
            space_key: SpaceKey::new(space),
            remote_id: remote_id.to_string(),
            kind,
            updated_at: None,
            title: Some(format!("Title {remote_id}")),
            content: content.to_string(),
        }
    }

    fn drain(index: &SpaceIndex, query: &RecordQuery) -> Vec<Hit> {
        let mut scroll = index.scroll(query, 2).unwrap();
        let mut all = Vec::new();
        loop {
            let page = scroll.next_page().unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            all.extend(page);
        }
        all
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_upsert_replaces_by_record_id() {
        let index = SpaceIndex::create_in_ram().unwrap();
        let ops = vec![IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "first"))];
        assert_eq!(index.apply(&ops, t0()).unwrap(), 0);
        let ops = vec![IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "second"))];
        index.apply(&ops, t0() + Duration::hours(1)).unwrap();
        index.refresh().unwrap();

        assert_eq!(index.num_records(), 1);
        let hits = index.search("second", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, "ORG/A");
        assert!(index.search("first", None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_stale_scroll_uses_synced_at_and_space() {
        let index = SpaceIndex::create_in_ram().unwrap();
        let old = vec![
            IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "a")),
            IndexOp::Upsert(record("ORG", "B", RecordKind::Primary, "b")),
            IndexOp::Upsert(record("ORG", "B", RecordKind::Secondary, "b comment")),
            IndexOp::Upsert(record("OTHER", "Z", RecordKind::Primary, "z")),
        ];
        index.apply(&old, t0()).unwrap();
        let fresh = vec![IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "a"))];
        index.apply(&fresh, t0() + Duration::hours(2)).unwrap();
        index.refresh().unwrap();

        let stale = drain(
            &index,
            &RecordQuery::StaleSince {
                space_key: SpaceKey::new("ORG"),
                boundary: t0() + Duration::hours(1),
            },
        );
        let mut ids: Vec<_> = stale.iter().map(|h| h.record_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["ORG/B", "ORG/B/comment/1"]);
        let secondary = stale.iter().find(|h| h.kind == RecordKind::Secondary).unwrap();
        assert_eq!(secondary.remote_id, "B");
        assert_eq!(secondary.synced_at, t0());
    }

    #[test]
    fn test_by_remote_id_and_delete() {
        let index = SpaceIndex::create_in_ram().unwrap();
        let ops = vec![
            IndexOp::Upsert(record("ORG", "B", RecordKind::Primary, "b")),
            IndexOp::Upsert(record("ORG", "B", RecordKind::Secondary, "comment")),
            IndexOp::Upsert(record("ORG", "C", RecordKind::Primary, "c")),
        ];
        index.apply(&ops, t0()).unwrap();
        index.refresh().unwrap();
        let query = RecordQuery::ByRemoteId {
            space_key: SpaceKey::new("ORG"),
            remote_id: "B".into(),
        };
        assert_eq!(drain(&index, &query).len(), 2);

        let deletes: Vec<_> = drain(&index, &query)
            .into_iter()
            .map(|h| IndexOp::Delete {
                record_id: h.record_id,
            })
            .collect();
        index.apply(&deletes, t0()).unwrap();
        index.refresh().unwrap();
        assert!(drain(&index, &query).is_empty());
        assert_eq!(index.num_records(), 1);
    }

    #[test]
    fn test_search_scoped_to_space() {
        let index = SpaceIndex::create_in_ram().unwrap();
        let ops = vec![
            IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "shared quarterly report")),
            IndexOp::Upsert(record("OTHER", "B", RecordKind::Primary, "quarterly numbers")),
        ];
        index.apply(&ops, t0()).unwrap();
        assert_eq!(index.search("quarterly", None, 10).unwrap().len(), 2);
        let scoped = index
            .search("quarterly", Some(&SpaceKey::new("OTHER")), 10)
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].space_key, "OTHER");
        assert_eq!(scoped[0].title.as_deref(), Some("Title B"));
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = index_dir(dir.path()).unwrap();
        {
            let index = SpaceIndex::open_or_create(&path).unwrap();
            let ops = vec![IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "a"))];
            index.apply(&ops, t0()).unwrap();
        }
        let index = SpaceIndex::open_or_create(&path).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.num_records(), 1);
    }

    #[test]
    fn test_reader_opens_while_writer_holds_lock() {
        let dir = TempDir::new().unwrap();
        let path = index_dir(dir.path()).unwrap();
        assert!(SpaceIndex::open_reader(&path).unwrap().is_none());

        let writer = SpaceIndex::open_or_create(&path).unwrap();
        let ops = vec![IndexOp::Upsert(record("ORG", "A", RecordKind::Primary, "release notes"))];
        writer.apply(&ops, t0()).unwrap();

        let reader = SpaceIndex::open_reader(&path).unwrap().unwrap();
        let hits = reader.search("release", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(reader.apply(&ops, t0()).is_err());

        let more = vec![IndexOp::Upsert(record("ORG", "B", RecordKind::Primary, "release plan"))];
        writer.apply(&more, t0()).unwrap();
        assert_eq!(reader.search("release", None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_stale_scroll_only_collects_stale_records() {
        let index = SpaceIndex::create_in_ram().unwrap();
        let boundary = t0() + Duration::milliseconds(1500);
        let old: Vec<_> = ["A", "B"]
            .iter()
            .map(|id| IndexOp::Upsert(record("ORG", id, RecordKind::Primary, "old")))
            .collect();
        index.apply(&old, t0()).unwrap();
        let fresh: Vec<_> = ["C", "D", "E"]
            .iter()
            .map(|id| IndexOp::Upsert(record("ORG", id, RecordKind::Primary, "fresh")))
            .collect();
        index.apply(&fresh, boundary).unwrap();
        index.refresh().unwrap();

        let scroll = index
            .scroll(
                &RecordQuery::StaleSince {
                    space_key: SpaceKey::new("ORG"),
                    boundary,
                },
                10,
            )
            .unwrap();
        assert_eq!(scroll.addresses.len(), 2);
    }

    #[test]
    fn test_build_preview_truncates() {
        assert_eq!(build_preview("short", 10), "short");
        assert_eq!(build_preview("abcdef", 3), "abc…");
    }
}
