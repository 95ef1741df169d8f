//! Maps raw remote JSON documents onto index records.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::model::{Batch, Hit, IndexRecord, RawDocument, RecordKind, SpaceKey};
use crate::ports::DocumentWriter;

/// How comments attached to a document end up in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentMode {
    /// Comments are not indexed.
    None,
    /// Comment bodies are appended to the document content.
    #[default]
    Embedded,
    /// Every comment becomes its own secondary record.
    Standalone,
}

/// Dot-separated JSON paths locating the interesting fields of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub id: String,
    pub updated: String,
    pub deleted: Option<String>,
    pub title: String,
    pub content: Vec<String>,
    pub comments: Option<String>,
    pub comment_id: String,
    pub comment_body: String,
    pub comment_updated: String,
    pub comment_mode: CommentMode,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            id: "id".into(),
            updated: "updated".into(),
            deleted: Some("deleted".into()),
            title: "title".into(),
            content: vec!["body".into()],
            comments: Some("comments".into()),
            comment_id: "id".into(),
            comment_body: "body".into(),
            comment_updated: "updated".into(),
            comment_mode: CommentMode::Embedded,
        }
    }
}

pub struct JsonDocumentMapper {
    config: MappingConfig,
}

impl Default for JsonDocumentMapper {
    fn default() -> Self {
        Self::new(MappingConfig::default())
    }
}

impl JsonDocumentMapper {
    pub fn new(config: MappingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    fn content_of(&self, document: &Value) -> String {
        let mut parts = Vec::new();
        for path in &self.config.content {
            if let Some(value) = lookup(document, path) {
                collect_text(value, &mut parts);
            }
        }
        parts.join("\n")
    }

    fn comments_of<'a>(&self, document: &'a Value) -> &'a [Value] {
        self.config
            .comments
            .as_deref()
            .and_then(|path| lookup(document, path))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl DocumentWriter for JsonDocumentMapper {
    fn extract_id(&self, document: &RawDocument) -> Option<String> {
        lookup(document, &self.config.id).and_then(scalar_to_string)
    }

    fn extract_updated(&self, document: &RawDocument) -> Option<DateTime<Utc>> {
        lookup(document, &self.config.updated).and_then(parse_timestamp)
    }

    fn extract_deleted(&self, document: &RawDocument) -> bool {
        let Some(path) = self.config.deleted.as_deref() else {
            return false;
        };
        match lookup(document, path) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    fn write_index_ops(
        &self,
        batch: &mut Batch,
        key: &SpaceKey,
        document: &RawDocument,
        detail: Option<&RawDocument>,
    ) -> SyncResult<()> {
        let merged;
        let document = match detail {
            Some(detail) => {
                merged = merge_detail(document, detail);
                &merged
            }
            None => document,
        };

        let id = self
            .extract_id(document)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SyncError::MissingId {
                space: key.to_string(),
            })?;
        let record_id = format!("{key}/{id}");
        let mut content = self.content_of(document);
        let comments = self.comments_of(document);

        match self.config.comment_mode {
            CommentMode::None => {}
            CommentMode::Embedded => {
                for comment in comments {
                    if let Some(body) = lookup(comment, &self.config.comment_body) {
                        let mut parts = Vec::new();
                        collect_text(body, &mut parts);
                        for part in parts {
                            if !content.is_empty() {
                                content.push('\n');
                            }
                            content.push_str(&part);
                        }
                    }
                }
            }
            CommentMode::Standalone => {
                for (idx, comment) in comments.iter().enumerate() {
                    // Comments without an id fall back to their position.
                    let comment_id = lookup(comment, &self.config.comment_id)
                        .and_then(scalar_to_string)
                        .unwrap_or_else(|| idx.to_string());
                    let mut parts = Vec::new();
                    if let Some(body) = lookup(comment, &self.config.comment_body) {
                        collect_text(body, &mut parts);
                    }
                    batch.upsert(IndexRecord {
                        record_id: format!("{record_id}/comment/{comment_id}"),
                        space_key: key.clone(),
                        remote_id: id.clone(),
                        kind: RecordKind::Secondary,
                        updated_at: lookup(comment, &self.config.comment_updated)
                            .and_then(parse_timestamp),
                        title: None,
                        content: parts.join("\n"),
                    });
                }
            }
        }

        batch.upsert(IndexRecord {
            record_id,
            space_key: key.clone(),
            remote_id: id,
            kind: RecordKind::Primary,
            updated_at: self.extract_updated(document),
            title: lookup(document, &self.config.title).and_then(scalar_to_string),
            content,
        });
        Ok(())
    }

    fn classify(&self, hit: &Hit) -> RecordKind {
        hit.kind
    }
}

/// Resolve a dot-separated path; numeric segments index into arrays.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(document);
    }
    path.split('.').try_fold(document, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Parse a remote timestamp: RFC 3339, `2013-01-24T08:24:33.000+0100`,
/// naive UTC, or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                return s
                    .parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            }
            None
        }
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            if !s.trim().is_empty() {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_text(item, out);
            }
        }
        other => out.push(other.to_string()),
    }
}

/// Shallow merge: top-level fields of `detail` win over the page document.
fn merge_detail(document: &Value, detail: &Value) -> Value {
    match (document, detail) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => detail.clone(),
    }
}
