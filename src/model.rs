//! Value types exchanged between the jobs and their ports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watermark::WatermarkPurpose;

/// Raw remote document, exactly as the remote source returned it.
pub type RawDocument = serde_json::Value;

/// Identifies one remote space: the unit of scheduling, exclusion and
/// watermark storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceKey(String);

impl SpaceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SpaceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for SpaceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One page of changed documents returned by the remote source.
#[derive(Debug, Clone, Default)]
pub struct ChangedPage {
    /// Documents in remote order (ascending update time for cursor-capable sources).
    pub documents: Vec<RawDocument>,
    /// Position of the first document in the remote's total ordering.
    pub offset: usize,
    /// Total number of matching documents, when the remote can report it.
    pub total: Option<usize>,
}

impl ChangedPage {
    pub fn new(documents: Vec<RawDocument>, offset: usize, total: Option<usize>) -> Self {
        Self {
            documents,
            offset,
            total,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Kind of an indexed record, as reported back by the document writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The remote document itself.
    Primary,
    /// A record derived from a document, e.g. a standalone comment.
    Secondary,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "document",
            Self::Secondary => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document" => Some(Self::Primary),
            "comment" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// A record ready to be written to the search index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// Unique id of the record inside the index.
    pub record_id: String,
    pub space_key: SpaceKey,
    /// Remote id of the document the record belongs to.
    pub remote_id: String,
    pub kind: RecordKind,
    pub updated_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub content: String,
}

/// A single write against the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    Upsert(IndexRecord),
    Delete { record_id: String },
}

/// A watermark write that is committed together with a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWatermark {
    pub space_key: SpaceKey,
    pub purpose: WatermarkPurpose,
    pub value: DateTime<Utc>,
}

/// Accumulated index writes plus watermark updates that travel with them.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<IndexOp>,
    watermarks: Vec<PendingWatermark>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: IndexRecord) {
        self.ops.push(IndexOp::Upsert(record));
    }

    pub fn delete(&mut self, record_id: impl Into<String>) {
        self.ops.push(IndexOp::Delete {
            record_id: record_id.into(),
        });
    }

    pub fn put_watermark(
        &mut self,
        space_key: &SpaceKey,
        purpose: WatermarkPurpose,
        value: DateTime<Utc>,
    ) {
        self.watermarks.push(PendingWatermark {
            space_key: space_key.clone(),
            purpose,
            value,
        });
    }

    pub fn ops(&self) -> &[IndexOp] {
        &self.ops
    }

    pub fn watermarks(&self) -> &[PendingWatermark] {
        &self.watermarks
    }

    /// Number of index operations (watermarks excluded).
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.watermarks.is_empty()
    }

    pub fn into_parts(self) -> (Vec<IndexOp>, Vec<PendingWatermark>) {
        (self.ops, self.watermarks)
    }
}

/// A record found in the index by a [`RecordQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub record_id: String,
    pub space_key: SpaceKey,
    pub remote_id: String,
    pub kind: RecordKind,
    pub synced_at: DateTime<Utc>,
}

/// Queries used by the deletion sweeps.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordQuery {
    /// Records of a space not written at or after `boundary`.
    StaleSince {
        space_key: SpaceKey,
        boundary: DateTime<Utc>,
    },
    /// Records of a space belonging to one remote document.
    ByRemoteId {
        space_key: SpaceKey,
        remote_id: String,
    },
}

impl RecordQuery {
    pub fn space_key(&self) -> &SpaceKey {
        match self {
            Self::StaleSince { space_key, .. } | Self::ByRemoteId { space_key, .. } => space_key,
        }
    }

    pub fn matches(&self, hit: &Hit) -> bool {
        match self {
            // Write times are stored with millisecond precision.
            Self::StaleSince {
                space_key,
                boundary,
            } => {
                &hit.space_key == space_key
                    && hit.synced_at.timestamp_millis() < boundary.timestamp_millis()
            }
            Self::ByRemoteId {
                space_key,
                remote_id,
            } => &hit.space_key == space_key && &hit.remote_id == remote_id,
        }
    }
}
