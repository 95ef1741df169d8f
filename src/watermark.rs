//! Persisted per-space datetime watermarks.
//!
//! Every read and write goes straight to SQLite; nothing is cached in process,
//! so a CLI invocation and a running service observe the same state.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::model::{PendingWatermark, SpaceKey};

/// What a watermark records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPurpose {
    /// Update time of the newest document indexed so far (cursor strategy).
    LastDocumentUpdate,
    /// When the coordinator last started a job for the space.
    LastSchedulingStart,
    /// When the last successful full update finished.
    LastFullUpdate,
    /// Operator (or failed run) request for a full update.
    ForcedFullUpdate,
}

impl WatermarkPurpose {
    pub const ALL: [WatermarkPurpose; 4] = [
        WatermarkPurpose::LastDocumentUpdate,
        WatermarkPurpose::LastSchedulingStart,
        WatermarkPurpose::LastFullUpdate,
        WatermarkPurpose::ForcedFullUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastDocumentUpdate => "last_document_update",
            Self::LastSchedulingStart => "last_index_start",
            Self::LastFullUpdate => "last_full_update",
            Self::ForcedFullUpdate => "force_full_update",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }
}

impl fmt::Display for WatermarkPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS watermarks (
    space_key TEXT NOT NULL,
    purpose TEXT NOT NULL,
    value_ms INTEGER NOT NULL,
    PRIMARY KEY (space_key, purpose)
)";

const UPSERT: &str = "INSERT INTO watermarks (space_key, purpose, value_ms) VALUES (?1, ?2, ?3)
    ON CONFLICT(space_key, purpose) DO UPDATE SET value_ms = excluded.value_ms";

/// SQLite-backed watermark store.
pub struct WatermarkStore {
    conn: Mutex<Connection>,
}

impl WatermarkStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SyncResult<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn read(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value_ms FROM watermarks WHERE space_key = ?1 AND purpose = ?2",
                params![key.as_str(), purpose.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        value.map(from_millis).transpose()
    }

    pub fn write(
        &self,
        key: &SpaceKey,
        purpose: WatermarkPurpose,
        value: DateTime<Utc>,
    ) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            UPSERT,
            params![key.as_str(), purpose.as_str(), value.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Write several watermarks in one transaction.
    pub fn write_all(&self, pending: &[PendingWatermark]) -> SyncResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for wm in pending {
                stmt.execute(params![
                    wm.space_key.as_str(),
                    wm.purpose.as_str(),
                    wm.value.timestamp_millis()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a watermark existed.
    pub fn delete(&self, key: &SpaceKey, purpose: WatermarkPurpose) -> SyncResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM watermarks WHERE space_key = ?1 AND purpose = ?2",
            params![key.as_str(), purpose.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// All watermarks of one space, for status reporting.
    pub fn list(&self, key: &SpaceKey) -> SyncResult<Vec<(WatermarkPurpose, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT purpose, value_ms FROM watermarks WHERE space_key = ?1 ORDER BY purpose",
        )?;
        let rows = stmt.query_map(params![key.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (purpose, value) = row?;
            // Rows written by a newer version with unknown purposes are ignored.
            if let Some(purpose) = WatermarkPurpose::parse(&purpose) {
                out.push((purpose, from_millis(value)?));
            }
        }
        Ok(out)
    }

    /// Spaces that have at least one watermark.
    pub fn spaces(&self) -> SyncResult<Vec<SpaceKey>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT space_key FROM watermarks ORDER BY space_key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(SpaceKey::new(row?));
        }
        Ok(out)
    }
}

fn from_millis(ms: i64) -> SyncResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SyncError::Config(format!("watermark value out of range: {ms}")))
}
