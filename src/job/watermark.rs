//! Incremental synchronization driven by a persisted update-time cursor.
//!
//! The remote is asked for documents updated at or after the cursor, in
//! ascending update order. After every page the cursor moves to the newest
//! update time seen, unless the whole page shares a single timestamp: then
//! moving the cursor would not make progress, so the job pages by offset
//! instead (or, when the remote cannot report totals, steps one second past
//! the tie and accepts that it may miss same-timestamp documents).

use chrono::{DateTime, Duration, Utc};

use super::{DetailFetch, JobContext, UpdateStrategy};
use crate::error::SyncResult;
use crate::watermark::WatermarkPurpose;

/// How far the cursor is pushed past a timestamp it cannot page through.
const CURSOR_BUMP: Duration = Duration::seconds(1);

#[derive(Debug, Default)]
pub struct WatermarkJob;

impl WatermarkJob {
    pub fn new() -> Self {
        Self
    }
}

/// Where the next page request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextPage {
    Fetch {
        cursor: Option<DateTime<Utc>>,
        offset: usize,
    },
    /// Same as `Fetch`, reached by stepping over an unpageable tie.
    BumpedCursor { cursor: DateTime<Utc> },
    Stop,
}

/// Decide how to continue after a page of `page_len` documents fetched at
/// `offset`, whose first and newest update times were `first_seen` and
/// `last_seen`.
fn next_page(
    cursor: Option<DateTime<Utc>>,
    offset: usize,
    page_len: usize,
    total: Option<usize>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
) -> NextPage {
    if let (Some(first), Some(last)) = (first_seen, last_seen)
        && first != last
    {
        // Page spans several timestamps: safe to cut at the newest one.
        // Without a total we assume this page was the tail.
        return match total {
            Some(total) if offset + page_len < total => NextPage::Fetch {
                cursor: Some(last),
                offset: 0,
            },
            _ => NextPage::Stop,
        };
    }

    if let Some(total) = total {
        let offset = offset + page_len;
        return if offset < total {
            NextPage::Fetch { cursor, offset }
        } else {
            NextPage::Stop
        };
    }

    match last_seen {
        Some(tied) => NextPage::BumpedCursor {
            cursor: tied + CURSOR_BUMP,
        },
        None => NextPage::Stop,
    }
}

impl UpdateStrategy for WatermarkJob {
    fn name(&self) -> &'static str {
        "watermark"
    }

    fn process_update(&mut self, ctx: &mut JobContext) -> SyncResult<()> {
        let key = ctx.space_key().clone();
        let integration = ctx.integration();
        let remote = ctx.remote();

        let start_cursor = if ctx.is_full_update() {
            None
        } else {
            integration.read_watermark(&key, WatermarkPurpose::LastDocumentUpdate)?
        };
        if start_cursor.is_none() && !ctx.is_full_update() {
            tracing::info!(space = %key, "no cursor stored yet, running full update");
            ctx.promote_to_full_update();
        }

        let mut cursor = start_cursor;
        let mut offset = 0usize;
        let mut indexed_total = 0u64;
        let mut persisted: Option<DateTime<Utc>> = None;

        loop {
            ctx.check_cancelled()?;
            let page = remote.fetch_page(&key, offset, cursor)?;
            if page.is_empty() {
                break;
            }

            let mut batch = integration.begin_batch();
            let mut first_seen = None;
            let mut last_seen: Option<DateTime<Utc>> = None;
            let mut indexed = 0u64;

            for document in &page.documents {
                ctx.check_cancelled()?;
                let id = ctx.require_id(document)?;
                let updated = ctx.require_updated(&id, document)?;
                first_seen.get_or_insert(updated);
                last_seen = Some(last_seen.map_or(updated, |seen| seen.max(updated)));

                let DetailFetch::Ready(detail) = ctx.fetch_detail(&id, document)? else {
                    continue;
                };
                ctx.index_document(&mut batch, document, detail.as_ref())?;
                indexed += 1;
            }

            if indexed > 0 {
                if let Some(last) = last_seen {
                    batch.put_watermark(&key, WatermarkPurpose::LastDocumentUpdate, last);
                    persisted = Some(last);
                }
                ctx.commit_batch(batch)?;
            }
            indexed_total += indexed;
            ctx.publish();

            match next_page(cursor, offset, page.len(), page.total, first_seen, last_seen) {
                NextPage::Fetch {
                    cursor: next_cursor,
                    offset: next_offset,
                } => {
                    cursor = next_cursor;
                    offset = next_offset;
                }
                NextPage::BumpedCursor { cursor: bumped } => {
                    tracing::warn!(
                        space = %key,
                        cursor = %bumped,
                        "all documents on page share one update time and the remote reports no total; \
                         moving cursor one second forward, some documents with that time may be missed"
                    );
                    cursor = Some(bumped);
                    offset = 0;
                }
                NextPage::Stop => break,
            }
        }

        // Only the boundary document was seen again: step past it so the
        // next run does not reprocess it forever.
        if indexed_total > 0
            && let Some(start) = start_cursor
            && persisted == Some(start)
        {
            let bumped = start + CURSOR_BUMP;
            integration.write_watermark(&key, WatermarkPurpose::LastDocumentUpdate, bumped)?;
            tracing::debug!(space = %key, cursor = %bumped, "no cursor progress, stepped past boundary document");
        }

        tracing::debug!(space = %key, indexed = indexed_total, "watermark update finished");
        Ok(())
    }
}
