//! Full re-scan by plain offset pagination.
//!
//! Used for remotes that cannot filter by update time. Every run is a full
//! update; documents flagged as deleted by the remote are removed by id.

use super::{DetailFetch, JobContext, UpdateStrategy};
use crate::error::SyncResult;

#[derive(Debug, Default)]
pub struct PaginatingJob;

impl PaginatingJob {
    pub fn new() -> Self {
        Self
    }
}

impl UpdateStrategy for PaginatingJob {
    fn name(&self) -> &'static str {
        "paginating"
    }

    fn process_update(&mut self, ctx: &mut JobContext) -> SyncResult<()> {
        ctx.promote_to_full_update();
        let key = ctx.space_key().clone();
        let integration = ctx.integration();
        let remote = ctx.remote();
        let writer = ctx.writer();

        let mut offset = 0usize;
        loop {
            ctx.check_cancelled()?;
            let page = remote.fetch_page(&key, offset, None)?;
            if page.is_empty() {
                break;
            }

            let mut batch = integration.begin_batch();
            let mut writes = 0usize;
            for document in &page.documents {
                ctx.check_cancelled()?;
                let id = ctx.require_id(document)?;
                if writer.extract_deleted(document) {
                    writes += ctx.prepare_delete_by_id(&mut batch, &id)?;
                    continue;
                }
                let DetailFetch::Ready(detail) = ctx.fetch_detail(&id, document)? else {
                    continue;
                };
                ctx.index_document(&mut batch, document, detail.as_ref())?;
                writes += 1;
            }
            if writes > 0 {
                ctx.commit_batch(batch)?;
            }
            ctx.publish();

            offset += page.len();
            if let Some(total) = page.total
                && offset >= total
            {
                break;
            }
        }
        tracing::debug!(space = %key, documents = offset, "paginated update finished");
        Ok(())
    }
}
