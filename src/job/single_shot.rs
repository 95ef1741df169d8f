//! Full re-scan from one unpaginated listing.

use super::{DEFAULT_SINGLE_SHOT_BATCH, DetailFetch, JobContext, UpdateStrategy};
use crate::error::SyncResult;

/// Fetches the complete document list of a space in a single request and
/// indexes it in bulk requests of `batch_size` documents.
#[derive(Debug)]
pub struct SingleShotJob {
    batch_size: usize,
}

impl Default for SingleShotJob {
    fn default() -> Self {
        Self::new(DEFAULT_SINGLE_SHOT_BATCH)
    }
}

impl SingleShotJob {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl UpdateStrategy for SingleShotJob {
    fn name(&self) -> &'static str {
        "single_shot"
    }

    fn process_update(&mut self, ctx: &mut JobContext) -> SyncResult<()> {
        ctx.promote_to_full_update();
        let key = ctx.space_key().clone();
        let integration = ctx.integration();

        ctx.check_cancelled()?;
        let page = ctx.remote().fetch_all(&key)?;

        let mut batch = integration.begin_batch();
        let mut pending = 0usize;
        for document in &page.documents {
            ctx.check_cancelled()?;
            let id = ctx.require_id(document)?;
            let DetailFetch::Ready(detail) = ctx.fetch_detail(&id, document)? else {
                continue;
            };
            ctx.index_document(&mut batch, document, detail.as_ref())?;
            pending += 1;
            if pending >= self.batch_size {
                ctx.commit_batch(std::mem::replace(&mut batch, integration.begin_batch()))?;
                pending = 0;
                ctx.publish();
            }
        }
        if pending > 0 {
            ctx.commit_batch(batch)?;
        }
        tracing::debug!(space = %key, documents = page.len(), "single shot update finished");
        Ok(())
    }
}
