use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::error::Result;
use crate::retry::{retry, RetryPolicy};
use crate::source::ContentItem;
use crate::storage::Stores;
use crate::throttle::GatedSource;

/// Everything a job needs, shared by all jobs of all cycles.
pub struct JobContext {
    pub source: GatedSource,
    pub stores: Stores,
    pub classifier: Classifier,
    pub retry: RetryPolicy,
    pub destination: String,
    pub approve_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The author's history matched; nothing was forwarded.
    Disqualified,
    /// The item was cross-posted. `approved` is false when the approval was
    /// skipped or refused.
    Forwarded { approved: bool },
}

/// Classify the author of `item` and forward the item if they pass.
///
/// Errors are per item. The caller decides whether one is fatal.
pub async fn classify_and_forward(ctx: Arc<JobContext>, item: ContentItem) -> Result<JobOutcome> {
    let source = &ctx.source;
    let author = item.author_name.as_str();

    let posts = retry(&ctx.retry, "fetch_author_posts", || source.fetch_author_posts(author)).await?;
    let comments = retry(&ctx.retry, "fetch_author_comments", || {
        source.fetch_author_comments(author)
    })
    .await?;

    if let Some(hit) = ctx.classifier.find_match(&posts, &comments) {
        info!(
            full_id = %item.full_id,
            author = %item.author_name,
            evidence = %hit.full_id,
            field = ?hit.field,
            "Author disqualified"
        );
        ctx.stores.record_disqualified(&item.author_id, Utc::now());
        return Ok(JobOutcome::Disqualified);
    }

    info!(full_id = %item.full_id, title = %item.title, "Forwarding");
    let created = source.cross_post(&item, &ctx.destination).await?;
    ctx.stores.record_forwarded(&item);

    let Some(created) = created else {
        debug!(full_id = %item.full_id, "Cross-post returned no new item; skipping approval");
        return Ok(JobOutcome::Forwarded { approved: false });
    };

    sleep(ctx.approve_delay).await;
    match source.approve(&created).await {
        Ok(()) => Ok(JobOutcome::Forwarded { approved: true }),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(full_id = %created.full_id, error = %err, "Approval failed");
            Ok(JobOutcome::Forwarded { approved: false })
        }
    }
}
