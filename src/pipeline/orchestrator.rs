use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineSettings;
use crate::error::Result;
use crate::pipeline::job::{classify_and_forward, JobContext, JobOutcome};
use crate::pipeline::worker_pool::WorkerPool;
use crate::source::{ContentItem, Cursor};

/// Sleep lengths between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub idle: Duration,
    pub quiet: Duration,
    pub active: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

impl Pacing {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            idle: settings.idle_interval(),
            quiet: settings.quiet_interval(),
            active: settings.active_interval(),
        }
    }

    pub fn next_delay(&self, report: &CycleReport) -> Duration {
        if report.processed == 0 {
            self.idle
        } else if report.forwarded == 0 {
            self.quiet
        } else {
            self.active
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Items returned by the feed.
    pub fetched: usize,
    /// Items seen for the first time.
    pub processed: usize,
    /// Jobs started.
    pub dispatched: usize,
    pub forwarded: usize,
    pub approved: usize,
    pub disqualified: usize,
    /// Jobs that ended in a non-fatal error or panicked.
    pub failed: usize,
    /// Processed markers dropped after the cycle.
    pub pruned: usize,
}

pub struct Orchestrator {
    ctx: Arc<JobContext>,
    collection: String,
    max_jobs: usize,
    max_pages: usize,
    pacing: Pacing,
}

impl Orchestrator {
    pub fn new(ctx: JobContext, collection: impl Into<String>, settings: &PipelineSettings) -> Self {
        Self {
            ctx: Arc::new(ctx),
            collection: collection.into(),
            max_jobs: settings.max_concurrent_jobs,
            max_pages: settings.max_pages_per_cycle,
            pacing: Pacing::from_settings(settings),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Run cycles until `shutdown` fires or a fatal error occurs.
    ///
    /// Cancellation is honoured between cycles and during the pacing sleep;
    /// a cycle that has started always finishes its jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(collection = %self.collection, destination = %self.ctx.destination, "Starting pipeline");

        while !shutdown.is_cancelled() {
            let report = self.run_cycle().await?;
            let delay = self.pacing.next_delay(&report);

            if report.processed == 0 {
                info!(sleep_secs = delay.as_secs(), "No new items");
            } else {
                info!(
                    processed = report.processed,
                    forwarded = report.forwarded,
                    disqualified = report.disqualified,
                    failed = report.failed,
                    sleep_secs = delay.as_secs(),
                    "Cycle complete"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Pipeline stopped");
        Ok(())
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let items = self.fetch_new_items().await?;
        let mut report = CycleReport {
            fetched: items.len(),
            ..CycleReport::default()
        };

        let stores = &self.ctx.stores;
        let mut pool = WorkerPool::new(self.max_jobs);
        // Guards against two items in the same cycle forwarding the same thing.
        let mut claimed_ids = HashSet::new();
        let mut claimed_urls = HashSet::new();

        for item in items {
            let now = Utc::now();
            if !stores.mark_processed(&item.full_id, now) {
                continue;
            }
            report.processed += 1;

            if stores.is_disqualified(&item.author_id, now) || stores.was_forwarded(&item) {
                continue;
            }
            if !claimed_ids.insert(item.full_id.clone())
                || (!item.url.is_empty() && !claimed_urls.insert(item.url.clone()))
            {
                continue;
            }

            let ctx = self.ctx.clone();
            let full_id = item.full_id.clone();
            pool.submit(async move { (full_id, classify_and_forward(ctx, item).await) })
                .await?;
            report.dispatched += 1;
        }

        let mut fatal = None;
        for joined in pool.wait_all().await {
            match joined {
                Ok((_, Ok(JobOutcome::Disqualified))) => report.disqualified += 1,
                Ok((_, Ok(JobOutcome::Forwarded { approved }))) => {
                    report.forwarded += 1;
                    if approved {
                        report.approved += 1;
                    }
                }
                Ok((full_id, Err(err))) if err.is_fatal() => {
                    error!(full_id = %full_id, error = %err, "Job failed fatally");
                    report.failed += 1;
                    fatal.get_or_insert(err);
                }
                Ok((full_id, Err(err))) => {
                    warn!(full_id = %full_id, error = %err, code = err.error_code(), "Job failed");
                    report.failed += 1;
                }
                Err(join_err) => {
                    error!(error = %join_err, "Job panicked");
                    report.failed += 1;
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        report.pruned = stores.prune_processed(Utc::now());
        Ok(report)
    }

    /// Page through the feed from its head until a page comes back empty.
    async fn fetch_new_items(&self) -> Result<Vec<ContentItem>> {
        let mut cursor = Cursor::default();
        let mut items = Vec::new();

        for _ in 0..self.max_pages {
            match self.ctx.source.fetch_new_items(&self.collection, &cursor).await {
                Ok((page, _)) if page.is_empty() => break,
                Ok((page, next)) => {
                    items.extend(page);
                    cursor = next;
                }
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, fetched = items.len(), "Feed fetch failed; continuing with what was fetched");
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(items)
    }
}
