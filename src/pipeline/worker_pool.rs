use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::error::{Error, Result};

/// Runs at most `max_jobs` futures at once.
///
/// [`submit`](WorkerPool::submit) waits for a free slot before spawning, so the
/// caller is held back instead of queueing unbounded work.
pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    max_jobs: usize,
    jobs: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(max_jobs: usize) -> Self {
        let max_jobs = max_jobs.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_jobs)),
            max_jobs,
            jobs: JoinSet::new(),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_jobs - self.slots.available_permits()
    }

    pub async fn submit<F>(&mut self, job: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Invalid("Worker pool is closed".to_string()))?;

        self.jobs.spawn(async move {
            let _permit = permit;
            job.await
        });
        Ok(())
    }

    /// Wait for every submitted job. Outcomes are in completion order.
    pub async fn wait_all(&mut self) -> Vec<std::result::Result<T, JoinError>> {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        while let Some(outcome) = self.jobs.join_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}
