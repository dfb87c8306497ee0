pub mod job;
pub mod orchestrator;
pub mod worker_pool;

pub use job::{classify_and_forward, JobContext, JobOutcome};
pub use orchestrator::{CycleReport, Orchestrator, Pacing};
pub use worker_pool::WorkerPool;
