//! # Job Queue & Worker Pool
//!
//! ## Responsabilità:
//! - `build_queue`: coda FIFO delle build con lock a tempo rinnovato da heartbeat
//! - `worker_pool`: N worker, ogni build in un task proprio; reaper dei lock scaduti
//! - `serial`: coda a concorrenza 1 per le ottimizzazioni AI
//! - `scheduler`: confronti di performance periodici
//! - `backoff`: retry esponenziale condiviso

pub mod backoff;
pub mod build_queue;
pub mod scheduler;
pub mod serial;
pub mod worker_pool;

use thiserror::Error;
use uuid::Uuid;

pub use backoff::RetryPolicy;
pub use build_queue::{BuildQueue, Claim, Job, ReapOutcome};
pub use scheduler::{PerformanceComparer, PerformanceComparison, PeriodicScheduler};
pub use serial::{AiOptimizer, AiOutcome, AiRequest, SerialQueue};
pub use worker_pool::WorkerPool;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is shut down")]
    Closed,

    #[error("Job {0} is not active")]
    UnknownJob(Uuid),

    #[error("Lock for job {job} is held by worker {holder}")]
    LockLost { job: Uuid, holder: usize },

    #[error("Job {job} gave up after {attempts} attempts")]
    Exhausted { job: Uuid, attempts: u32 },
}
