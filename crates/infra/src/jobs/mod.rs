//! The job queue: storage, execution, and the dispatch loop.
//!
//! ## Components
//!
//! - [`JobStore`]: persistence with an atomic claim (`InMemoryJobStore`,
//!   `SqliteJobStore`)
//! - [`CommandExecutor`]: runs a job's command (`ShellExecutor`)
//! - [`QueueService`]: enqueue, status, dead-letter retry, result application
//! - [`Dispatcher`] / [`WorkerPool`]: the per-worker poll-claim-execute loop

pub mod clock;
pub mod dispatch;
pub mod executor;
pub mod queue;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchStats, Dispatcher, WorkerPool};
pub use executor::{CommandExecutor, ShellExecutor};
pub use queue::{EnqueueRequest, ProcessedJob, QueueError, QueueService, QueueStatus};
pub use sqlite::SqliteJobStore;
pub use store::{ConfigStore, DeadLetterRetry, InMemoryJobStore, JobStore, JobStoreError};
