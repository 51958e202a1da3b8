//! Infrastructure for the queue: job stores, command execution, and workers.

pub mod jobs;

pub use jobs::{
    CommandExecutor, ConfigStore, DeadLetterRetry, DispatchStats, Dispatcher, EnqueueRequest,
    InMemoryJobStore, JobStore, JobStoreError, ProcessedJob, QueueError, QueueService,
    QueueStatus, ShellExecutor, SqliteJobStore, WorkerPool,
};
