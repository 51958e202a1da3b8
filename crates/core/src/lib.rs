//! `queuectl-core`: the job model, its state machine, and retry math.
//!
//! This crate is **pure domain** (no storage, no processes, no clocks: every
//! operation that needs the time takes `now` as an argument).

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod time;

pub use config::Config;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobResult, JobState, Transition};
pub use retry::{RetryPolicy, backoff_delay, next_retry_timestamp};
pub use time::{format_timestamp, parse_timestamp};
