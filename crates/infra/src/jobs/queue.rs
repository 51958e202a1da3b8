//! Queue operations on top of a [`JobStore`].
//!
//! `QueueService` is what callers (the CLI, the dispatch loop) talk to. It
//! owns the configuration and the clock, and is the only place that turns an
//! execution result into a persisted state change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use queuectl_core::{Config, DomainError, Job, JobId, JobResult, JobState, RetryPolicy, Transition};

use super::clock::{Clock, SystemClock};
use super::store::{DeadLetterRetry, JobStore, JobStoreError};

/// Errors surfaced to queue callers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Input for [`QueueService::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub command: String,
    /// Generated when absent.
    pub id: Option<JobId>,
    /// Falls back to the configured default when absent.
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            id: None,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Job counts per state. Every state is present, even at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
}

impl QueueStatus {
    pub fn from_counts(counts: &HashMap<JobState, u64>) -> Self {
        let get = |state| counts.get(&state).copied().unwrap_or(0);
        let status = Self {
            pending: get(JobState::Pending),
            processing: get(JobState::Processing),
            completed: get(JobState::Completed),
            failed: get(JobState::Failed),
            dead: get(JobState::Dead),
            total: 0,
        };
        Self {
            total: JobState::ALL.iter().map(|s| status.count(*s)).sum(),
            ..status
        }
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}

/// A job after one execution attempt has been applied and saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job: Job,
    pub transition: Transition,
    /// Executor output on success, failure reason otherwise.
    pub message: String,
}

pub struct QueueService<S> {
    store: S,
    config: Config,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for QueueService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> QueueService<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: Config, clock: Arc<dyn Clock>) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            store,
            config,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Create a pending job. A missing or blank id is replaced by a generated
    /// one.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError> {
        let id = request
            .id
            .filter(|id| !id.as_str().trim().is_empty())
            .unwrap_or_else(JobId::generate);
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);
        let job = Job::new(id, request.command, max_retries, self.clock.now())?;

        self.store.insert(&job).await?;
        info!(job_id = %job.id, max_retries, "job enqueued");
        Ok(job)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let counts = self.store.counts_by_state().await?;
        Ok(QueueStatus::from_counts(&counts))
    }

    /// Jobs in `state`, or every job when `state` is `None`. Oldest first.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        let jobs = match state {
            Some(state) => self.store.list_by_state(state).await?,
            None => self.store.list_all().await?,
        };
        Ok(jobs)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<Job>, QueueError> {
        self.list(Some(JobState::Dead)).await
    }

    /// Put a dead job back in the queue with a fresh attempt budget.
    pub async fn retry_dead_letter(&self, id: &JobId) -> Result<DeadLetterRetry, QueueError> {
        let outcome = self.store.retry_dead(id, self.clock.now()).await?;
        match &outcome {
            DeadLetterRetry::Requeued(_) => info!(job_id = %id, "dead job requeued"),
            DeadLetterRetry::NotFound => debug!(job_id = %id, "dlq retry: no such job"),
            DeadLetterRetry::NotDead(state) => {
                debug!(job_id = %id, state = %state, "dlq retry: job is not dead")
            }
        }
        Ok(outcome)
    }

    /// Requeue failed jobs whose backoff has elapsed.
    pub async fn promote_due(&self) -> Result<Vec<Job>, QueueError> {
        let promoted = self.store.promote_retryable(self.clock.now()).await?;
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "promoted jobs for retry");
        }
        Ok(promoted)
    }

    /// Claim the oldest pending job, if any.
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.store.claim_next_pending(self.clock.now()).await?)
    }

    /// Apply an execution result to a claimed job and save it.
    pub async fn complete_attempt(
        &self,
        mut job: Job,
        result: &JobResult,
    ) -> Result<ProcessedJob, QueueError> {
        let transition = job.apply_result(result, &self.policy, self.clock.now())?;
        self.store.save(&job).await?;

        match transition {
            Transition::Completed => {
                info!(job_id = %job.id, attempts = job.attempts, "job completed");
            }
            Transition::Retrying { next_retry_at } => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_retries = job.max_retries,
                    next_retry_at = %next_retry_at,
                    error = %result.message(),
                    "job failed, retry scheduled"
                );
            }
            Transition::DeadLettered => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %result.message(),
                    "job moved to dead-letter queue"
                );
            }
        }

        Ok(ProcessedJob {
            job,
            transition,
            message: result.message().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn service() -> (Arc<ManualClock>, QueueService<Arc<InMemoryJobStore>>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let service =
            QueueService::with_clock(InMemoryJobStore::arc(), Config::default(), clock.clone());
        (clock, service)
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let (_clock, queue) = service();
        let job = queue.enqueue(EnqueueRequest::new("echo hi")).await.unwrap();

        assert!(job.id.as_str().starts_with("job-"));
        assert_eq!(job.max_retries, Config::DEFAULT_MAX_RETRIES);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.created_at, t0());
        assert_eq!(queue.get(&job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn enqueue_honours_overrides_and_rejects_bad_input() {
        let (_clock, queue) = service();
        let job = queue
            .enqueue(EnqueueRequest::new("true").with_id("custom").with_max_retries(7))
            .await
            .unwrap();
        assert_eq!(job.id.as_str(), "custom");
        assert_eq!(job.max_retries, 7);

        let err = queue
            .enqueue(EnqueueRequest::new("true").with_id("custom"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(JobStoreError::AlreadyExists(_))));

        let err = queue.enqueue(EnqueueRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));
        assert_eq!(queue.status().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn blank_id_falls_back_to_generated() {
        let (_clock, queue) = service();
        let empty = queue
            .enqueue(EnqueueRequest::new("true").with_id(""))
            .await
            .unwrap();
        let spaces = queue
            .enqueue(EnqueueRequest::new("true").with_id("   "))
            .await
            .unwrap();

        assert!(empty.id.as_str().starts_with("job-"));
        assert!(spaces.id.as_str().starts_with("job-"));
        assert_ne!(empty.id, spaces.id);
        assert!(queue.get(&JobId::from("")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_reports_every_state() {
        let (_clock, queue) = service();
        for i in 0..3 {
            queue
                .enqueue(EnqueueRequest::new("true").with_id(format!("j{i}")))
                .await
                .unwrap();
        }
        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue
            .complete_attempt(claimed, &JobResult::success("done"))
            .await
            .unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(
            status,
            QueueStatus {
                pending: 2,
                processing: 0,
                completed: 1,
                failed: 0,
                dead: 0,
                total: 3,
            }
        );
    }

    #[tokio::test]
    async fn success_reports_output() {
        let (_clock, queue) = service();
        queue
            .enqueue(EnqueueRequest::new("echo ok").with_id("job-2"))
            .await
            .unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let processed = queue
            .complete_attempt(claimed, &JobResult::success("ok"))
            .await
            .unwrap();

        assert_eq!(processed.transition, Transition::Completed);
        assert_eq!(processed.message, "ok");
        let stored = queue.get(&JobId::from("job-2")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn failure_schedules_retry_then_promotes() {
        let (clock, queue) = service();
        queue
            .enqueue(EnqueueRequest::new("false").with_id("a"))
            .await
            .unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        let processed = queue
            .complete_attempt(claimed, &JobResult::failure("exit 1"))
            .await
            .unwrap();
        assert_eq!(
            processed.transition,
            Transition::Retrying {
                next_retry_at: t0() + Duration::seconds(2)
            }
        );

        clock.advance(Duration::seconds(1));
        assert!(queue.promote_due().await.unwrap().is_empty());
        assert!(queue.claim_next().await.unwrap().is_none());

        clock.advance(Duration::seconds(1));
        assert_eq!(queue.promote_due().await.unwrap().len(), 1);
        assert!(queue.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_dead_letter_outcomes() {
        let (_clock, queue) = service();
        queue
            .enqueue(EnqueueRequest::new("false").with_id("d").with_max_retries(1))
            .await
            .unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        let processed = queue
            .complete_attempt(claimed, &JobResult::failure("boom"))
            .await
            .unwrap();
        assert_eq!(processed.transition, Transition::DeadLettered);
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);

        let outcome = queue.retry_dead_letter(&JobId::from("d")).await.unwrap();
        let DeadLetterRetry::Requeued(job) = outcome else {
            panic!("expected requeue, got {outcome:?}");
        };
        assert_eq!(job.attempts, 0);
        assert_eq!(job.state, JobState::Pending);

        assert_eq!(
            queue.retry_dead_letter(&JobId::from("d")).await.unwrap(),
            DeadLetterRetry::NotDead(JobState::Pending)
        );
        assert_eq!(
            queue.retry_dead_letter(&JobId::from("zzz")).await.unwrap(),
            DeadLetterRetry::NotFound
        );
    }

    #[test]
    fn status_from_sparse_counts() {
        let counts = HashMap::from([(JobState::Dead, 2), (JobState::Pending, 5)]);
        let status = QueueStatus::from_counts(&counts);
        assert_eq!(status.dead, 2);
        assert_eq!(status.pending, 5);
        assert_eq!(status.completed, 0);
        assert_eq!(status.total, 7);
    }
}
