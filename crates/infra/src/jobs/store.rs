//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use queuectl_core::{Config, Job, JobId, JobState};

/// Durable job persistence.
///
/// `claim_next_pending`, `promote_retryable` and `retry_dead` must each be
/// all-or-nothing and safe under concurrent callers: a job is handed to at
/// most one claimant, and promoted at most once per failure.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Upsert keyed by id (last writer wins).
    async fn save(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in `state`, oldest first.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError>;

    /// Every job, oldest first.
    async fn list_all(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Number of jobs per state. States with no jobs may be absent.
    async fn counts_by_state(&self) -> Result<HashMap<JobState, u64>, JobStoreError>;

    /// Move every failed job whose `next_retry_at <= now` back to pending and
    /// return the promoted jobs.
    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically take the oldest pending job and mark it processing.
    async fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Reset a dead job to pending with a fresh attempt budget.
    async fn retry_dead(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRetry, JobStoreError>;

    /// Remove a job. Operator action only; the queue never deletes on its own.
    async fn delete(&self, id: &JobId) -> Result<bool, JobStoreError>;
}

/// Persistence for the operator-tunable part of [`Config`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Overlay persisted values onto `defaults`.
    async fn load_config(&self, defaults: Config) -> Result<Config, JobStoreError>;

    /// Persist the tunables of `config`. Not atomic with concurrent savers.
    async fn save_config(&self, config: &Config) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> JobStoreError {
    JobStoreError::storage("in-memory job store lock poisoned")
}

/// Outcome of a dead-letter retry request.
///
/// Unknown ids and jobs that are not dead are ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterRetry {
    /// The job was dead and is pending again.
    Requeued(Job),
    NotFound,
    /// The job exists but is not dead; it was left untouched.
    NotDead(JobState),
}

impl DeadLetterRetry {
    pub fn is_requeued(&self) -> bool {
        matches!(self, DeadLetterRetry::Requeued(_))
    }
}

/// Config values that live in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedConfig {
    pub max_retries: u32,
    pub backoff_base: u32,
    pub max_backoff_secs: Option<u64>,
}

impl PersistedConfig {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            max_backoff_secs: config.max_backoff_secs,
        }
    }

    pub(crate) fn apply(self, mut config: Config) -> Config {
        config.max_retries = self.max_retries;
        config.backoff_base = self.backoff_base;
        config.max_backoff_secs = self.max_backoff_secs;
        config
    }
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Slot>,
    next_seq: u64,
    config: Option<PersistedConfig>,
}

impl Inner {
    /// Jobs matching `filter`, FIFO by `created_at` then insertion order.
    fn sorted(&self, filter: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut slots: Vec<_> = self.jobs.values().filter(|s| filter(&s.job)).collect();
        slots.sort_by_key(|s| (s.job.created_at, s.seq));
        slots.into_iter().map(|s| s.job.clone()).collect()
    }

    fn upsert(&mut self, job: &Job) {
        if let Some(slot) = self.jobs.get_mut(&job.id) {
            slot.job = job.clone();
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id.clone(), Slot {
            seq,
            job: job.clone(),
        });
    }
}

/// In-memory job store for tests and embedding.
///
/// One `RwLock` guards everything, so claim and promotion are trivially
/// serialised.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id.clone()));
        }
        inner.upsert(job);
        Ok(())
    }

    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        self.inner.write().map_err(poisoned)?.upsert(job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.jobs.get(id).map(|s| s.job.clone()))
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.sorted(|j| j.state == state))
    }

    async fn list_all(&self) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.sorted(|_| true))
    }

    async fn counts_by_state(&self) -> Result<HashMap<JobState, u64>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut counts = HashMap::new();
        for slot in inner.jobs.values() {
            *counts.entry(slot.job.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let due = inner.sorted(|j| j.is_retry_due(now));

        let mut promoted = Vec::with_capacity(due.len());
        for mut job in due {
            job.promote(now)
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            inner.upsert(&job);
            promoted.push(job);
        }
        Ok(promoted)
    }

    async fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let Some(mut job) = inner
            .sorted(|j| j.state == JobState::Pending)
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        job.mark_processing(now)
            .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        inner.upsert(&job);
        Ok(Some(job))
    }

    async fn retry_dead(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRetry, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let Some(slot) = inner.jobs.get_mut(id) else {
            return Ok(DeadLetterRetry::NotFound);
        };
        if slot.job.state != JobState::Dead {
            return Ok(DeadLetterRetry::NotDead(slot.job.state));
        }
        slot.job
            .reset_dead(now)
            .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        Ok(DeadLetterRetry::Requeued(slot.job.clone()))
    }

    async fn delete(&self, id: &JobId) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        Ok(inner.jobs.remove(id).is_some())
    }
}

#[async_trait]
impl ConfigStore for InMemoryJobStore {
    async fn load_config(&self, defaults: Config) -> Result<Config, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(match inner.config {
            Some(persisted) => persisted.apply(defaults),
            None => defaults,
        })
    }

    async fn save_config(&self, config: &Config) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.config = Some(PersistedConfig::from_config(config));
        Ok(())
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).save(job).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state).await
    }

    async fn list_all(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_all().await
    }

    async fn counts_by_state(&self) -> Result<HashMap<JobState, u64>, JobStoreError> {
        (**self).counts_by_state().await
    }

    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).promote_retryable(now).await
    }

    async fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next_pending(now).await
    }

    async fn retry_dead(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRetry, JobStoreError> {
        (**self).retry_dead(id, now).await
    }

    async fn delete(&self, id: &JobId) -> Result<bool, JobStoreError> {
        (**self).delete(id).await
    }
}

#[async_trait]
impl<T: ConfigStore + ?Sized> ConfigStore for Arc<T> {
    async fn load_config(&self, defaults: Config) -> Result<Config, JobStoreError> {
        (**self).load_config(defaults).await
    }

    async fn save_config(&self, config: &Config) -> Result<(), JobStoreError> {
        (**self).save_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use queuectl_core::{JobResult, RetryPolicy};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn job(id: &str, at: DateTime<Utc>) -> Job {
        Job::new(JobId::from(id), "true", 3, at).unwrap()
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryJobStore::new();
        store.insert(&job("a", t0())).await.unwrap();

        let claimed = store.claim_next_pending(t0()).await.unwrap().unwrap();
        assert_eq!(claimed.id, JobId::from("a"));
        assert_eq!(claimed.state, JobState::Processing);

        // No more jobs
        assert!(store.claim_next_pending(t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = InMemoryJobStore::new();
        store.insert(&job("a", t0())).await.unwrap();
        assert!(matches!(
            store.insert(&job("a", t0())).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claims_are_fifo_by_created_at() {
        let store = InMemoryJobStore::new();
        store.insert(&job("late", t0() + Duration::seconds(5))).await.unwrap();
        store.insert(&job("early", t0())).await.unwrap();
        store.insert(&job("tie", t0())).await.unwrap();

        let order: Vec<String> = [
            store.claim_next_pending(t0()).await.unwrap().unwrap(),
            store.claim_next_pending(t0()).await.unwrap().unwrap(),
            store.claim_next_pending(t0()).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.id.into_inner())
        .collect();
        assert_eq!(order, ["early", "tie", "late"]);
    }

    #[tokio::test]
    async fn promotion_waits_for_next_retry_at() {
        let store = InMemoryJobStore::new();
        store.insert(&job("a", t0())).await.unwrap();
        let mut claimed = store.claim_next_pending(t0()).await.unwrap().unwrap();
        claimed
            .apply_result(&JobResult::failure("x"), &RetryPolicy::default(), t0())
            .unwrap();
        store.save(&claimed).await.unwrap();

        assert!(store.promote_retryable(t0() + Duration::seconds(1)).await.unwrap().is_empty());
        assert!(store.claim_next_pending(t0()).await.unwrap().is_none());

        let promoted = store.promote_retryable(t0() + Duration::seconds(2)).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].next_retry_at, None);
        assert!(store.promote_retryable(t0() + Duration::seconds(2)).await.unwrap().is_empty());

        let again = store.claim_next_pending(t0() + Duration::seconds(2)).await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn counts_track_states() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.insert(&job(&format!("j{i}"), t0())).await.unwrap();
        }
        store.claim_next_pending(t0()).await.unwrap();
        store.claim_next_pending(t0()).await.unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Pending), Some(&3));
        assert_eq!(counts.get(&JobState::Processing), Some(&2));
        assert_eq!(counts.get(&JobState::Dead), None);
    }

    #[tokio::test]
    async fn retry_dead_reports_outcomes() {
        let store = InMemoryJobStore::new();
        assert_eq!(
            store.retry_dead(&JobId::from("missing"), t0()).await.unwrap(),
            DeadLetterRetry::NotFound
        );

        store.insert(&job("a", t0())).await.unwrap();
        assert_eq!(
            store.retry_dead(&JobId::from("a"), t0()).await.unwrap(),
            DeadLetterRetry::NotDead(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn config_round_trips_tunables_only() {
        let store = InMemoryJobStore::new();
        let defaults = Config::default();
        assert_eq!(store.load_config(defaults.clone()).await.unwrap(), defaults);

        let mut changed = defaults.clone();
        changed.max_retries = 9;
        changed.db_path = "/elsewhere.db".into();
        store.save_config(&changed).await.unwrap();

        let loaded = store.load_config(defaults.clone()).await.unwrap();
        assert_eq!(loaded.max_retries, 9);
        assert_eq!(loaded.db_path, defaults.db_path);
    }
}
