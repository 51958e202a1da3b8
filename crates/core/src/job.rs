//! The job record and its state machine.
//!
//! ```text
//! Pending ──claim──▶ Processing ──success──▶ Completed
//!    ▲                   │
//!    │                   ├──failure, attempts < max──▶ Failed ──promote──┐
//!    │                   │                                               │
//!    │                   └──failure, attempts >= max──▶ Dead             │
//!    │                                                   │               │
//!    └──────────────── DLQ retry (attempts = 0) ─────────┘◀──────────────┘
//! ```
//!
//! Every mutation goes through [`Job::transition`], which rejects illegal
//! moves and bumps `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::retry::RetryPolicy;
use crate::time::truncate_to_micros;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed, waiting for its backoff to elapse
    Failed,
    /// Exhausted its attempts; parked for manual inspection
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// The persisted tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Terminal unless an operator explicitly resets a dead job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Failed, Pending)
                | (Dead, Pending)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == lowered)
            .ok_or_else(|| DomainError::invalid_state(s))
    }
}

/// What the executor reported for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Command exited zero; `output` is its captured stdout.
    Success { output: String },
    /// Command failed for any reason; `reason` is human-readable.
    Failure { reason: String },
}

impl JobResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success {
            output: output.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            JobResult::Success { output } => output,
            JobResult::Failure { reason } => reason,
        }
    }
}

/// Where a job ended up after a result was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    /// Failed with budget left; eligible again at `next_retry_at`.
    Retrying { next_retry_at: DateTime<Utc> },
    /// Failed with no budget left.
    DeadLettered,
}

/// A queued shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque to the queue; handed verbatim to the executor.
    pub command: String,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt ceiling; reaching it on failure moves the job to `Dead`.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only while `Failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure detail; cleared on success or requeue.
    pub error_message: Option<String>,
}

impl Job {
    /// Create a pending job. Rejects an empty command and a zero attempt
    /// ceiling.
    pub fn new(
        id: JobId,
        command: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        if max_retries == 0 {
            return Err(DomainError::validation("max_retries must be at least 1"));
        }
        let now = truncate_to_micros(now);
        Ok(Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            error_message: None,
        })
    }

    fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.touch(now);
        Ok(())
    }

    /// `updated_at` never moves backwards, even if the caller's clock does.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(truncate_to_micros(now));
    }

    /// Pending -> Processing.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobState::Processing, now)
    }

    /// Apply an execution result to a processing job.
    ///
    /// Success completes the job. Failure records the attempt and either
    /// schedules a retry or dead-letters the job once `attempts` reaches
    /// `max_retries`.
    pub fn apply_result(
        &mut self,
        result: &JobResult,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        match result {
            JobResult::Success { .. } => {
                self.transition(JobState::Completed, now)?;
                self.error_message = None;
                self.next_retry_at = None;
                Ok(Transition::Completed)
            }
            JobResult::Failure { reason } => {
                let attempts = self.attempts.saturating_add(1);
                if RetryPolicy::is_exhausted(attempts, self.max_retries) {
                    self.transition(JobState::Dead, now)?;
                    self.next_retry_at = None;
                    self.attempts = attempts.min(self.max_retries);
                    self.error_message = Some(reason.clone());
                    Ok(Transition::DeadLettered)
                } else {
                    self.transition(JobState::Failed, now)?;
                    let next_retry_at = truncate_to_micros(policy.next_retry_at(now, attempts));
                    self.attempts = attempts;
                    self.next_retry_at = Some(next_retry_at);
                    self.error_message = Some(reason.clone());
                    Ok(Transition::Retrying { next_retry_at })
                }
            }
        }
    }

    /// Whether a failed job's backoff has elapsed.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Failed -> Pending once the backoff has elapsed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobState::Pending, now)?;
        self.next_retry_at = None;
        Ok(())
    }

    /// Dead -> Pending with a fresh attempt budget.
    pub fn reset_dead(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Dead {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to: JobState::Pending,
            });
        }
        self.transition(JobState::Pending, now)?;
        self.attempts = 0;
        self.error_message = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Check the record-level invariants. Used when decoding persisted rows.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.attempts > self.max_retries {
            return Err(DomainError::validation(format!(
                "job {}: attempts {} exceed max_retries {}",
                self.id, self.attempts, self.max_retries
            )));
        }
        if self.next_retry_at.is_some() != (self.state == JobState::Failed) {
            return Err(DomainError::validation(format!(
                "job {}: next_retry_at must be set iff state is failed (state = {})",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: 2,
            max_backoff_secs: None,
        }
    }

    fn processing_job(max_retries: u32) -> Job {
        let mut job = Job::new(JobId::from("job-1"), "echo hi", max_retries, t0()).unwrap();
        job.mark_processing(t0()).unwrap();
        job
    }

    #[test]
    fn new_job_is_pending_with_no_attempts() {
        let job = Job::new(JobId::from("job-1"), "echo hi", 3, t0()).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn new_job_rejects_empty_command_and_zero_budget() {
        assert!(matches!(
            Job::new(JobId::from("a"), "  ", 3, t0()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Job::new(JobId::from("a"), "true", 0, t0()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn state_tags_parse_both_ways() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("DEAD".parse::<JobState>().unwrap(), JobState::Dead);
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn success_completes_and_clears_error() {
        let mut job = processing_job(3);
        job.error_message = Some("earlier".into());

        let t = job
            .apply_result(&JobResult::success("ok"), &policy(), t0() + Duration::seconds(1))
            .unwrap();

        assert_eq!(t, Transition::Completed);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.error_message, None);
        assert_eq!(job.updated_at, t0() + Duration::seconds(1));
    }

    #[test]
    fn three_failures_walk_to_dead() {
        let mut job = processing_job(3);

        let t = job.apply_result(&JobResult::failure("boom 1"), &policy(), t0()).unwrap();
        assert_eq!(
            t,
            Transition::Retrying {
                next_retry_at: t0() + Duration::seconds(2)
            }
        );
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);

        let now = t0() + Duration::seconds(2);
        job.promote(now).unwrap();
        job.mark_processing(now).unwrap();
        let t = job.apply_result(&JobResult::failure("boom 2"), &policy(), now).unwrap();
        assert_eq!(
            t,
            Transition::Retrying {
                next_retry_at: now + Duration::seconds(4)
            }
        );
        assert_eq!(job.attempts, 2);

        let now = now + Duration::seconds(4);
        job.promote(now).unwrap();
        job.mark_processing(now).unwrap();
        let t = job.apply_result(&JobResult::failure("boom 3"), &policy(), now).unwrap();
        assert_eq!(t, Transition::DeadLettered);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.error_message.as_deref(), Some("boom 3"));
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn single_attempt_budget_dies_on_first_failure() {
        let mut job = processing_job(1);
        let t = job.apply_result(&JobResult::failure("nope"), &policy(), t0()).unwrap();
        assert_eq!(t, Transition::DeadLettered);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn results_only_apply_to_processing_jobs() {
        let mut job = Job::new(JobId::from("job-1"), "true", 3, t0()).unwrap();
        let err = job
            .apply_result(&JobResult::success(""), &policy(), t0())
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Completed
            }
        );
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn promote_requires_failed() {
        let mut job = Job::new(JobId::from("job-1"), "true", 3, t0()).unwrap();
        assert!(job.promote(t0()).is_err());
    }

    #[test]
    fn reset_dead_restores_budget() {
        let mut job = processing_job(1);
        job.apply_result(&JobResult::failure("x"), &policy(), t0()).unwrap();

        job.reset_dead(t0() + Duration::seconds(5)).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error_message, None);
        assert_eq!(job.next_retry_at, None);
    }

    #[test]
    fn reset_rejects_non_dead_and_leaves_job_unchanged() {
        let mut job = processing_job(3);
        job.apply_result(&JobResult::failure("x"), &policy(), t0()).unwrap();
        let before = job.clone();

        assert!(job.reset_dead(t0()).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn updated_at_never_goes_backwards() {
        let mut job = processing_job(3);
        job.apply_result(&JobResult::success(""), &policy(), t0() - Duration::hours(1))
            .unwrap();
        assert_eq!(job.updated_at, t0());
    }

    #[test]
    fn retry_due_only_after_next_retry_at() {
        let mut job = processing_job(3);
        job.apply_result(&JobResult::failure("x"), &policy(), t0()).unwrap();
        assert!(!job.is_retry_due(t0() + Duration::seconds(1)));
        assert!(job.is_retry_due(t0() + Duration::seconds(2)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: attempts equals the number of failures applied, never
        /// decreases, and the job is dead exactly when the budget is spent.
        #[test]
        fn attempts_track_failures(
            max_retries in 1u32..8,
            outcomes in prop::collection::vec(any::<bool>(), 1..20),
        ) {
            let mut job = Job::new(JobId::from("p"), "true", max_retries, t0()).unwrap();
            let mut now = t0();
            let mut failures = 0u32;

            for succeed in outcomes {
                match job.state {
                    JobState::Pending => job.mark_processing(now).unwrap(),
                    JobState::Failed => {
                        now = job.next_retry_at.unwrap();
                        job.promote(now).unwrap();
                        job.mark_processing(now).unwrap();
                    }
                    _ => break,
                }

                let before = job.attempts;
                let result = if succeed {
                    JobResult::success("ok")
                } else {
                    failures += 1;
                    JobResult::failure("fail")
                };
                let transition = job.apply_result(&result, &policy(), now).unwrap();

                prop_assert!(job.attempts >= before);
                prop_assert_eq!(job.attempts, failures);
                prop_assert!(job.check_invariants().is_ok());
                prop_assert_eq!(
                    transition == Transition::DeadLettered,
                    !succeed && failures >= max_retries
                );
            }
        }
    }
}
