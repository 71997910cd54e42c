//! Job types and definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job priority levels. `Critical` is picked up first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl JobPriority {
    /// Pick-up rank; lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Critical => write!(f, "critical"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// What kind of deferred work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SubscriptionRenewal,
    SubscriptionTrialEnding,
    PaymentRetry,
    WebhookDelivery,
    InvoiceGeneration,
    PaymentMethodExpiryCheck,
    PayoutProcessing,
    Cleanup,
}

/// A deferred action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub payload: serde_json::Value,

    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub attempts: i32,
    pub max_attempts: i32,

    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            priority: JobPriority::default(),
            status: JobStatus::Pending,
            payload,
            scheduled_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// A worker may pick this job up
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Scheduled)
            && self.scheduled_at <= now
    }

    /// The job may be re-enqueued after a failure
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The job will never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Transition to running
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Transition to completed with a result
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.updated_at = now;
    }

    /// Record a failure: re-enqueued as pending when attempts remain,
    /// terminal `Failed` otherwise
    pub fn fail(&mut self, error: impl Into<String>, retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.failed_at = Some(now);
        self.updated_at = now;
        if self.can_retry() {
            self.status = JobStatus::Pending;
            if let Some(retry_at) = retry_at {
                self.scheduled_at = retry_at;
            }
        } else {
            self.status = JobStatus::Failed;
        }
    }
}

/// Worker pick-up order: priority rank, then `scheduled_at` ascending
pub fn sort_by_priority(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(a.scheduled_at.cmp(&b.scheduled_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn job(priority: JobPriority, scheduled_at: DateTime<Utc>) -> Job {
        Job::new(JobType::Cleanup, serde_json::json!({}), scheduled_at, now())
            .with_priority(priority)
    }

    #[test]
    fn test_is_ready() {
        let ready = job(JobPriority::Normal, now() - Duration::minutes(1));
        assert!(ready.is_ready(now()));

        let future = job(JobPriority::Normal, now() + Duration::minutes(1));
        assert!(!future.is_ready(now()));

        let mut running = job(JobPriority::Normal, now() - Duration::minutes(1));
        running.status = JobStatus::Running;
        assert!(!running.is_ready(now()));

        let mut scheduled = job(JobPriority::Normal, now() - Duration::minutes(1));
        scheduled.status = JobStatus::Scheduled;
        assert!(scheduled.is_ready(now()));
    }

    #[test]
    fn test_terminal_and_retry_predicates() {
        let mut j = job(JobPriority::Normal, now());
        assert!(!j.is_terminal());
        assert!(j.can_retry());

        j.attempts = 3;
        assert!(!j.can_retry());

        j.status = JobStatus::Completed;
        assert!(j.is_terminal());
        j.status = JobStatus::Canceled;
        assert!(j.is_terminal());
    }

    #[test]
    fn test_fail_requeues_until_attempts_exhausted() {
        let mut j = job(JobPriority::Normal, now());
        j.start(now());
        assert_eq!(j.attempts, 1);

        let retry_at = now() + Duration::minutes(5);
        j.fail("boom", Some(retry_at), now());
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.scheduled_at, retry_at);

        j.start(now());
        j.fail("boom", None, now());
        j.start(now());
        j.fail("boom", None, now());
        assert_eq!(j.attempts, 3);
        assert_eq!(j.status, JobStatus::Failed);
        assert!(j.is_terminal());
    }

    #[test]
    fn test_sort_by_priority_then_time() {
        let early = now() - Duration::minutes(10);
        let late = now();

        let mut jobs = vec![
            job(JobPriority::Low, early),
            job(JobPriority::Critical, late),
            job(JobPriority::Normal, early),
            job(JobPriority::Critical, early),
            job(JobPriority::High, late),
        ];
        sort_by_priority(&mut jobs);

        let order: Vec<(JobPriority, DateTime<Utc>)> =
            jobs.iter().map(|j| (j.priority, j.scheduled_at)).collect();
        assert_eq!(
            order,
            vec![
                (JobPriority::Critical, early),
                (JobPriority::Critical, late),
                (JobPriority::High, late),
                (JobPriority::Normal, early),
                (JobPriority::Low, early),
            ]
        );
    }
}
