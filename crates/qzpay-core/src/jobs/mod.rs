//! Job scheduling primitives
//!
//! The deferred-action model behind the lifecycle triggers: job records
//! with a pending/scheduled -> running -> terminal lifecycle, worker
//! pick-up ordering, exponential retry backoff and the named cron
//! schedules that seed the recurring billing work.

pub mod job;
pub mod retry;
pub mod schedule;

pub use job::{sort_by_priority, Job, JobPriority, JobStatus, JobType};
pub use retry::RetryDelay;
pub use schedule::{default_schedules, ScheduleDescriptor};
