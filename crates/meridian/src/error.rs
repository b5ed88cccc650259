//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Timezone name is not a known IANA zone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Invalid job configuration.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// Calendar arithmetic produced no valid local time.
    #[error("no valid local time: {0}")]
    InvalidCalendar(String),

    /// Job execution failed.
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),
}
