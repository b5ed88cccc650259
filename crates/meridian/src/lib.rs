//! Timezone-aware recurring job scheduler.
//!
//! This crate provides an in-process scheduling primitive that:
//! - Computes recurring invocation times in each job's own IANA timezone
//! - Drift-corrects jobs whose theoretical next run fell behind the clock
//!   (a daily 09:15 job that missed a week resumes at the next 09:15
//!   instead of replaying every missed day)
//! - Dispatches due jobs earliest-first with per-job failure isolation
//!
//! The scheduler is synchronous and single-threaded; an external loop
//! drives it by calling [`Scheduler::run_pending`] periodically, sleeping
//! [`Scheduler::sleep_duration`] between rounds.

mod error;
mod recurrence;
mod scheduler;
mod types;

pub use error::SchedulerError;
pub use recurrence::{Recurrence, TimeUnit};
pub use scheduler::Scheduler;
pub use types::{JobFn, ScheduledJob};
