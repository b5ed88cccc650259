//! Job scheduler implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::ScheduledJob;

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP_SECS: u64 = 60;

/// The job scheduler.
///
/// Owns a flat collection of jobs and dispatches the due ones in order of
/// their next-run instant, one at a time. Dispatch is synchronous; the
/// caller drives it by invoking [`Scheduler::run_pending`] periodically,
/// typically sleeping [`Scheduler::sleep_duration`] between rounds.
#[derive(Debug, Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the collection. No deduplication is performed.
    pub fn add_job(&mut self, job: ScheduledJob) {
        debug!(id = %job.id(), next_run = ?job.next_run(), "added job");
        self.jobs.push(job);
    }

    /// Jobs that are due at the current instant, in storage order. Each job
    /// is evaluated against "now" in its own timezone.
    pub fn pending_jobs(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.iter().filter(|job| job.is_due())
    }

    /// Dispatch every due job, earliest `next_run` first.
    ///
    /// A failure in one job is logged and does not stop the rest of the
    /// batch; nothing propagates to the caller.
    pub fn run_pending(&mut self) {
        let mut due: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_due())
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by_key(|&idx| self.jobs[idx].next_run());

        for idx in due {
            let job = &mut self.jobs[idx];
            info!(id = %job.id(), "running job");
            if let Err(e) = job.run() {
                error!(id = %job.id(), error = %e, "job failed");
            }
        }
    }

    /// The earliest upcoming run across all jobs, or `None` when the
    /// scheduler is empty or every job's series has ended. Meant for the
    /// external driving loop.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .filter_map(|job| job.next_run())
            .min()
            .map(|next| next.with_timezone(&Utc))
    }

    /// How long the driving loop should sleep before the next
    /// [`Scheduler::run_pending`] call, clamped to one second at the low
    /// end and one minute when nothing is scheduled.
    pub fn sleep_duration(&self) -> Duration {
        let secs = match self.next_run() {
            Some(next) => {
                let diff = (next - Utc::now()).num_seconds();
                (diff.max(MIN_SLEEP_SECS as i64) as u64).min(MAX_SLEEP_SECS)
            }
            None => MAX_SLEEP_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Number of jobs in the collection, terminal ones included.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the scheduler holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobFn, ScheduledJob, TimeUnit};
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use chrono_tz::{Tz, UTC};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn recorder(id: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> JobFn {
        Box::new(move || {
            log.lock().unwrap().push(id);
            Ok(())
        })
    }

    fn hourly_job(id: &str, job_func: JobFn) -> ScheduledJob {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        ScheduledJob::with_schedule(id, "UTC", 1, TimeUnit::Hours, start, None, None, job_func)
            .unwrap()
    }

    fn now_utc() -> chrono::DateTime<Tz> {
        Utc::now().with_timezone(&UTC)
    }

    #[test]
    fn new_scheduler_is_empty() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_run(), None);
        assert_eq!(scheduler.pending_jobs().count(), 0);
    }

    #[test]
    fn add_job_grows_the_collection() {
        let mut scheduler = Scheduler::new();
        scheduler.add_job(hourly_job("a", Box::new(|| Ok(()))));
        scheduler.add_job(hourly_job("a", Box::new(|| Ok(()))));
        // Duplicate ids are the caller's problem.
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn no_jobs_are_pending_before_their_time() {
        let mut scheduler = Scheduler::new();
        scheduler.add_job(hourly_job("a", Box::new(|| Ok(()))));
        // A freshly scheduled job's next_run is in the future.
        assert_eq!(scheduler.pending_jobs().count(), 0);

        scheduler.run_pending();
        assert_eq!(scheduler.pending_jobs().count(), 0);
    }

    #[test]
    fn pending_jobs_is_idempotent_between_dispatches() {
        let mut scheduler = Scheduler::new();
        let mut job = hourly_job("a", Box::new(|| Ok(())));
        job.set_next_run(Some(now_utc() - ChronoDuration::minutes(5)));
        scheduler.add_job(job);

        let first: Vec<String> = scheduler
            .pending_jobs()
            .map(|j| j.id().to_string())
            .collect();
        let second: Vec<String> = scheduler
            .pending_jobs()
            .map(|j| j.id().to_string())
            .collect();
        assert_eq!(first, vec!["a"]);
        assert_eq!(first, second);
    }

    #[test]
    fn run_pending_dispatches_earliest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = now_utc();
        let mut scheduler = Scheduler::new();

        // Insert out of order; due times say c, a, b.
        let mut a = hourly_job("a", recorder("a", Arc::clone(&log)));
        a.set_next_run(Some(now - ChronoDuration::hours(2)));
        let mut b = hourly_job("b", recorder("b", Arc::clone(&log)));
        b.set_next_run(Some(now - ChronoDuration::hours(1)));
        let mut c = hourly_job("c", recorder("c", Arc::clone(&log)));
        c.set_next_run(Some(now - ChronoDuration::hours(3)));
        scheduler.add_job(a);
        scheduler.add_job(b);
        scheduler.add_job(c);

        scheduler.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn a_failing_job_does_not_stop_the_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = now_utc();
        let mut scheduler = Scheduler::new();

        let mut first = hourly_job("first", recorder("first", Arc::clone(&log)));
        first.set_next_run(Some(now - ChronoDuration::hours(3)));
        let mut failing = hourly_job("failing", Box::new(|| Err("boom".to_string())));
        failing.set_next_run(Some(now - ChronoDuration::hours(2)));
        let mut last = hourly_job("last", recorder("last", Arc::clone(&log)));
        last.set_next_run(Some(now - ChronoDuration::hours(1)));
        scheduler.add_job(first);
        scheduler.add_job(failing);
        scheduler.add_job(last);

        scheduler.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);
    }

    #[test]
    fn dispatch_reschedules_each_job_past_now() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut job = hourly_job(
            "a",
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        job.set_next_run(Some(now_utc() - ChronoDuration::hours(1)));

        let mut scheduler = Scheduler::new();
        scheduler.add_job(job);

        scheduler.run_pending();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The job has been pushed into the future; a second round is a no-op.
        scheduler.run_pending();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_jobs_are_never_dispatched() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let job = ScheduledJob::with_schedule(
            "ended",
            "UTC",
            1,
            TimeUnit::Weeks,
            start,
            Some(end),
            None,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        assert!(job.next_run().is_none());

        let mut scheduler = Scheduler::new();
        scheduler.add_job(job);

        scheduler.run_pending();
        scheduler.run_pending();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.next_run(), None);
    }

    #[test]
    fn next_run_is_the_minimum_across_jobs() {
        let now = now_utc();
        let mut scheduler = Scheduler::new();

        let mut near = hourly_job("near", Box::new(|| Ok(())));
        near.set_next_run(Some(now + ChronoDuration::minutes(5)));
        let mut far = hourly_job("far", Box::new(|| Ok(())));
        far.set_next_run(Some(now + ChronoDuration::hours(5)));
        scheduler.add_job(far);
        scheduler.add_job(near);

        let next = scheduler.next_run().unwrap();
        assert_eq!(next, (now + ChronoDuration::minutes(5)).with_timezone(&Utc));
    }

    #[test]
    fn sleep_duration_is_clamped() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(60));

        let mut overdue = hourly_job("overdue", Box::new(|| Ok(())));
        overdue.set_next_run(Some(now_utc() - ChronoDuration::hours(1)));
        scheduler.add_job(overdue);
        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(1));

        let mut soon = hourly_job("soon", Box::new(|| Ok(())));
        soon.set_next_run(Some(now_utc() + ChronoDuration::seconds(30)));
        let mut scheduler = Scheduler::new();
        scheduler.add_job(soon);
        let secs = scheduler.sleep_duration().as_secs();
        assert!((1..=30).contains(&secs), "slept {secs}s");
    }
}
