//! Scheduled job type and per-job recurrence state.

use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::recurrence::resolve_local;
use crate::{Recurrence, SchedulerError, TimeUnit};

/// The job closure. Takes no arguments; an `Err` raised during dispatch is
/// logged and suppressed at the scheduler boundary.
pub type JobFn = Box<dyn FnMut() -> Result<(), String> + Send>;

/// A recurring job.
///
/// All scheduling arithmetic for a job happens in its own IANA timezone;
/// jobs in different zones can coexist in one scheduler.
pub struct ScheduledJob {
    id: String,
    tz: Tz,
    recurrence: Recurrence,
    /// Instant of the most recently dispatched run.
    last_run: Option<DateTime<Tz>>,
    /// Instant of the next scheduled run; `None` once the series has ended.
    next_run: Option<DateTime<Tz>>,
    job_func: JobFn,
}

impl ScheduledJob {
    /// Create a job whose series starts at the current instant in `timezone`.
    pub fn new(
        id: impl Into<String>,
        timezone: &str,
        interval: u32,
        unit: TimeUnit,
        job_func: JobFn,
    ) -> Result<Self, SchedulerError> {
        let tz = parse_timezone(timezone)?;
        let start = Utc::now().with_timezone(&tz);
        let recurrence = Recurrence::new(start, interval, unit, None)?;
        Self::build(id.into(), tz, recurrence, None, job_func)
    }

    /// Create a job with an explicit schedule.
    ///
    /// `start`, `end` and `last_run` are wall-clock values interpreted in
    /// `timezone`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_schedule(
        id: impl Into<String>,
        timezone: &str,
        interval: u32,
        unit: TimeUnit,
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        last_run: Option<NaiveDateTime>,
        job_func: JobFn,
    ) -> Result<Self, SchedulerError> {
        let tz = parse_timezone(timezone)?;
        let start = in_zone(tz, start)?;
        let end = end.map(|e| in_zone(tz, e)).transpose()?;
        let last_run = last_run.map(|l| in_zone(tz, l)).transpose()?;
        let recurrence = Recurrence::new(start, interval, unit, end)?;
        Self::build(id.into(), tz, recurrence, last_run, job_func)
    }

    fn build(
        id: String,
        tz: Tz,
        recurrence: Recurrence,
        last_run: Option<DateTime<Tz>>,
        job_func: JobFn,
    ) -> Result<Self, SchedulerError> {
        let mut job = Self {
            id,
            tz,
            recurrence,
            last_run,
            next_run: None,
            job_func,
        };
        job.schedule_next_run()?;
        Ok(job)
    }

    /// Caller-assigned identifier. Uniqueness is the caller's responsibility.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The job's timezone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The recurrence unit.
    pub fn unit(&self) -> TimeUnit {
        self.recurrence.unit
    }

    /// The recurrence interval, in units.
    pub fn interval(&self) -> u32 {
        self.recurrence.interval
    }

    /// Instant of the next scheduled run, or `None` once the series has
    /// ended.
    pub fn next_run(&self) -> Option<DateTime<Tz>> {
        self.next_run
    }

    /// Instant of the most recently dispatched run.
    pub fn last_run(&self) -> Option<DateTime<Tz>> {
        self.last_run
    }

    /// Whether the job is due at `now`.
    pub fn is_due_at(&self, now: DateTime<Tz>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }

    /// Whether the job is due at the current instant.
    pub fn is_due(&self) -> bool {
        self.is_due_at(self.now())
    }

    /// The next occurrence relative to an explicit reference instant,
    /// without mutating the job.
    pub fn next_occurrence_after(
        &self,
        now: DateTime<Tz>,
    ) -> Result<Option<DateTime<Tz>>, SchedulerError> {
        self.recurrence.next_occurrence(self.last_run, now)
    }

    /// Dispatch the job: advance `last_run`, recompute `next_run`, then
    /// invoke the job closure.
    ///
    /// The recurrence advances before the closure runs, so a failed run is
    /// never retried; the next due run is the next scheduled occurrence.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        self.last_run = self.next_run;
        self.schedule_next_run()?;
        (self.job_func)().map_err(SchedulerError::ExecutionFailed)
    }

    /// Pin the wall-clock time of day the job fires. Valid for day, week
    /// and month schedules.
    pub fn at_time(&mut self, hour: u32, minute: u32) -> Result<(), SchedulerError> {
        if !matches!(
            self.recurrence.unit,
            TimeUnit::Days | TimeUnit::Weeks | TimeUnit::Months
        ) {
            return Err(SchedulerError::InvalidConfig(format!(
                "at_time requires a days, weeks or months schedule, not {}",
                self.recurrence.unit
            )));
        }
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            SchedulerError::InvalidConfig(format!("invalid time of day {hour:02}:{minute:02}"))
        })?;
        let local = self.recurrence.start.date_naive().and_time(time);
        self.recurrence.start = in_zone(self.tz, local)?;
        self.schedule_next_run()
    }

    /// Pin the day of month the job fires. Valid for month schedules only.
    pub fn at_day_of_month(&mut self, day: u32) -> Result<(), SchedulerError> {
        if self.recurrence.unit != TimeUnit::Months {
            return Err(SchedulerError::InvalidConfig(format!(
                "at_day_of_month requires a months schedule, not {}",
                self.recurrence.unit
            )));
        }
        if !(1..=31).contains(&day) {
            return Err(SchedulerError::InvalidConfig(format!(
                "invalid day of month: {day}"
            )));
        }
        let start = self.recurrence.start;
        let date = NaiveDate::from_ymd_opt(start.year(), start.month(), day).ok_or_else(|| {
            SchedulerError::InvalidCalendar(format!(
                "day {day} does not exist in {:04}-{:02}",
                start.year(),
                start.month()
            ))
        })?;
        self.recurrence.start = in_zone(self.tz, date.and_time(start.time()))?;
        self.schedule_next_run()
    }

    /// Move the series anchor forward to the given weekday, keeping it in
    /// place if already on that weekday. Valid for week schedules only.
    pub fn at_weekday(&mut self, weekday: Weekday) -> Result<(), SchedulerError> {
        if self.recurrence.unit != TimeUnit::Weeks {
            return Err(SchedulerError::InvalidConfig(format!(
                "at_weekday requires a weeks schedule, not {}",
                self.recurrence.unit
            )));
        }
        let start = self.recurrence.start;
        let ahead =
            (weekday.num_days_from_monday() + 7 - start.weekday().num_days_from_monday()) % 7;
        self.recurrence.start = start
            .checked_add_days(Days::new(u64::from(ahead)))
            .ok_or_else(|| {
                SchedulerError::InvalidCalendar(format!("cannot move {start} to {weekday}"))
            })?;
        self.schedule_next_run()
    }

    /// Recompute `next_run` against the current instant in the job's zone.
    fn schedule_next_run(&mut self) -> Result<(), SchedulerError> {
        let now = self.now();
        self.next_run = self.recurrence.next_occurrence(self.last_run, now)?;
        Ok(())
    }

    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    #[cfg(test)]
    pub(crate) fn set_next_run(&mut self, next: Option<DateTime<Tz>>) {
        self.next_run = next;
    }
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("id", &self.id)
            .field("tz", &self.tz)
            .field("recurrence", &self.recurrence)
            .field("last_run", &self.last_run)
            .field("next_run", &self.next_run)
            .finish_non_exhaustive()
    }
}

fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

fn in_zone(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Tz>, SchedulerError> {
    resolve_local(tz, local)
        .ok_or_else(|| SchedulerError::InvalidCalendar(format!("{local} does not exist in {tz}")))
}
