//! Next-occurrence computation for recurring jobs.
//!
//! The interesting part is drift correction: when a job's theoretical next
//! run has fallen behind the clock (the process was down, or a batch ran
//! long), the candidate is realigned to the current calendar bucket for its
//! unit instead of replaying every missed occurrence.

use std::fmt;
use std::str::FromStr;

use chrono::offset::LocalResult;
use chrono::{
    DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Units a recurrence interval can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl TimeUnit {
    /// Shift `t` forward by `n` of this unit.
    ///
    /// Days, weeks and months move the calendar date and keep the local
    /// wall-clock time across DST transitions; the sub-day units are
    /// absolute offsets. Month arithmetic clamps to the last valid day of
    /// the target month (Jan 31 + 1 month = Feb 28/29).
    pub(crate) fn shift(self, t: DateTime<Tz>, n: u32) -> Option<DateTime<Tz>> {
        match self {
            TimeUnit::Seconds => t.checked_add_signed(Duration::seconds(i64::from(n))),
            TimeUnit::Minutes => t.checked_add_signed(Duration::minutes(i64::from(n))),
            TimeUnit::Hours => t.checked_add_signed(Duration::hours(i64::from(n))),
            TimeUnit::Days => t.checked_add_days(Days::new(u64::from(n))),
            TimeUnit::Weeks => t.checked_add_days(Days::new(7 * u64::from(n))),
            TimeUnit::Months => t.checked_add_months(Months::new(n)),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
        };
        f.write_str(name)
    }
}

impl FromStr for TimeUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds" => Ok(TimeUnit::Seconds),
            "minutes" => Ok(TimeUnit::Minutes),
            "hours" => Ok(TimeUnit::Hours),
            "days" => Ok(TimeUnit::Days),
            "weeks" => Ok(TimeUnit::Weeks),
            "months" => Ok(TimeUnit::Months),
            other => Err(SchedulerError::InvalidConfig(format!(
                "unknown time unit: {other}"
            ))),
        }
    }
}

/// A recurrence pattern: every `interval` `unit`s from `start`, optionally
/// ending at `end`. All instants are in the owning job's timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct Recurrence {
    pub(crate) start: DateTime<Tz>,
    pub(crate) interval: u32,
    pub(crate) unit: TimeUnit,
    pub(crate) end: Option<DateTime<Tz>>,
}

impl Recurrence {
    /// Create a recurrence pattern. The interval must be at least 1.
    pub fn new(
        start: DateTime<Tz>,
        interval: u32,
        unit: TimeUnit,
        end: Option<DateTime<Tz>>,
    ) -> Result<Self, SchedulerError> {
        if interval == 0 {
            return Err(SchedulerError::InvalidConfig(
                "interval must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            start,
            interval,
            unit,
            end,
        })
    }

    /// Compute the next occurrence relative to `now`.
    ///
    /// With no prior run the candidate is the series start; otherwise it is
    /// the last run shifted forward by one full interval. A candidate that
    /// has fallen behind `now` is realigned to the current calendar bucket
    /// for the unit, keeping its sub-bucket offset; if the aligned instant
    /// has already passed it is stepped forward by a single unit.
    ///
    /// Returns `Ok(None)` when the series has ended (`end` is set and the
    /// final candidate exceeds it).
    pub fn next_occurrence(
        &self,
        last_run: Option<DateTime<Tz>>,
        now: DateTime<Tz>,
    ) -> Result<Option<DateTime<Tz>>, SchedulerError> {
        let mut candidate = match last_run {
            None => self.start,
            Some(last) => self
                .unit
                .shift(last, self.interval)
                .ok_or_else(|| out_of_range(last, self.unit))?,
        };

        if candidate < now {
            candidate = self.align_to_current_bucket(candidate, now)?;
        }

        // Alignment can still undershoot (today's 09:15 already went by);
        // step forward one unit, not a full interval.
        if candidate < now {
            candidate = self
                .unit
                .shift(candidate, 1)
                .ok_or_else(|| out_of_range(candidate, self.unit))?;
        }

        match self.end {
            Some(end) if candidate > end => Ok(None),
            _ => Ok(Some(candidate)),
        }
    }

    /// Replace the calendar fields above the unit's granularity with `now`'s,
    /// keeping the candidate's sub-bucket offset. A monthly job keeps its
    /// day and time of day but jumps to the current year and month; a daily
    /// job keeps its time of day but jumps to today; and so on.
    fn align_to_current_bucket(
        &self,
        candidate: DateTime<Tz>,
        now: DateTime<Tz>,
    ) -> Result<DateTime<Tz>, SchedulerError> {
        let tz = candidate.timezone();
        let aligned = match self.unit {
            TimeUnit::Months => NaiveDate::from_ymd_opt(now.year(), now.month(), candidate.day())
                .map(|d| d.and_time(candidate.time()))
                .and_then(|local| resolve_local(tz, local)),
            TimeUnit::Weeks => {
                let same_year =
                    NaiveDate::from_ymd_opt(now.year(), candidate.month(), candidate.day())
                        .map(|d| d.and_time(candidate.time()))
                        .and_then(|local| resolve_local(tz, local));
                match same_year {
                    // ISO week numbers can run backwards across the year
                    // boundary; the shift is signed either way.
                    Some(c) if c < now => {
                        let weeks =
                            i64::from(now.iso_week().week()) - i64::from(c.iso_week().week());
                        shift_weeks(c, weeks)
                    }
                    other => other,
                }
            }
            TimeUnit::Days => resolve_local(tz, now.date_naive().and_time(candidate.time())),
            TimeUnit::Hours => NaiveTime::from_hms_nano_opt(
                now.hour(),
                candidate.minute(),
                candidate.second(),
                candidate.nanosecond(),
            )
            .map(|t| now.date_naive().and_time(t))
            .and_then(|local| resolve_local(tz, local)),
            TimeUnit::Minutes => NaiveTime::from_hms_nano_opt(
                now.hour(),
                now.minute(),
                candidate.second(),
                candidate.nanosecond(),
            )
            .map(|t| now.date_naive().and_time(t))
            .and_then(|local| resolve_local(tz, local)),
            TimeUnit::Seconds => NaiveTime::from_hms_nano_opt(
                now.hour(),
                now.minute(),
                now.second(),
                candidate.nanosecond(),
            )
            .map(|t| now.date_naive().and_time(t))
            .and_then(|local| resolve_local(tz, local)),
        };

        aligned.ok_or_else(|| {
            SchedulerError::InvalidCalendar(format!(
                "no valid {} occurrence of {candidate} in the period of {now}",
                self.unit
            ))
        })
    }
}

/// Map a wall-clock value into the zone. Ambiguous local times (DST
/// fall-back) resolve to the earlier instant; nonexistent local times (DST
/// spring-forward gap) map to `None`.
pub(crate) fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

fn shift_weeks(t: DateTime<Tz>, weeks: i64) -> Option<DateTime<Tz>> {
    let days = weeks.unsigned_abs().checked_mul(7)?;
    if weeks >= 0 {
        t.checked_add_days(Days::new(days))
    } else {
        t.checked_sub_days(Days::new(days))
    }
}

fn out_of_range(t: DateTime<Tz>, unit: TimeUnit) -> SchedulerError {
    SchedulerError::InvalidCalendar(format!("cannot shift {t} forward in {unit}"))
}
