//! Evaluation of 5 field cron expressions.
//!
//! Expressions use the classic Unix layout `minute hour day month weekday`, with weekdays
//! numbered `0`-`7` where both `0` and `7` are Sunday. All times are UTC.
//!
//! Evaluation favours availability over precision: only an expression without exactly five
//! fields is rejected, and even then callers are expected to fall back to
//! [`FALLBACK_DELAY`] via [`next_run_or_fallback`]. A five field expression which cannot be
//! parsed also yields the fallback.
//!
//! # Example
//!
//! ```
//! # use chrono::{TimeZone, Utc};
//! use cronwarden::schedule;
//!
//! let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 0).unwrap();
//! let next = schedule::next_run_after("*/5 * * * *", now).unwrap();
//!
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 10, 0).unwrap());
//! assert_eq!(schedule::describe("*/5 * * * *"), "Every 5 minutes");
//! ```
use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// The delay used when no better next run time can be computed.
pub const FALLBACK_DELAY: TimeDelta = TimeDelta::hours(1);

const FIELD_COUNT: usize = 5;
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid cron expression '{expression}': expected 5 fields, found {fields}")]
pub struct InvalidScheduleError {
    pub expression: String,
    pub fields: usize,
}

/// A parsed cron expression.
///
/// Parsing only fails when the expression does not have five fields. If the fields themselves
/// cannot be understood the schedule is kept but [`CronSchedule::is_evaluable`] returns `false`
/// and [`CronSchedule::next_after`] falls back to [`FALLBACK_DELAY`].
///
/// When both the day of month and the weekday are restricted an instant matches if either of
/// them does, as with Unix cron.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    inner: Option<Vec<cron::Schedule>>,
}

impl FromStr for CronSchedule {
    type Err = InvalidScheduleError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields = expression.split_whitespace().collect::<Vec<_>>();
        if fields.len() != FIELD_COUNT {
            return Err(InvalidScheduleError {
                expression: expression.to_owned(),
                fields: fields.len(),
            });
        }
        let inner = to_evaluator_expressions(&fields).and_then(|expressions| {
            expressions
                .iter()
                .map(|expression| cron::Schedule::from_str(expression).ok())
                .collect::<Option<Vec<_>>>()
        });
        Ok(Self {
            expression: fields.join(" "),
            inner,
        })
    }
}

impl CronSchedule {
    /// The normalised expression, fields separated by single spaces.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_evaluable(&self) -> bool {
        self.inner.is_some()
    }

    /// The first matching instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.inner
            .iter()
            .flatten()
            .filter_map(|schedule| schedule.after(&now).next())
            .min()
            .unwrap_or_else(|| now + FALLBACK_DELAY)
    }

    /// A human readable description for common expressions, otherwise the raw expression.
    pub fn describe(&self) -> String {
        let fields = self.expression.split(' ').collect::<Vec<_>>();
        match fields.as_slice() {
            ["*", "*", "*", "*", "*"] => "Every minute".to_owned(),
            [minute, "*", "*", "*", "*"] if step(minute).is_some() => {
                format!("Every {} minutes", step(minute).unwrap_or_default())
            }
            ["0", "*", "*", "*", "*"] => "Every hour".to_owned(),
            ["0", hour, "*", "*", "*"] if step(hour).is_some() => {
                format!("Every {} hours", step(hour).unwrap_or_default())
            }
            ["0", "0", "*", "*", "*"] => "Daily at midnight".to_owned(),
            ["0", "12", "*", "*", "*"] => "Daily at noon".to_owned(),
            [minute, hour, "*", "*", "*"] => match (number(minute, 59), number(hour, 23)) {
                (Some(minute), Some(hour)) => format!("Daily at {hour:02}:{minute:02}"),
                _ => self.expression.clone(),
            },
            ["0", "0", "*", "*", "0" | "7"] => "Weekly on Sunday".to_owned(),
            ["0", "0", "1", "*", "*"] => "Monthly on the 1st".to_owned(),
            _ => self.expression.clone(),
        }
    }
}

impl Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// The next instant strictly after `now` matching `schedule`.
///
/// Only fails when `schedule` does not have five fields.
pub fn next_run_after(
    schedule: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, InvalidScheduleError> {
    Ok(schedule.parse::<CronSchedule>()?.next_after(now))
}

/// Like [`next_run_after`] but falls back to `now +` [`FALLBACK_DELAY`] on a malformed schedule.
pub fn next_run_or_fallback(schedule: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    next_run_after(schedule, now)
        .inspect_err(|error| {
            tracing::warn!(%error, "Falling back to a next run in {FALLBACK_DELAY}");
        })
        .unwrap_or_else(|_| now + FALLBACK_DELAY)
}

/// Whether `schedule` has five fields which can all be evaluated.
pub fn is_valid(schedule: &str) -> bool {
    schedule
        .parse::<CronSchedule>()
        .map(|schedule| schedule.is_evaluable())
        .unwrap_or(false)
}

/// A human readable description of `schedule`, echoing it when no description is known.
pub fn describe(schedule: &str) -> String {
    schedule
        .parse::<CronSchedule>()
        .map(|schedule| schedule.describe())
        .unwrap_or_else(|_| schedule.to_owned())
}

fn step(field: &str) -> Option<u32> {
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse().ok())
        .filter(|n| *n > 0)
}

fn number(field: &str, max: u32) -> Option<u32> {
    field.parse().ok().filter(|n| *n <= max)
}

/// The `cron` crate wants a seconds field and numbers weekdays from `1` (Sunday), so the
/// seconds are pinned to zero and weekday numbers are rewritten as names.
///
/// It also requires both day fields to match, so an expression restricting both is split into
/// one expression per day field.
fn to_evaluator_expressions(fields: &[&str]) -> Option<Vec<String>> {
    let &[minute, hour, day, month, weekday] = fields else {
        return None;
    };
    let restricted = is_restricted(day) && is_restricted(weekday);
    let weekday = normalise_weekday(weekday)?;
    let expression =
        |day: &str, weekday: &str| format!("0 {minute} {hour} {day} {month} {weekday}");
    if restricted {
        Some(vec![expression(day, "*"), expression("*", &weekday)])
    } else {
        Some(vec![expression(day, &weekday)])
    }
}

/// A field starting with `*` counts as unrestricted, even with a step.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

fn normalise_weekday(field: &str) -> Option<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(field.to_owned());
    }
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            range => match range.split_once('-') {
                Some((start, end)) => (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?),
                None if item.contains('/') => (range.parse::<u32>().ok()?, 6),
                None => {
                    let day = range.parse::<u32>().ok()?;
                    (day, day)
                }
            },
        };
        if start > end || end > 7 {
            return None;
        }
        days.extend((start..=end).step_by(step as usize).map(|day| day % 7));
    }
    Some(
        days.into_iter()
            .map(|day| WEEKDAY_NAMES[day as usize])
            .collect::<Vec<_>>()
            .join(","),
    )
}
