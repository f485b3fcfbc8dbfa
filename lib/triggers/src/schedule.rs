//! ISO-8601 repeating intervals, used by the cron trigger kind to derive its
//! next firing instant.
//!
//! The source represents a cron trigger's periodicity as an ISO-8601 repeating
//! interval (`R/<duration>`, e.g. `R/PT1H` for hourly). This module parses the
//! duration component of that grammar and turns it into a `chrono::Duration` so
//! `Advance()` can replace `nextRunStart` with `periodicity.after(now)`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ScheduleError;

/// Approximate day-counts used to resolve the calendar components (`Y`, `M`,
/// `W`) of an ISO-8601 duration into a fixed `chrono::Duration`. The core has
/// no calendar of its own; a trigger that needs exact calendar semantics
/// (e.g. "the first of every month") is out of scope for the cron kind as
/// specified.
const DAYS_PER_YEAR: i64 = 365;
const DAYS_PER_MONTH: i64 = 30;

/// An ISO-8601 repeating interval with an unbounded repeat count, e.g.
/// `R/PT1H` (hourly) or `R/P1D` (daily).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Periodicity {
    interval: Duration,
}

impl Periodicity {
    /// Builds a periodicity directly from a duration, bypassing parsing.
    #[must_use]
    pub fn from_duration(interval: Duration) -> Self {
        Self { interval }
    }

    /// Parses an ISO-8601 repeating interval string.
    ///
    /// Accepts both the full `R/PnYnMnDTnHnMnS` form and a bare
    /// `PnYnMnDTnHnMnS` duration (the repeat-count prefix is optional since
    /// the core always repeats indefinitely).
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidPeriodicity`] if the string is not a
    /// recognised ISO-8601 duration, or if the parsed interval is zero or
    /// negative (a trigger that never advances would fire on every tick).
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let duration_part = raw.strip_prefix("R/").unwrap_or(raw);
        let duration_part = duration_part
            .split('/')
            .next_back()
            .unwrap_or(duration_part);
        let interval = parse_iso8601_duration(duration_part).ok_or_else(|| {
            ScheduleError::InvalidPeriodicity {
                raw: raw.to_string(),
            }
        })?;
        if interval <= Duration::zero() {
            return Err(ScheduleError::InvalidPeriodicity {
                raw: raw.to_string(),
            });
        }
        Ok(Self { interval })
    }

    /// The next instant strictly after `now`, per the periodicity.
    ///
    /// Always computed from `now`, not from the previous `nextRunStart`, so
    /// missed ticks do not accumulate: a trigger that was due three periods
    /// ago fires once and resumes on the ordinary cadence.
    #[must_use]
    pub fn after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.interval
    }

    /// The underlying interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl fmt::Display for Periodicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R/{}", format_iso8601_duration(self.interval))
    }
}

impl FromStr for Periodicity {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Periodicity {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Periodicity> for String {
    fn from(value: Periodicity) -> Self {
        value.to_string()
    }
}

/// Parses the `PnYnMnDTnHnMnS` duration component of an ISO-8601 interval.
fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let s = s.strip_prefix('P')?;
    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let mut total = Duration::zero();
    let mut found_any = false;

    let mut consume = |part: &str, unit_days: Option<i64>, unit: &str| -> Option<()> {
        if let Some(value_str) = part.strip_suffix(unit) {
            let value: i64 = value_str.parse().ok()?;
            found_any = true;
            total += match unit_days {
                Some(days) => Duration::days(value * days),
                None => Duration::zero(),
            };
            Some(())
        } else {
            None
        }
    };

    let mut remaining = date_part;
    for (unit, days) in [("Y", DAYS_PER_YEAR), ("M", DAYS_PER_MONTH), ("W", 7), ("D", 1)] {
        if let Some(idx) = find_unit_boundary(remaining, unit) {
            let (value_part, rest) = remaining.split_at(idx + 1);
            consume(value_part, Some(days), unit)?;
            remaining = rest;
        }
    }
    if !remaining.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        let mut remaining = time_part;
        for unit in ["H", "M", "S"] {
            if let Some(idx) = find_unit_boundary(remaining, unit) {
                let (value_part, rest) = remaining.split_at(idx + 1);
                let value_str = value_part.strip_suffix(unit)?;
                let value: i64 = value_str.parse().ok()?;
                found_any = true;
                total += match unit {
                    "H" => Duration::hours(value),
                    "M" => Duration::minutes(value),
                    "S" => Duration::seconds(value),
                    _ => unreachable!(),
                };
                remaining = rest;
            }
        }
        if !remaining.is_empty() {
            return None;
        }
    }

    found_any.then_some(total)
}

fn find_unit_boundary(s: &str, unit: &str) -> Option<usize> {
    s.find(unit)
}

fn format_iso8601_duration(duration: Duration) -> String {
    let total_seconds = duration.num_seconds();
    if total_seconds % 86400 == 0 && total_seconds > 0 {
        format!("P{}D", total_seconds / 86400)
    } else if total_seconds % 3600 == 0 {
        format!("PT{}H", total_seconds / 3600)
    } else if total_seconds % 60 == 0 {
        format!("PT{}M", total_seconds / 60)
    } else {
        format!("PT{total_seconds}S")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hourly() {
        let p = Periodicity::parse("R/PT1H").expect("parses");
        assert_eq!(p.interval(), Duration::hours(1));
    }

    #[test]
    fn parses_bare_duration_without_repeat_prefix() {
        let p = Periodicity::parse("P1D").expect("parses");
        assert_eq!(p.interval(), Duration::days(1));
    }

    #[test]
    fn parses_combined_date_and_time() {
        let p = Periodicity::parse("R/P1DT2H30M").expect("parses");
        assert_eq!(p.interval(), Duration::days(1) + Duration::hours(2) + Duration::minutes(30));
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(Periodicity::parse("R/PT0S").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Periodicity::parse("not-a-duration").is_err());
        assert!(Periodicity::parse("R/P").is_err());
    }

    #[test]
    fn after_advances_from_now_not_from_missed_ticks() {
        let p = Periodicity::parse("R/PT1H").expect("parses");
        let now = DateTime::parse_from_rfc3339("2026-07-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = p.after(now);
        assert_eq!(next, now + Duration::hours(1));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let p = Periodicity::parse("R/PT1H").expect("parses");
        let rendered = p.to_string();
        let reparsed = Periodicity::parse(&rendered).expect("reparses");
        assert_eq!(p, reparsed);
    }

    #[test]
    fn serde_round_trip() {
        let p = Periodicity::parse("R/P1D").expect("parses");
        let json = serde_json::to_string(&p).expect("serialize");
        let back: Periodicity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(p, back);
    }
}
