use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use tracing::info;

use crate::error::{Error, Result};

/// How the date window of a job is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    /// First to last day of the invocation month, ignoring configured dates.
    CurrentMonth,
    /// `start_date`/`end_date` from the configuration.
    Custom,
}

/// Inclusive calendar date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::config(format!("start date {start} is after end date {end}")));
        }
        Ok(Self { start, end })
    }

    /// Every day in the window, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// First and last day of the month containing `today`.
pub fn month_bounds(today: NaiveDate) -> DateRange {
    let start = today.with_day(1).unwrap_or(today);
    let (y, m) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    let end = NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|next| next.pred_opt())
        .unwrap_or(today);
    DateRange { start, end }
}

/// Resolve the effective date window of a job.
///
/// `CurrentMonth` always wins over configured values and logs the override.
pub fn resolve_date_range(
    mode: DateMode,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<DateRange> {
    match mode {
        DateMode::CurrentMonth => {
            let range = month_bounds(today);
            info!(
                configured_start = ?start,
                configured_end = ?end,
                "current-month mode: overriding configured dates with {range}"
            );
            Ok(range)
        }
        DateMode::Custom => {
            let start = start.ok_or_else(|| Error::config("custom date mode requires start_date"))?;
            let end = end.ok_or_else(|| Error::config("custom date mode requires end_date"))?;
            DateRange::new(start, end)
        }
    }
}

/// Accepts `00z`, `6z`, `0`/`6`/`12`/`18` and `0000`/`0600`/`1200`/`1800`.
pub fn parse_zulu_hour(time: &str) -> Result<u32> {
    let t = time.trim();
    let t = t.strip_suffix(['z', 'Z']).unwrap_or(t);
    let n: i64 = t
        .parse()
        .map_err(|_| Error::config(format!("invalid run time value: {time}")))?;

    let hour = match n {
        0 | 6 | 12 | 18 => n as u32,
        600 => 6,
        1200 => 12,
        1800 => 18,
        _ => {
            return Err(Error::config(format!(
                "run time must be one of 00z,06z,12z,18z, got {time}"
            )));
        }
    };

    Ok(hour)
}

/// Forecast step in hours from `"6h"` or `"6"`.
pub fn parse_forecast_step(step: &str) -> Result<u32> {
    let s = step.trim();
    let s = s.strip_suffix(['h', 'H']).unwrap_or(s);
    s.parse::<u32>()
        .map_err(|_| Error::config(format!("invalid forecast time: {step}")))
}

/// Parse date inputs:
/// - "YYYYMMDD" or "YYYY-MM-DD"
/// - integer <= 0 means today + delta days
pub fn parse_date_like(s: &str, today: NaiveDate) -> Result<NaiveDate> {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        if n <= 0 {
            return Duration::try_days(n)
                .and_then(|delta| today.checked_add_signed(delta))
                .ok_or_else(|| Error::config(format!("date offset out of range: {trimmed}")));
        }
        if trimmed.len() == 8 {
            return NaiveDate::parse_from_str(trimmed, "%Y%m%d")
                .map_err(|_| Error::config(format!("invalid YYYYMMDD date: {trimmed}")));
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| Error::config(format!("unsupported date format: {trimmed}")))
}

/// Run timestamp of a forecast issued on `date` at `hour` UTC.
pub fn run_datetime(date: NaiveDate, hour: u32) -> Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, 0, 0)
        .single()
        .ok_or_else(|| Error::config(format!("invalid run datetime {date} {hour:02}z")))
}

/// Candidate run dates for latest-run probing, newest first.
///
/// Starts today if the run hour has already passed, otherwise yesterday, and goes back
/// `days` days.
pub fn latest_run_candidates(now: DateTime<Utc>, hour: u32, days: i64) -> Vec<NaiveDate> {
    let mut first = now.date_naive();
    if let Ok(dt) = run_datetime(first, hour) {
        if dt > now {
            first = first - Duration::days(1);
        }
    }
    (0..days).map(|i| first - Duration::days(i)).collect()
}
