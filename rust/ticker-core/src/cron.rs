//! Cron expression parsing and evaluation.
//!
//! Expressions have six fields with seconds granularity:
//! `second minute hour day month weekday`.
//!
//! Each field accepts `*`, `?`, single values, ranges (`1-5`), steps
//! (`*/10`, `5/15`, `10-40/5`) and comma separated lists of those. Months
//! accept `JAN`-`DEC`, weekdays accept `SUN`-`SAT`, and weekday `7` is an
//! alias for Sunday. Day-of-month and weekday must both match.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{
    DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

/// How far ahead the evaluator searches before declaring an expression dead.
const SEARCH_YEARS: i32 = 10;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Time zone in which cron expressions are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerTimeZone {
    /// Host local time.
    #[default]
    Local,
    /// Coordinated universal time. Recommended for multi-node clusters.
    Utc,
}

impl FromStr for SchedulerTimeZone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "utc" => Ok(Self::Utc),
            other => Err(format!("unknown time zone: {other} (expected 'local' or 'utc')")),
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    /// Second (0-59).
    second: CronField,
    /// Minute (0-59).
    minute: CronField,
    /// Hour (0-23).
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0).
    weekday: CronField,
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
}

impl CronField {
    fn insert_range(&mut self, start: u32, end: u32, step: u32) {
        let mut value = start;
        while value <= end {
            self.bits |= 1 << value;
            value += step;
        }
    }

    /// Check if the field matches the given value.
    fn matches(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    /// Smallest allowed value in `from..=max`.
    fn next(self, from: u32, max: u32) -> Option<u32> {
        (from..=max).find(|v| self.matches(*v))
    }

    fn values_from(self, from: u32, max: u32) -> impl Iterator<Item = u32> {
        (from..=max).filter(move |v| self.matches(*v))
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a six-field cron expression.
    ///
    /// # Examples
    ///
    /// - `*/10 * * * * *` - every ten seconds
    /// - `0 0 0 * * *` - daily at midnight
    /// - `0 30 9-17 * * MON-FRI` - half past every hour 9am-5pm, weekdays
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is invalid.
    pub fn parse(expr: &str) -> Result<CronExpression> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 6 {
            anyhow::bail!(
                "Cron expression must have 6 fields (second minute hour day month weekday), got {}",
                parts.len()
            );
        }

        let weekday = Self::parse_field(parts[5], 0, 7, Some(&WEEKDAY_NAMES))
            .context("Invalid weekday field")?;

        Ok(CronExpression {
            source: parts.join(" "),
            second: Self::parse_field(parts[0], 0, 59, None).context("Invalid second field")?,
            minute: Self::parse_field(parts[1], 0, 59, None).context("Invalid minute field")?,
            hour: Self::parse_field(parts[2], 0, 23, None).context("Invalid hour field")?,
            day: Self::parse_field(parts[3], 1, 31, None).context("Invalid day field")?,
            month: Self::parse_field(parts[4], 1, 12, Some(&MONTH_NAMES))
                .context("Invalid month field")?,
            weekday: Self::fold_sunday(weekday),
        })
    }

    /// Weekday 7 is Sunday.
    fn fold_sunday(mut field: CronField) -> CronField {
        if field.matches(7) {
            field.bits &= !(1 << 7);
            field.bits |= 1;
        }
        field
    }

    fn parse_field(field: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<CronField> {
        let mut parsed = CronField { bits: 0 };
        for item in field.split(',') {
            if item.is_empty() {
                anyhow::bail!("Empty list element in '{}'", field);
            }
            Self::parse_item(item, min, max, names, &mut parsed)?;
        }
        Ok(parsed)
    }

    fn parse_item(
        item: &str,
        min: u32,
        max: u32,
        names: Option<&[&str]>,
        out: &mut CronField,
    ) -> Result<()> {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().context("Invalid step value")?;
                if step == 0 || step > max {
                    anyhow::bail!("Step value must be 1-{}", max);
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let start = Self::parse_value(lo, min, max, names).context("Invalid range start")?;
            let end = Self::parse_value(hi, min, max, names).context("Invalid range end")?;
            if start > end {
                anyhow::bail!("Range values must be {}-{} with start <= end", min, max);
            }
            (start, end)
        } else {
            let value = Self::parse_value(range, min, max, names)?;
            // `5/15` means "from 5 to the end of the range, every 15".
            if step.is_some() {
                (value, max)
            } else {
                (value, value)
            }
        };

        out.insert_range(start, end, step.unwrap_or(1));
        Ok(())
    }

    fn parse_value(token: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u32> {
        if let Some(names) = names {
            let upper = token.to_ascii_uppercase();
            if let Some(index) = names.iter().position(|name| *name == upper) {
                // Month names start at 1, weekday names at 0.
                #[allow(clippy::cast_possible_truncation, reason = "name tables have at most 12 entries")]
                return Ok(index as u32 + min);
            }
        }
        let value: u32 = token.parse().context("Invalid numeric value")?;
        if value < min || value > max {
            anyhow::bail!("Value must be {}-{}", min, max);
        }
        Ok(value)
    }
}

impl FromStr for CronExpression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        CronParser::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpression {
    /// Check if the expression matches the given wall-clock time.
    pub fn matches(&self, time: &NaiveDateTime) -> bool {
        self.second.matches(time.second())
            && self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day.matches(time.day())
            && self.month.matches(time.month())
            && self.weekday.matches(time.weekday().num_days_from_sunday())
    }

    /// Next matching instant strictly after `after`, evaluated in `zone`.
    ///
    /// Returns `None` if the expression has no match in the search horizon
    /// (for example `0 0 0 31 2 *`).
    pub fn next_after(&self, after: &DateTime<Utc>, zone: SchedulerTimeZone) -> Option<DateTime<Utc>> {
        match zone {
            SchedulerTimeZone::Utc => self.next_wall_clock(after.naive_utc()).map(|n| n.and_utc()),
            SchedulerTimeZone::Local => {
                let mut cursor = after.with_timezone(&Local).naive_local();
                loop {
                    let candidate = self.next_wall_clock(cursor)?;
                    let mapped = Local.from_local_datetime(&candidate);
                    // Ambiguous times (DST fall-back) fire on the first pass;
                    // skipped times (DST spring-forward) do not fire at all.
                    let found = [mapped.earliest(), mapped.latest()]
                        .into_iter()
                        .flatten()
                        .map(|dt| dt.with_timezone(&Utc))
                        .find(|dt| dt > after);
                    if found.is_some() {
                        return found;
                    }
                    cursor = candidate;
                }
            }
        }
    }

    /// The next `count` instants after `after`.
    pub fn upcoming(&self, after: &DateTime<Utc>, zone: SchedulerTimeZone, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = *after;
        while out.len() < count {
            match self.next_after(&cursor, zone) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    fn next_wall_clock(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = after.with_nanosecond(0)? + chrono::Duration::seconds(1);
        let horizon = start.year() + SEARCH_YEARS;
        let mut date = start.date();
        let mut from = start.time();

        while date.year() <= horizon {
            if !self.month.matches(date.month()) {
                date = first_of_next_month(date)?;
                from = NaiveTime::MIN;
                continue;
            }
            if self.day.matches(date.day())
                && self.weekday.matches(date.weekday().num_days_from_sunday())
            {
                if let Some(time) = self.time_on_or_after(from) {
                    return Some(date.and_time(time));
                }
            }
            date = date.succ_opt()?;
            from = NaiveTime::MIN;
        }
        None
    }

    fn time_on_or_after(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in self.hour.values_from(from.hour(), 23) {
            let minute_from = if hour == from.hour() { from.minute() } else { 0 };
            for minute in self.minute.values_from(minute_from, 59) {
                let second_from = if hour == from.hour() && minute == from.minute() {
                    from.second()
                } else {
                    0
                };
                if let Some(second) = self.second.next(second_from, 59) {
                    return NaiveTime::from_hms_opt(hour, minute, second);
                }
            }
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}
