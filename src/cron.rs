//! Cron Schedule Expressions
//!
//! Re-activation sweeps are driven by Quartz-style cron expressions:
//!
//! ```text
//! seconds minutes hours day-of-month month day-of-week [year]
//! ```
//!
//! Each field accepts `*`, single values, lists (`1,15`), ranges (`9-17`) and
//! steps (`0/5`, `*/10`, `10-40/10`). Day fields also accept `?` for "no
//! specific value". Months may be written `JAN`-`DEC`, weekdays `SUN`-`SAT`;
//! numeric weekdays run from 1 (Sunday) to 7 (Saturday). When both day fields
//! are restricted, a day matching either one fires.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::error::ConfigError;

/// Fires at second 0 of every minute
pub const DEFAULT_EXPRESSION: &str = "0 0/1 * 1/1 * ? *";

const MIN_YEAR: u32 = 1970;
const MAX_YEAR: u32 = 2199;

const MONTH_NAMES: [&str; 12] = ["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Whether `?` is accepted
    allow_any: bool,
}

const SECONDS: FieldSpec = FieldSpec { name: "seconds", min: 0, max: 59, names: &[], allow_any: false };
const MINUTES: FieldSpec = FieldSpec { name: "minutes", min: 0, max: 59, names: &[], allow_any: false };
const HOURS: FieldSpec = FieldSpec { name: "hours", min: 0, max: 23, names: &[], allow_any: false };
const DAYS_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], allow_any: true };
const MONTHS: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, allow_any: false };
const DAYS_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 1, max: 7, names: &DAY_NAMES, allow_any: true };
const YEARS: FieldSpec = FieldSpec { name: "year", min: MIN_YEAR, max: MAX_YEAR, names: &[], allow_any: false };

/// Values a field matches
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: BTreeSet<u32>,
    /// False for `*` and `?`
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest matching value not below `from`
    fn next_from(&self, from: u32) -> Option<u32> {
        self.values.range(from..).next().copied()
    }

    fn first(&self) -> u32 {
        self.values.iter().next().copied().unwrap_or(0)
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
    years: Field,
}

impl CronExpression {
    /// Parse an expression
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(invalid(format!("expected 6 or 7 fields, found {}", fields.len())));
        }

        let parse = |text: &str, spec: FieldSpec| parse_field(text, spec).map_err(invalid);
        Ok(Self {
            source: fields.join(" "),
            seconds: parse(fields[0], SECONDS)?,
            minutes: parse(fields[1], MINUTES)?,
            hours: parse(fields[2], HOURS)?,
            days_of_month: parse(fields[3], DAYS_OF_MONTH)?,
            months: parse(fields[4], MONTHS)?,
            days_of_week: parse(fields[5], DAYS_OF_WEEK)?,
            years: parse(fields.get(6).copied().unwrap_or("*"), YEARS)?,
        })
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().number_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First firing time strictly after `after`
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);

        loop {
            let year = u32::try_from(t.year()).ok()?;
            if !self.years.contains(year) {
                let year = self.years.next_from(year + 1)?;
                t = start_of_day(NaiveDate::from_ymd_opt(year as i32, 1, 1)?);
                continue;
            }

            if !self.months.contains(t.month()) {
                t = match self.months.next_from(t.month() + 1) {
                    Some(month) => start_of_day(NaiveDate::from_ymd_opt(t.year(), month, 1)?),
                    None => start_of_day(NaiveDate::from_ymd_opt(t.year() + 1, self.months.first(), 1)?),
                };
                continue;
            }

            if !self.day_matches(t.date()) {
                t = start_of_day(t.date().succ_opt()?);
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = match self.hours.next_from(t.hour() + 1) {
                    Some(hour) => t.date().and_hms_opt(hour, 0, 0)?,
                    None => start_of_day(t.date().succ_opt()?),
                };
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = match self.minutes.next_from(t.minute() + 1) {
                    Some(minute) => t.date().and_hms_opt(t.hour(), minute, 0)?,
                    None => t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1),
                };
                continue;
            }

            if !self.seconds.contains(t.second()) {
                t = match self.seconds.next_from(t.second() + 1) {
                    Some(second) => t.date().and_hms_opt(t.hour(), t.minute(), second)?,
                    None => t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1),
                };
                continue;
            }

            return Some(t);
        }
    }

    /// First firing time strictly after `after`, in local wall-clock time.
    /// Times skipped by a daylight saving transition never fire.
    pub fn next_local(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut naive = after.naive_local();
        loop {
            naive = self.next_after(naive)?;
            match Local.from_local_datetime(&naive) {
                LocalResult::Single(t) if t > after => return Some(t),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > after {
                        return Some(earliest);
                    }
                    if latest > after {
                        return Some(latest);
                    }
                }
                _ => {}
            }
        }
    }
}

impl FromStr for CronExpression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn parse_field(text: &str, spec: FieldSpec) -> Result<Field, String> {
    if text == "*" || (text == "?" && spec.allow_any) {
        return Ok(Field {
            values: (spec.min..=spec.max).collect(),
            restricted: false,
        });
    }
    if text == "?" {
        return Err(format!("'?' is not allowed in the {} field", spec.name));
    }

    let mut values = BTreeSet::new();
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in the {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in the {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `a/step` runs to the end of the field
            (value, if step.is_some() { spec.max } else { value })
        };

        if start > end {
            return Err(format!("range {}-{} is reversed in the {} field", start, end, spec.name));
        }
        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }

    Ok(Field {
        values,
        restricted: true,
    })
}

fn parse_value(text: &str, spec: FieldSpec) -> Result<u32, String> {
    let upper = text.to_ascii_uppercase();
    let value = match spec.names.iter().position(|n| *n == upper) {
        Some(idx) => idx as u32 + 1,
        None => text
            .parse()
            .map_err(|_| format!("invalid value '{}' in the {} field", text, spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {} out of range {}-{} in the {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}
