//! Cron schedules.
//!
//! Jobs are declared with classic five-field cron expressions (minute, hour,
//! day of month, month, day of week) or one of the `@hourly`-style macros. The
//! `cron` crate wants a leading seconds field and numbers Sunday as 1, so the
//! declared expression is translated once at parse time and kept alongside.
//!
//! Classic cron fires on a day matching either day field when both are
//! restricted, while the `cron` crate requires both. Such expressions are
//! split into a day-of-month form and a day-of-week form.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    normalized: Vec<String>,
    inner: Vec<cron::Schedule>,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.split_whitespace().collect::<Vec<_>>().join(" ");
        let normalized = normalize(&expression)?;
        let inner = normalized
            .iter()
            .map(|n| cron::Schedule::from_str(n).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            expression,
            normalized,
            inner,
        })
    }

    /// The expression as declared (whitespace collapsed).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Six-field forms with seconds, as understood by the in-process
    /// scheduler. The schedule fires whenever any of them does.
    pub fn normalized(&self) -> &[String] {
        &self.normalized
    }

    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.iter().filter_map(|s| s.after(after).next()).min()
    }

    pub fn upcoming(&self) -> Option<DateTime<Utc>> {
        self.inner.iter().filter_map(|s| s.upcoming(Utc).next()).min()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Schedule {}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Expand a macro into its five-field equivalent.
pub fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression {
        "@hourly" => Some("0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

/// Day-of-month and day-of-week pairs whose union matches what classic cron
/// matches. A field starting with `*` leaves the other field in charge, so
/// only two restricted fields are split.
pub fn day_variants<'a>(day: &'a str, weekday: &'a str) -> Vec<(&'a str, &'a str)> {
    if day.starts_with('*') || weekday.starts_with('*') {
        vec![(day, weekday)]
    } else {
        vec![(day, "*"), ("*", weekday)]
    }
}

fn normalize(expression: &str) -> Result<Vec<String>, String> {
    let expanded = if expression.starts_with('@') {
        expand_macro(expression).ok_or_else(|| format!("unknown macro \"{}\"", expression))?
    } else {
        expression
    };

    let fields: Vec<&str> = expanded.split(' ').collect();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    };

    day_variants(day, weekday)
        .into_iter()
        .map(|(day, weekday)| {
            Ok(format!(
                "0 {} {} {} {} {}",
                minute,
                hour,
                day,
                month,
                day_of_week_names(weekday)?
            ))
        })
        .collect()
}

/// Rewrite numeric day-of-week values (0 and 7 are Sunday) as names.
pub fn day_of_week_names(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let rewritten = if base == "*" {
            "*".to_string()
        } else if let Some((start, end)) = base.split_once('-') {
            let start = day_index(start)?;
            let end = day_index(end)?;
            if start == 0 && end == 7 {
                "*".to_string()
            } else if end == 7 && step.is_none() {
                // cron allows 5-7 (Fri..Sun); the range cannot wrap, so split it
                match start {
                    7 => "Sun".to_string(),
                    6 => "Sat,Sun".to_string(),
                    _ => format!("{}-Sat,Sun", DAY_NAMES[start]),
                }
            } else if end == 7 {
                return Err(format!("unsupported day-of-week range \"{}\"", item));
            } else if start > end {
                return Err(format!("backwards day-of-week range \"{}\"", item));
            } else {
                format!("{}-{}", DAY_NAMES[start], DAY_NAMES[end])
            }
        } else {
            DAY_NAMES[day_index(base)? % 7].to_string()
        };

        match step {
            Some(step) => items.push(format!("{}/{}", rewritten, step)),
            None => items.push(rewritten),
        }
    }
    Ok(items.join(","))
}

fn day_index(value: &str) -> Result<usize, String> {
    if let Ok(n) = value.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day of week out of range: {}", n))
        };
    }
    if value.len() >= 3 && value.is_ascii() {
        if let Some(index) = DAY_NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(&value[..3]))
        {
            return Ok(index);
        }
    }
    Err(format!("unknown day of week \"{}\"", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_five_field_expression() {
        let schedule = Schedule::parse("0 2 * * *").unwrap();
        assert_eq!(schedule.expression(), "0 2 * * *");
        assert_eq!(schedule.normalized(), ["0 0 2 * * *"]);

        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = schedule.next_after(&start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_whitespace_is_collapsed() {
        let schedule = Schedule::parse("  30   4 * *  * ").unwrap();
        assert_eq!(schedule.expression(), "30 4 * * *");
        assert_eq!(schedule, Schedule::parse("30 4 * * *").unwrap());
    }

    #[test]
    fn test_numeric_weekdays_follow_classic_cron() {
        // 2026-03-10 is a Tuesday
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let monday = Schedule::parse("0 3 * * 1").unwrap();
        assert_eq!(monday.next_after(&start).unwrap().weekday(), Weekday::Mon);

        let sunday = Schedule::parse("0 3 * * 0").unwrap();
        assert_eq!(sunday.next_after(&start).unwrap().weekday(), Weekday::Sun);

        let weekend = Schedule::parse("0 3 * * 6-7").unwrap();
        assert_eq!(weekend.next_after(&start).unwrap().weekday(), Weekday::Sat);

        let weekdays = Schedule::parse("15 1 * * 1-5").unwrap();
        let next = weekdays.next_after(&start).unwrap();
        assert_eq!(next.weekday(), Weekday::Wed);
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_macros() {
        let hourly = Schedule::parse("@hourly").unwrap();
        assert_eq!(hourly.expression(), "@hourly");
        assert_eq!(hourly.normalized(), ["0 0 * * * *"]);

        let weekly = Schedule::parse("@weekly").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(weekly.next_after(&start).unwrap().weekday(), Weekday::Sun);

        assert!(Schedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("0 2 * *").is_err());
        assert!(Schedule::parse("0 0 2 * * *").is_err());
        assert!(Schedule::parse("61 2 * * *").is_err());
        assert!(Schedule::parse("0 2 * * 9").is_err());
        assert!(Schedule::parse("every day").is_err());
    }

    #[test]
    fn test_impossible_date_has_no_upcoming_time() {
        let schedule = Schedule::parse("0 0 31 2 *").unwrap();
        assert!(schedule.upcoming().is_none());
    }

    #[test]
    fn test_restricted_day_fields_match_either() {
        // 2026-03-10 is a Tuesday; the next Monday comes before the 1st
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let schedule = Schedule::parse("0 0 1 * 1").unwrap();
        assert_eq!(schedule.normalized(), ["0 0 0 1 * *", "0 0 0 * * Mon"]);
        assert_eq!(
            schedule.next_after(&start).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()
        );

        let after_monday = Utc.with_ymd_and_hms(2026, 3, 30, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(&after_monday).unwrap(),
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_impossible_day_still_fires_on_weekday() {
        let schedule = Schedule::parse("0 0 30 2 1").unwrap();
        let next = schedule.upcoming().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.month(), 2);
    }

    #[test]
    fn test_stepped_day_field_keeps_both_restrictions() {
        let schedule = Schedule::parse("0 0 */2 * 1").unwrap();
        assert_eq!(schedule.normalized(), ["0 0 0 */2 * Mon"]);
    }

    #[test]
    fn test_day_of_week_names() {
        assert_eq!(day_of_week_names("*").unwrap(), "*");
        assert_eq!(day_of_week_names("1,3").unwrap(), "Mon,Wed");
        assert_eq!(day_of_week_names("5-7").unwrap(), "Fri-Sat,Sun");
        assert_eq!(day_of_week_names("0-7").unwrap(), "*");
        assert_eq!(day_of_week_names("*/2").unwrap(), "*/2");
        assert_eq!(day_of_week_names("mon-fri").unwrap(), "Mon-Fri");
    }
}
