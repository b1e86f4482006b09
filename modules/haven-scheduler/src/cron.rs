//! Cron expression parsing.
//!
//! Accepts the 5-field form `min hour dom mon dow` and the seconds-first
//! 6-field form, UTC only, with Sunday = 0 in the day-of-week field. The
//! `cron` crate underneath is seconds-first natively but numbers weekdays
//! 1-7 with Sunday = 1, so numeric day-of-week tokens are rewritten before
//! parsing.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tracing::warn;

use haven_common::HavenError;

/// A parsed, validated cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    expression: String,
}

impl CronSchedule {
    /// Parse a 5- or 6-field cron expression. Invalid expressions fail
    /// here, at add-time, not at fire-time.
    pub fn parse(expression: &str) -> Result<Self, HavenError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let normalized = match fields.len() {
            5 => {
                let dow = translate_day_of_week(expression, fields[4])?;
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], dow
                )
            }
            6 => {
                let dow = translate_day_of_week(expression, fields[5])?;
                format!(
                    "{} {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], fields[4], dow
                )
            }
            n => {
                return Err(HavenError::Scheduling(format!(
                    "invalid cron expression '{expression}': expected 5 or 6 fields, got {n}"
                )));
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            HavenError::Scheduling(format!("invalid cron expression '{expression}': {e}"))
        })?;

        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The next fire time from now.
    pub fn upcoming(&self) -> Option<DateTime<Utc>> {
        self.next_after(Utc::now())
    }
}

/// Project the next run for a stored expression. Falls back to one hour
/// from now if the expression no longer parses or has no future fire.
pub fn next_run_or_fallback(expression: &str) -> DateTime<Utc> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule
            .upcoming()
            .unwrap_or_else(|| Utc::now() + Duration::hours(1)),
        Err(e) => {
            warn!(expression, error = %e, "Failed to project next run, falling back to +1h");
            Utc::now() + Duration::hours(1)
        }
    }
}

/// Rewrite a Sunday=0 day-of-week field into the crate's Sunday=1 scheme.
/// Handles `*`, values, ranges, steps, and comma lists; named days pass
/// through untouched. `7` is tolerated as Sunday.
fn translate_day_of_week(expression: &str, field: &str) -> Result<String, HavenError> {
    let tokens: Result<Vec<String>, HavenError> = field
        .split(',')
        .map(|token| {
            let (base, step) = match token.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (token, None),
            };

            let shifted = if base == "*" || base == "?" {
                base.to_string()
            } else if let Some((lo, hi)) = base.split_once('-') {
                format!(
                    "{}-{}",
                    shift_weekday(expression, lo)?,
                    shift_weekday(expression, hi)?
                )
            } else {
                shift_weekday(expression, base)?
            };

            Ok(match step {
                Some(step) => format!("{shifted}/{step}"),
                None => shifted,
            })
        })
        .collect();
    Ok(tokens?.join(","))
}

fn shift_weekday(expression: &str, value: &str) -> Result<String, HavenError> {
    if !value.chars().all(|c| c.is_ascii_digit()) {
        // Named day (SUN..SAT); the cron parser validates it.
        return Ok(value.to_string());
    }
    let n: u8 = value.parse().map_err(|_| {
        HavenError::Scheduling(format!(
            "invalid cron expression '{expression}': bad day-of-week '{value}'"
        ))
    })?;
    if n > 7 {
        return Err(HavenError::Scheduling(format!(
            "invalid cron expression '{expression}': day-of-week {n} out of range 0-7"
        )));
    }
    Ok(((n % 7) + 1).to_string())
}
