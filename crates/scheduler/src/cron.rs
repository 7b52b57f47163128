//! A 5-field cron expression parser: `minute hour dom month dow`.
//!
//! Supports `*`, `*/N` steps, literals, `N-M` ranges, and comma lists.
//! Fields are stored as bitmasks; matching a timestamp is five bit tests.
//! Day-of-week uses 0 = Sunday.

use chrono::{DateTime, Datelike, Timelike, Utc};

use graphbot_core::error::SchedulerError;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
}

impl CronExpr {
    /// Parse a standard 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expr,
                format!("expected 5 fields (minute hour dom month dow), got {}", fields.len()),
            ));
        }

        Ok(CronExpr {
            minutes: parse_field(expr, fields[0], 0, 59)?,
            hours: parse_field(expr, fields[1], 0, 23)? as u32,
            days_of_month: parse_field(expr, fields[2], 1, 31)? as u32,
            months: parse_field(expr, fields[3], 1, 12)? as u16,
            days_of_week: parse_field(expr, fields[4], 0, 6)? as u8,
        })
    }

    /// Does the given instant (minute granularity) match?
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        let dow = dt.weekday().num_days_from_sunday();
        self.minutes & (1 << dt.minute()) != 0
            && self.hours & (1 << dt.hour()) != 0
            && self.days_of_month & (1 << dt.day()) != 0
            && self.months & (1 << dt.month()) != 0
            && self.days_of_week & (1 << dow) != 0
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Parse one field into a bitmask over `[min, max]`.
fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<u64, SchedulerError> {
    let mut mask: u64 = 0;

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid(expr, "empty list entry"));
        }

        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| invalid(expr, format!("invalid step '{s}'")))?;
                if step == 0 {
                    return Err(invalid(expr, "step cannot be zero"));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let start: u32 = a
                .parse()
                .map_err(|_| invalid(expr, format!("invalid range start '{a}'")))?;
            let end: u32 = b
                .parse()
                .map_err(|_| invalid(expr, format!("invalid range end '{b}'")))?;
            if start > end {
                return Err(invalid(expr, format!("range {start}-{end} is inverted")));
            }
            (start, end)
        } else {
            let value: u32 = range_part
                .parse()
                .map_err(|_| invalid(expr, format!("invalid number '{range_part}'")))?;
            // A literal with a step (e.g. "5/15") runs to the field max
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max {
            return Err(invalid(expr, format!("{start}-{end} out of range {min}-{max}")));
        }

        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }

    if mask == 0 {
        return Err(invalid(expr, "field produced no values"));
    }
    Ok(mask)
}
