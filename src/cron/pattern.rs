//! Five-field cron pattern parsing and next-run computation.
//!
//! Fields: minute (0-59), hour (0-23), day-of-month (1-31), month (1-12),
//! day-of-week (0-6, 0 = Sunday). Supports `*`, single values, ranges
//! `a-b`, lists `a,b,c`, and steps `*/n` with n >= 1. When both
//! day-of-month and day-of-week are restricted, a date matches if either
//! does (the classic cron rule).

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

use crate::error::ScheduleError;

/// Minute-by-minute search horizon for the next firing; a pattern with no
/// match inside it (e.g. Feb 30) never fires.
const SEARCH_HORIZON_MINUTES: i64 = 60 * 24 * 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronPattern {
    source: String,
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn invalid(pattern: &str, reason: impl Into<String>) -> ScheduleError {
    ScheduleError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    if value < min || value > max {
        return Err(format!("{} is outside {}-{}", value, min, max));
    }
    Ok(value)
}

/// One field into a bitmask plus whether it restricts anything.
fn parse_field(raw: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    if raw == "*" {
        let mut mask = 0u64;
        for v in min..=max {
            mask |= 1 << v;
        }
        return Ok((mask, false));
    }

    if let Some(step_raw) = raw.strip_prefix("*/") {
        let step: u32 = step_raw
            .parse()
            .map_err(|_| format!("step '{}' is not a number", step_raw))?;
        if step == 0 {
            return Err("step must be at least 1".to_string());
        }
        let mut mask = 0u64;
        let mut v = min;
        while v <= max {
            mask |= 1 << v;
            v += step;
        }
        return Ok((mask, true));
    }

    let mut mask = 0u64;
    for item in raw.split(',') {
        if item.is_empty() {
            return Err("empty list item".to_string());
        }
        if let Some((start_raw, end_raw)) = item.split_once('-') {
            let start = parse_value(start_raw, min, max)?;
            let end = parse_value(end_raw, min, max)?;
            if start > end {
                return Err(format!("range {}-{} is reversed", start, end));
            }
            for v in start..=end {
                mask |= 1 << v;
            }
        } else {
            mask |= 1 << parse_value(item, min, max)?;
        }
    }
    Ok((mask, true))
}

impl CronPattern {
    pub fn parse(pattern: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                pattern,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let (minute, _) =
            parse_field(fields[0], 0, 59).map_err(|e| invalid(pattern, format!("minute: {}", e)))?;
        let (hour, _) =
            parse_field(fields[1], 0, 23).map_err(|e| invalid(pattern, format!("hour: {}", e)))?;
        let (dom, dom_restricted) = parse_field(fields[2], 1, 31)
            .map_err(|e| invalid(pattern, format!("day-of-month: {}", e)))?;
        let (month, _) =
            parse_field(fields[3], 1, 12).map_err(|e| invalid(pattern, format!("month: {}", e)))?;
        let (dow, dow_restricted) = parse_field(fields[4], 0, 6)
            .map_err(|e| invalid(pattern, format!("day-of-week: {}", e)))?;

        Ok(Self {
            source: pattern.to_string(),
            minute,
            hour,
            dom,
            month,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, at: NaiveDateTime) -> bool {
        if self.minute & (1 << at.minute()) == 0 {
            return false;
        }
        if self.hour & (1 << at.hour()) == 0 {
            return false;
        }
        if self.month & (1 << at.month()) == 0 {
            return false;
        }

        let dom_hit = self.dom & (1 << at.day()) != 0;
        let dow_hit = self.dow & (1 << at.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    /// First matching instant strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut at = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        for _ in 0..SEARCH_HORIZON_MINUTES {
            if self.matches(at) {
                return Some(at);
            }
            at += Duration::minutes(1);
        }
        None
    }
}
