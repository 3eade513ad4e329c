//! Schedule expression engine (spec §4.6 "Expression semantics"). Spec
//! treats this as a free-form external collaborator behind a narrow
//! contract: `next_after(now) -> DateTime` and a validator, both total
//! (valid input always yields a future time; invalid input is a typed
//! error raised only at creation time).
//!
//! Two forms are accepted:
//! - standard 5-field cron (`minute hour day-of-month month day-of-week`,
//!   each field `*`, a number, or a comma list of numbers)
//! - the shorthand `every <N>h` / `every <N>m`

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use ckb_protocol::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpr {
    Every(Duration),
    Cron {
        minute: FieldMatch,
        hour: FieldMatch,
        day_of_month: FieldMatch,
        month: FieldMatch,
        day_of_week: FieldMatch,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatch {
    Any,
    Values(Vec<u32>),
}

impl FieldMatch {
    fn matches(&self, value: u32) -> bool {
        match self {
            FieldMatch::Any => true,
            FieldMatch::Values(values) => values.contains(&value),
        }
    }

    fn parse(field: &str, min: u32, max: u32) -> CoreResult<Self> {
        if field == "*" {
            return Ok(FieldMatch::Any);
        }
        let mut values = Vec::new();
        for part in field.split(',') {
            let n: u32 = part
                .trim()
                .parse()
                .map_err(|_| CoreError::parse(format!("invalid cron field value: {part}")))?;
            if n < min || n > max {
                return Err(CoreError::parse(format!(
                    "cron field value {n} out of range [{min}, {max}]"
                )));
            }
            values.push(n);
        }
        Ok(FieldMatch::Values(values))
    }
}

impl ScheduleExpr {
    pub fn parse(expression: &str) -> CoreResult<Self> {
        let trimmed = expression.trim();

        if let Some(rest) = trimmed.strip_prefix("every ") {
            return Self::parse_every(rest);
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::parse(format!(
                "expected 5 cron fields, got {}: {expression}",
                fields.len()
            )));
        }

        Ok(ScheduleExpr::Cron {
            minute: FieldMatch::parse(fields[0], 0, 59)?,
            hour: FieldMatch::parse(fields[1], 0, 23)?,
            day_of_month: FieldMatch::parse(fields[2], 1, 31)?,
            month: FieldMatch::parse(fields[3], 1, 12)?,
            day_of_week: FieldMatch::parse(fields[4], 0, 6)?,
        })
    }

    fn parse_every(rest: &str) -> CoreResult<Self> {
        let rest = rest.trim();
        let (digits, unit) = rest.split_at(
            rest.find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| CoreError::parse(format!("invalid 'every' expression: {rest}")))?,
        );
        let n: i64 = digits
            .parse()
            .map_err(|_| CoreError::parse(format!("invalid 'every' expression: {rest}")))?;
        if n <= 0 {
            return Err(CoreError::parse("'every' interval must be positive"));
        }
        let duration = match unit {
            "h" => Duration::hours(n),
            "m" => Duration::minutes(n),
            "s" => Duration::seconds(n),
            "d" => Duration::days(n),
            other => {
                return Err(CoreError::parse(format!(
                    "unknown 'every' unit '{other}', expected h/m/s/d"
                )))
            }
        };
        Ok(ScheduleExpr::Every(duration))
    }

    /// Always yields a time strictly after `now` — total over all valid
    /// expressions (spec §4.6).
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ScheduleExpr::Every(duration) => now + *duration,
            ScheduleExpr::Cron { .. } => self.next_cron_after(now),
        }
    }

    fn next_cron_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ScheduleExpr::Cron {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        } = self
        else {
            unreachable!()
        };

        // truncate to the start of the next minute, then scan forward.
        let mut candidate = (now + Duration::minutes(1))
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap();

        // bounded scan: at most ~4 years of minutes, which is always
        // enough to find a match for any well-formed field combination.
        for _ in 0..(4 * 366 * 24 * 60) {
            if month.matches(candidate.month())
                && day_of_month.matches(candidate.day())
                && day_of_week.matches(candidate.weekday().num_days_from_sunday())
                && hour.matches(candidate.hour())
                && minute.matches(candidate.minute())
            {
                return candidate;
            }
            candidate += Duration::minutes(1);
        }

        // unreachable for any expression that passed `parse`, since every
        // field range always recurs within a year; fall back defensively.
        now + Duration::hours(1)
    }

    pub fn validate(expression: &str) -> CoreResult<()> {
        Self::parse(expression).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_shorthand_advances_by_duration() {
        let expr = ScheduleExpr::parse("every 5m").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = expr.next_after(now);
        assert_eq!(next, now + Duration::minutes(5));
    }

    #[test]
    fn every_seconds_and_hours_and_days() {
        assert!(ScheduleExpr::parse("every 30s").is_ok());
        assert!(ScheduleExpr::parse("every 2h").is_ok());
        assert!(ScheduleExpr::parse("every 1d").is_ok());
    }

    #[test]
    fn invalid_every_unit_is_a_parse_error() {
        assert!(ScheduleExpr::parse("every 5x").is_err());
    }

    #[test]
    fn cron_wildcard_fires_next_minute() {
        let expr = ScheduleExpr::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 15).unwrap();
        let next = expr.next_after(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 31, 0).unwrap());
    }

    #[test]
    fn cron_specific_hour_and_minute() {
        let expr = ScheduleExpr::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = expr.next_after(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn cron_comma_list_minutes() {
        let expr = ScheduleExpr::parse("0,15,30,45 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 16, 0).unwrap();
        let next = expr.next_after(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn invalid_field_count_is_parse_error() {
        assert!(ScheduleExpr::parse("* * *").is_err());
    }

    #[test]
    fn out_of_range_value_is_parse_error() {
        assert!(ScheduleExpr::parse("99 * * * *").is_err());
    }

    #[test]
    fn next_after_is_always_strictly_future() {
        let expr = ScheduleExpr::parse("30 14 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 14, 30, 0).unwrap();
        let next = expr.next_after(now);
        assert!(next > now);
    }
}
