//! Five-field cron evaluation with a `CRON_TZ=<tz>` envelope.
//!
//! Schedules store a timezone separately; the full expression handed to
//! the evaluator is `CRON_TZ=<tz> <minute hour dom month dow>`. DST gaps
//! skip the non-existent local minute; fold overlaps fire on the earlier
//! mapping.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use cortex_domain::error::{Error, Result};

/// A parsed schedule expression: timezone plus the five cron fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub tz: chrono_tz::Tz,
    pub expr: String,
}

impl CronSchedule {
    /// Parse `CRON_TZ=<tz> <expr>` (or a bare expression, treated as UTC).
    pub fn parse(full: &str) -> Result<Self> {
        let trimmed = full.trim();
        let (tz, expr) = match trimmed.strip_prefix("CRON_TZ=") {
            Some(rest) => {
                let (tz_name, expr) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::Validation("cron expression missing after CRON_TZ".into()))?;
                let tz = tz_name
                    .parse::<chrono_tz::Tz>()
                    .map_err(|_| Error::Validation(format!("unknown timezone: {tz_name}")))?;
                (tz, expr.trim())
            }
            None => (chrono_tz::UTC, trimmed),
        };
        if expr.split_whitespace().count() != 5 {
            return Err(Error::Validation(format!(
                "cron expression must have 5 fields: {expr}"
            )));
        }
        Ok(Self {
            tz,
            expr: expr.to_owned(),
        })
    }

    /// Prepend the timezone envelope onto a bare expression.
    pub fn envelope(tz: &str, expr: &str) -> String {
        format!("CRON_TZ={tz} {expr}")
    }

    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz).naive_local();
        matches_naive(&self.expr, &local)
    }

    /// Next firing strictly after `after`, as UTC. Scans up to a year of
    /// minutes.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&self.tz).naive_local();
        let into_next_minute = 60 - local_after.second() as i64;
        let mut candidate = (local_after + chrono::Duration::seconds(into_next_minute))
            .with_second(0)
            .unwrap_or(local_after);

        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if matches_naive(&self.expr, &candidate) {
                match self.tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc));
                    }
                    // DST gap: this local minute does not exist.
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                if (lo..=hi).contains(&value) {
                    return true;
                }
            }
        } else if part.parse::<u32>() == Ok(value) {
            return true;
        }
    }
    false
}

fn matches_naive(expr: &str, at: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], at.minute())
        && field_matches(fields[1], at.hour())
        && field_matches(fields[2], at.day())
        && field_matches(fields[3], at.month())
        && field_matches(fields[4], at.weekday().num_days_from_sunday())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tz_envelope() {
        let s = CronSchedule::parse("CRON_TZ=America/New_York 30 9 * * *").unwrap();
        assert_eq!(s.tz, chrono_tz::America::New_York);
        assert_eq!(s.expr, "30 9 * * *");
    }

    #[test]
    fn bare_expression_defaults_to_utc() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(s.tz, chrono_tz::UTC);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(CronSchedule::parse("CRON_TZ=Not/Real 0 * * * *").is_err());
        assert!(CronSchedule::parse("CRON_TZ=UTC").is_err());
        assert!(CronSchedule::parse("0 * * *").is_err());
    }

    #[test]
    fn envelope_roundtrips() {
        let full = CronSchedule::envelope("Asia/Tokyo", "0 9 * * *");
        let s = CronSchedule::parse(&full).unwrap();
        assert_eq!(s.tz, chrono_tz::Asia::Tokyo);
    }

    #[test]
    fn step_range_and_list_fields() {
        let every5 = CronSchedule::parse("*/5 * * * *").unwrap();
        assert!(every5.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap()));
        assert!(!every5.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 10, 3, 0).unwrap()));

        let work_hours = CronSchedule::parse("0 9-17 * * *").unwrap();
        assert!(work_hours.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap()));
        assert!(!work_hours.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 20, 0, 0).unwrap()));

        let quarters = CronSchedule::parse("0,15,30,45 * * * *").unwrap();
        assert!(quarters.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 10, 15, 0).unwrap()));
        assert!(!quarters.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 10, 20, 0).unwrap()));
    }

    #[test]
    fn next_after_respects_timezone() {
        let s = CronSchedule::parse("CRON_TZ=Asia/Tokyo 0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 1, 0, 0).unwrap();
        // 9:00 JST = 0:00 UTC, so the next firing is tomorrow 0:00 UTC.
        let next = s.next_after(&after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // 2:30 does not exist on 2026-03-08 in US/Eastern.
        let s = CronSchedule::parse("CRON_TZ=US/Eastern 30 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 8, 6, 0, 0).unwrap();
        let next = s.next_after(&after).unwrap();
        assert_eq!(next.day(), 9);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn fall_back_uses_earlier_mapping() {
        // 1:30 occurs twice on 2026-11-01 in US/Eastern; earliest wins.
        let s = CronSchedule::parse("CRON_TZ=US/Eastern 30 1 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 11, 1, 4, 0, 0).unwrap();
        let next = s.next_after(&after).unwrap();
        assert_eq!(next.hour(), 5); // 1:30 EDT = 5:30 UTC
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn dow_field_matches_sunday_zero() {
        let sundays = CronSchedule::parse("0 12 * * 0").unwrap();
        // 2026-06-14 is a Sunday.
        assert!(sundays.matches(&Utc.with_ymd_and_hms(2026, 6, 14, 12, 0, 0).unwrap()));
        assert!(!sundays.matches(&Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()));
    }
}
