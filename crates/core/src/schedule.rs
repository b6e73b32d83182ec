//! Next-fire arithmetic for cron and fixed-interval schedules.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::error::{CoreError, CoreResult};

/// Compute the next fire time after `from`.
///
/// A non-empty `cron_expr` takes precedence; otherwise a positive
/// `fixed_interval_seconds` yields `from + interval`. Cron fields are
/// interpreted in `timezone` (empty means UTC) and the cron result is
/// strictly after `from`.
pub fn next_run(
    cron_expr: Option<&str>,
    fixed_interval_seconds: Option<i32>,
    from: DateTime<Utc>,
    timezone: &str,
) -> CoreResult<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;

    match (cron_expr, fixed_interval_seconds) {
        (Some(expr), _) if !expr.trim().is_empty() => {
            let schedule = parse_cron(expr)?;
            let reference = from.with_timezone(&tz);
            schedule
                .after(&reference)
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| CoreError::InvalidCron(format!("{expr}: no upcoming occurrence")))
        }
        (_, Some(secs)) if secs > 0 => Ok(from + Duration::seconds(i64::from(secs))),
        _ => Err(CoreError::invalid_schedule(
            "either cron_expr or fixed_interval_seconds > 0 is required",
        )),
    }
}

/// Parse a standard 5-field cron expression (minute hour dom month dow).
///
/// The `cron` crate wants a seconds field, so a literal `0` is prepended;
/// anything other than exactly five fields is rejected up front.
pub fn parse_cron(expr: &str) -> CoreResult<CronSchedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        return Err(CoreError::InvalidCron(format!(
            "{expr}: expected 5 fields, got {fields}"
        )));
    }
    CronSchedule::from_str(&format!("0 {trimmed}"))
        .map_err(|e| CoreError::InvalidCron(format!("{expr}: {e}")))
}

/// Resolve an IANA zone name; the empty string means UTC.
pub fn parse_timezone(timezone: &str) -> CoreResult<Tz> {
    if timezone.is_empty() {
        return Ok(chrono_tz::UTC);
    }
    timezone
        .parse::<Tz>()
        .map_err(|_| CoreError::InvalidTimezone(timezone.to_string()))
}

/// Admission-time check that a trigger definition is well-formed: exactly
/// one of cron/interval, a parseable expression, a known timezone.
pub fn validate_trigger(
    cron_expr: Option<&str>,
    fixed_interval_seconds: Option<i32>,
    timezone: &str,
) -> CoreResult<()> {
    parse_timezone(timezone)?;
    let has_cron = cron_expr.is_some_and(|e| !e.trim().is_empty());
    let has_interval = fixed_interval_seconds.is_some_and(|s| s > 0);
    match (has_cron, has_interval) {
        (true, true) => Err(CoreError::invalid_schedule(
            "cron_expr and fixed_interval_seconds are mutually exclusive",
        )),
        (true, false) => parse_cron(cron_expr.unwrap_or_default()).map(|_| ()),
        (false, true) => Ok(()),
        (false, false) => Err(CoreError::invalid_schedule(
            "either cron_expr or fixed_interval_seconds > 0 is required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_interval_adds_exactly() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let next = next_run(None, Some(15), from, "UTC").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 15).unwrap());
    }

    #[test]
    fn cron_every_five_minutes() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 2, 0).unwrap();
        let next = next_run(Some("*/5 * * * *"), None, from, "UTC").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn cron_is_strictly_after_reference() {
        // Reference sits exactly on a match; the next fire is the one after.
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        let next = next_run(Some("*/5 * * * *"), None, from, "UTC").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap());
    }

    #[test]
    fn cron_fields_are_interpreted_in_timezone() {
        // 09:00 New York daily == 14:00 UTC in January (EST, UTC-5).
        let from = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let next = next_run(Some("0 9 * * *"), None, from, "America/New_York").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn empty_timezone_means_utc() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_run(None, Some(60), from, "").unwrap(),
            next_run(None, Some(60), from, "UTC").unwrap()
        );
    }

    #[test]
    fn cron_takes_precedence_over_interval() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 2, 0).unwrap();
        let next = next_run(Some("*/5 * * * *"), Some(15), from, "UTC").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn no_trigger_is_invalid_schedule() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            next_run(None, None, from, "UTC"),
            Err(CoreError::InvalidSchedule(_))
        ));
        assert!(matches!(
            next_run(Some(""), Some(0), from, "UTC"),
            Err(CoreError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn bad_cron_is_invalid_cron() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            next_run(Some("not a cron"), None, from, "UTC"),
            Err(CoreError::InvalidCron(_))
        ));
        // Six fields is not the standard 5-field form.
        assert!(matches!(
            next_run(Some("0 */5 * * * *"), None, from, "UTC"),
            Err(CoreError::InvalidCron(_))
        ));
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            next_run(Some("* * * * *"), None, from, "Mars/Olympus"),
            Err(CoreError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn validate_trigger_requires_exactly_one() {
        assert!(validate_trigger(Some("*/5 * * * *"), None, "UTC").is_ok());
        assert!(validate_trigger(None, Some(30), "").is_ok());
        assert!(matches!(
            validate_trigger(Some("*/5 * * * *"), Some(30), "UTC"),
            Err(CoreError::InvalidSchedule(_))
        ));
        assert!(matches!(
            validate_trigger(None, None, "UTC"),
            Err(CoreError::InvalidSchedule(_))
        ));
        assert!(matches!(
            validate_trigger(Some("bad"), None, "UTC"),
            Err(CoreError::InvalidCron(_))
        ));
    }
}
