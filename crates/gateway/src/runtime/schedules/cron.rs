//! Timezone-aware cron evaluator (5-field: min hour dom month dow).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Inclusive value bounds for each of the five fields.
const FIELD_BOUNDS: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// Validate a 5-field cron expression. Returns a human-readable reason on
/// failure so the API can reject bad schedules at create/update time.
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 fields (min hour dom month dow), got {}",
            fields.len()
        ));
    }
    for (field, (lo, hi)) in fields.iter().zip(FIELD_BOUNDS) {
        validate_field(field, lo, hi)
            .map_err(|e| format!("invalid cron field '{field}': {e}"))?;
    }
    Ok(())
}

fn validate_field(field: &str, lo: u32, hi: u32) -> Result<(), String> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| "step is not a number".to_string())?;
        if n == 0 {
            return Err("step must be nonzero".into());
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((a, b)) = part.split_once('-') {
            let a: u32 = a.parse().map_err(|_| "range start is not a number".to_string())?;
            let b: u32 = b.parse().map_err(|_| "range end is not a number".to_string())?;
            if a > b || a < lo || b > hi {
                return Err(format!("range {a}-{b} outside {lo}-{hi}"));
            }
        } else {
            let n: u32 = part.parse().map_err(|_| "value is not a number".to_string())?;
            if n < lo || n > hi {
                return Err(format!("value {n} outside {lo}-{hi}"));
            }
        }
    }
    Ok(())
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
        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                if value >= a && value <= b {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check if a local naive datetime matches the expression.
fn matches_naive(expr: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[2], dt.day())
        && field_matches(fields[3], dt.month())
        && field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next occurrence after `after`, evaluated in `tz`, returned in UTC.
///
/// Local times inside a DST gap are skipped; ambiguous times resolve to the
/// earliest mapping.
pub fn cron_next_tz(expr: &str, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    let local_after = after.with_timezone(&tz).naive_local();
    let to_next_minute = 60 - local_after.second() as i64;
    let mut candidate = local_after + chrono::Duration::seconds(to_next_minute);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches_naive(expr, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {} // DST gap
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn validate_accepts_common_expressions() {
        for expr in ["* * * * *", "*/5 * * * *", "0 9 * * 1-5", "30 2 1 */3 0,6"] {
            assert!(validate_cron(expr).is_ok(), "{expr}");
        }
    }

    #[test]
    fn validate_rejects_bad_expressions() {
        assert!(validate_cron("* * * *").is_err()); // 4 fields
        assert!(validate_cron("61 * * * *").is_err()); // minute out of range
        assert!(validate_cron("* 25 * * *").is_err()); // hour out of range
        assert!(validate_cron("*/0 * * * *").is_err()); // zero step
        assert!(validate_cron("a * * * *").is_err()); // not a number
        assert!(validate_cron("10-5 * * * *").is_err()); // inverted range
    }

    #[test]
    fn next_every_five_minutes() {
        let after = utc(2025, 6, 1, 12, 2);
        let next = cron_next_tz("*/5 * * * *", &after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 6, 1, 12, 5));
    }

    #[test]
    fn next_daily_at_nine_rolls_to_tomorrow() {
        let after = utc(2025, 6, 1, 10, 0);
        let next = cron_next_tz("0 9 * * *", &after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 6, 2, 9, 0));
    }

    #[test]
    fn next_respects_weekday_field() {
        // 2025-06-01 is a Sunday; "0 9 * * 1" = Mondays 09:00.
        let after = utc(2025, 6, 1, 0, 0);
        let next = cron_next_tz("0 9 * * 1", &after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 6, 2, 9, 0));
    }

    #[test]
    fn next_in_timezone_converts_to_utc() {
        // 09:00 in New York (EDT, UTC-4) is 13:00 UTC in June.
        let after = utc(2025, 6, 1, 0, 0);
        let tz = parse_tz("America/New_York");
        let next = cron_next_tz("0 9 * * *", &after, tz).unwrap();
        assert_eq!(next, utc(2025, 6, 1, 13, 0));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/AZone"), chrono_tz::UTC);
    }
}
