//! Cron schedule evaluation.
//!
//! Expressions are standard 5-field cron, parsed and evaluated by the
//! `croner` crate (which also owns the DST gap/overlap handling). This
//! module layers timezone resolution on top and converts between a job's
//! IANA timezone and the gateway's UTC clock.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;

/// Resolve an IANA timezone name, falling back to UTC on anything
/// unrecognized (including the empty string).
pub fn parse_tz(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::UTC)
}

/// Whether `expr` parses as a valid 5-field cron expression.
pub fn is_valid_expression(expr: &str) -> bool {
    Cron::new(expr).parse().is_ok()
}

/// Next occurrence strictly after `after`, evaluated in `tz`, returned in
/// UTC. `None` for unparseable expressions or schedules with no future
/// occurrence.
pub fn cron_next_tz(expr: &str, after: &DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let cron = Cron::new(expr).parse().ok()?;
    let local_after = after.with_timezone(&tz);
    cron.find_next_occurrence(&local_after, false)
        .ok()
        .map(|next| next.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn validation_requires_five_well_formed_fields() {
        assert!(is_valid_expression("*/5 9-17 * * 1-5"));
        assert!(is_valid_expression("0 4 1 * *"));
        assert!(!is_valid_expression("* * *"));
        assert!(!is_valid_expression("61 * * * *"));
        assert!(!is_valid_expression("not a cron line"));
    }

    #[test]
    fn next_fire_advances_to_the_scheduled_minute() {
        // Daily 06:30; asking at 07:00 lands on tomorrow's slot.
        let next = cron_next_tz("30 6 * * *", &utc(2025, 2, 3, 7, 0), chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 2, 4, 6, 30));
    }

    #[test]
    fn matching_instant_is_excluded() {
        // Strictly-after semantics: from exactly 09:00, hourly fires at 10:00.
        let next = cron_next_tz("0 * * * *", &utc(2025, 2, 3, 9, 0), chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 2, 3, 10, 0));
    }

    #[test]
    fn step_expression_rounds_up() {
        let next = cron_next_tz("*/15 * * * *", &utc(2025, 2, 3, 9, 7), chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 2, 3, 9, 15));
    }

    #[test]
    fn weekday_field_skips_to_the_right_day() {
        // 2025-02-05 is a Wednesday; Mondays at 12:15 → Feb 10.
        let next = cron_next_tz("15 12 * * 1", &utc(2025, 2, 5, 0, 0), chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2025, 2, 10, 12, 15));
    }

    #[test]
    fn half_hour_timezone_offset_applies() {
        // 09:00 in Asia/Kolkata (UTC+5:30) is 03:30 UTC.
        let tz = parse_tz("Asia/Kolkata");
        let next = cron_next_tz("0 9 * * *", &utc(2025, 2, 3, 0, 0), tz).unwrap();
        assert_eq!(next, utc(2025, 2, 3, 3, 30));
    }

    #[test]
    fn dst_transition_still_yields_a_real_instant() {
        // Europe/Berlin springs forward 2025-03-30: 02:30 local does not
        // exist that day. The evaluator must come back with an actual
        // future instant rather than erroring on the gap.
        let tz = parse_tz("Europe/Berlin");
        let after = utc(2025, 3, 29, 12, 0);
        let next = cron_next_tz("30 2 * * *", &after, tz).unwrap();
        assert!(next > after);
        assert!(next < utc(2025, 4, 1, 0, 0));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/Real"), chrono_tz::UTC);
        assert_eq!(parse_tz(""), chrono_tz::UTC);
        assert_eq!(parse_tz("Europe/Paris"), chrono_tz::Europe::Paris);
    }

    #[test]
    fn malformed_expression_has_no_next() {
        assert!(cron_next_tz("* * *", &utc(2025, 2, 3, 9, 0), chrono_tz::UTC).is_none());
    }
}
