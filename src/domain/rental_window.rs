use crate::config::WindowRules;
use crate::error::{RentalError, Result};
use chrono::{DateTime, NaiveTime, Timelike, Utc};

/// Checks a requested rental window against the booking rules at `now`.
///
/// The first violated rule is reported; each message names the rule so the
/// caller can surface it as-is.
pub fn validate(
    rules: &WindowRules,
    now: DateTime<Utc>,
    pick_up: DateTime<Utc>,
    drop_off: DateTime<Utc>,
) -> Result<()> {
    let fail = |msg: String| Err(RentalError::ValidationError(msg));

    if pick_up < now + rules.min_pick_up_lead() {
        return fail(format!(
            "pick-up must be at least {} minutes from now",
            rules.min_pick_up_lead_minutes
        ));
    }
    if pick_up > now + rules.max_pick_up_advance() {
        return fail(format!(
            "pick-up must be within {} days from now",
            rules.max_pick_up_advance_days
        ));
    }
    if drop_off < now + rules.min_drop_off_lead() {
        return fail(format!(
            "drop-off must be at least {} minutes from now",
            rules.min_drop_off_lead_minutes
        ));
    }
    if drop_off < pick_up + rules.min_rental() {
        return fail(format!(
            "drop-off must be at least {} minutes after pick-up",
            rules.min_rental_minutes
        ));
    }
    if drop_off > pick_up + rules.max_rental() {
        return fail(format!("rental cannot exceed {} days", rules.max_rental_days));
    }

    let offset = rules.local_offset()?;
    let local_now = now.with_timezone(&offset);
    let local_pick_up = pick_up.with_timezone(&offset);
    let local_drop_off = drop_off.with_timezone(&offset);

    let checkpoints = [
        ("pick-up", local_pick_up.time()),
        ("drop-off", local_drop_off.time()),
    ];
    for (label, at) in checkpoints {
        if !within_service_hours(rules, at) {
            return fail(format!(
                "{label} must be between {:02}:00 and {:02}:00",
                rules.service_open_hour, rules.service_close_hour
            ));
        }
    }

    if local_now.hour() >= rules.late_booking_hour
        && local_pick_up.date_naive() <= local_now.date_naive()
    {
        return fail(format!(
            "bookings placed after {:02}:00 must start on a later day",
            rules.late_booking_hour
        ));
    }

    Ok(())
}

fn within_service_hours(rules: &WindowRules, at: NaiveTime) -> bool {
    let Some(open) = NaiveTime::from_hms_opt(rules.service_open_hour, 0, 0) else {
        return false;
    };
    if at < open {
        return false;
    }
    match NaiveTime::from_hms_opt(rules.service_close_hour, 0, 0) {
        Some(close) => at <= close,
        // A close hour of 24 keeps the service open until midnight.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, hour, minute, 0).unwrap()
    }

    fn check(now: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<()> {
        validate(&WindowRules::default(), now, from, to)
    }

    #[test]
    fn test_accepts_regular_window() {
        assert!(check(at(14, 8, 0), at(15, 9, 0), at(17, 18, 0)).is_ok());
    }

    #[test]
    fn test_pick_up_lead_time_boundary() {
        let now = at(14, 8, 0);
        assert!(check(now, at(14, 10, 0), at(14, 14, 0)).is_ok());
        assert!(check(now, at(14, 9, 59), at(14, 14, 0)).is_err());
    }

    #[test]
    fn test_rejects_pick_up_beyond_sixty_days() {
        let now = at(14, 8, 0);
        let from = now + Duration::days(61);
        assert!(check(now, from, from + Duration::hours(5)).is_err());
    }

    #[test]
    fn test_drop_off_rules() {
        let now = at(14, 8, 0);
        // Two hours after pick-up but less than four hours from now.
        assert!(check(now, at(14, 10, 0), at(14, 11, 59)).is_err());
        // Shorter than the two hour minimum.
        assert!(check(now, at(15, 10, 0), at(15, 11, 0)).is_err());
        // Longer than thirty days.
        assert!(check(now, at(15, 10, 0), at(15, 10, 0) + Duration::days(31)).is_err());
    }

    #[test]
    fn test_service_hours() {
        let now = at(14, 8, 0);
        assert!(check(now, at(15, 5, 59), at(15, 12, 0)).is_err());
        assert!(check(now, at(15, 6, 0), at(15, 22, 0)).is_ok());
        assert!(check(now, at(15, 9, 0), at(15, 22, 1)).is_err());
    }

    #[test]
    fn test_late_booking_moves_to_next_day() {
        let now = at(14, 20, 30);
        let err = check(now, at(14, 22, 0), at(15, 9, 0)).unwrap_err();
        assert!(matches!(err, RentalError::ValidationError(_)));
        assert!(check(now, at(15, 6, 0), at(15, 12, 0)).is_ok());
    }

    #[test]
    fn test_service_hours_follow_local_offset() {
        let rules = WindowRules {
            utc_offset_minutes: 7 * 60,
            ..WindowRules::default()
        };
        // 23:00 UTC is 06:00 at UTC+7.
        let now = at(14, 1, 0);
        assert!(validate(&rules, now, at(14, 23, 0), at(15, 5, 0)).is_ok());
        assert!(validate(&rules, now, at(14, 22, 0), at(15, 5, 0)).is_err());
    }
}
