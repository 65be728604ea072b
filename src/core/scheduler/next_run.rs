use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::core::store::{ScheduleType, parse_local_datetime};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Next run after `now`, or `None` when the schedule never fires again
/// (`once`, a non-positive or non-numeric interval, an unparseable cron expression).
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once => None,
        ScheduleType::Interval => {
            let ms: i64 = value.trim().parse().ok()?;
            if ms <= 0 {
                return None;
            }
            now.checked_add_signed(Duration::milliseconds(ms))
        }
        ScheduleType::Cron => {
            let schedule = parse_cron(value)?;
            schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|next| next.with_timezone(&Utc))
        }
    }
}

/// First `next_run` of a newly scheduled task. `once` values are absolute instants
/// or naive local datetimes read in `tz`.
pub fn first_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once => parse_local_datetime(value, tz),
        _ => compute_next_run(schedule_type, value, tz, now),
    }
}

/// Accepts standard 5-field expressions (and 6/7-field ones with seconds/year).
pub fn parse_cron(expr: &str) -> Option<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let (seconds, rest): (&str, &[&str]) = match fields.len() {
        5 => ("0", &fields[..]),
        6 | 7 => (fields[0], &fields[1..]),
        _ => return None,
    };

    let mut normalized = vec![seconds.to_string()];
    for (idx, field) in rest.iter().enumerate() {
        if idx == 4 {
            normalized.push(posix_day_of_week(field)?);
        } else {
            normalized.push(field.to_string());
        }
    }
    Schedule::from_str(&normalized.join(" ")).ok()
}

/// POSIX numbers days 0-7 with both 0 and 7 as Sunday; the cron crate numbers them 1-7.
/// Numeric days are rewritten as names, which both agree on.
fn posix_day_of_week(field: &str) -> Option<String> {
    let items: Option<Vec<String>> = field.split(',').map(translate_dow_item).collect();
    Some(items?.join(","))
}

fn translate_dow_item(item: &str) -> Option<String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let with_step = |base: String| match step {
        Some(step) => format!("{}/{}", base, step),
        None => base,
    };

    if base == "*" || base == "?" {
        return Some(with_step(base.to_string()));
    }

    if let Some((start, end)) = base.split_once('-') {
        match (day_number(start), day_number(end)) {
            (Some(s), Some(e)) => {
                let (s, e) = (s % 7, e);
                if e == 7 && s > 0 && step.is_none() {
                    // "5-7" is Friday through Sunday
                    return Some(format!("{}-SAT,SUN", DAY_NAMES[s as usize]));
                }
                let e = if e == 7 { 6 } else { e };
                Some(with_step(format!(
                    "{}-{}",
                    DAY_NAMES[s as usize], DAY_NAMES[e as usize]
                )))
            }
            (None, None) => Some(with_step(base.to_string())),
            _ => None,
        }
    } else {
        match day_number(base) {
            Some(n) => Some(with_step(DAY_NAMES[(n % 7) as usize].to_string())),
            None if base.chars().all(|c| c.is_ascii_alphabetic()) => {
                Some(with_step(base.to_string()))
            }
            None => None,
        }
    }
}

fn day_number(raw: &str) -> Option<u32> {
    let n: u32 = raw.trim().parse().ok()?;
    (n <= 7).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn interval_adds_milliseconds() {
        let now = Utc::now();
        let next = compute_next_run(ScheduleType::Interval, "60000", Tz::UTC, now).unwrap();
        assert!(next >= now + Duration::seconds(55) && next <= now + Duration::seconds(65));
    }

    #[test]
    fn non_positive_or_garbage_intervals_never_fire() {
        let now = Utc::now();
        for value in ["0", "-5000", "soon", "", "1.5"] {
            assert_eq!(compute_next_run(ScheduleType::Interval, value, Tz::UTC, now), None, "{value}");
        }
    }

    #[test]
    fn cron_five_field_in_timezone() {
        // 2024-03-04 is a Monday
        let now = at(2024, 3, 4, 6, 0);
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let next = compute_next_run(ScheduleType::Cron, "0 9 * * *", berlin, now).unwrap();
        assert_eq!(next, at(2024, 3, 4, 8, 0));
    }

    #[test]
    fn cron_weekday_ranges_follow_posix_numbering() {
        // Saturday 2024-03-09
        let now = at(2024, 3, 9, 12, 0);
        let next = compute_next_run(ScheduleType::Cron, "0 9 * * 1-5", Tz::UTC, now).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);

        for sunday in ["0", "7", "SUN"] {
            let expr = format!("30 8 * * {}", sunday);
            let next = compute_next_run(ScheduleType::Cron, &expr, Tz::UTC, now).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
        }

        // Saturday's 10:00 has passed, so Sunday is next
        let weekend = compute_next_run(ScheduleType::Cron, "0 10 * * 5-7", Tz::UTC, now).unwrap();
        assert_eq!(weekend.weekday(), Weekday::Sun);
        let thursday = at(2024, 3, 7, 12, 0);
        let friday = compute_next_run(ScheduleType::Cron, "0 10 * * 5-7", Tz::UTC, thursday).unwrap();
        assert_eq!(friday.weekday(), Weekday::Fri);
    }

    #[test]
    fn six_field_cron_keeps_seconds() {
        let now = at(2024, 3, 4, 6, 0);
        let next = compute_next_run(ScheduleType::Cron, "30 */5 * * * *", Tz::UTC, now).unwrap();
        assert_eq!(next.second(), 30);
    }

    #[test]
    fn unparseable_cron_is_none() {
        let now = Utc::now();
        for expr in ["", "every day", "* * *", "0 9 * * 9", "61 * * * *"] {
            assert!(compute_next_run(ScheduleType::Cron, expr, Tz::UTC, now).is_none(), "{expr}");
        }
    }

    #[test]
    fn first_run_parses_once_values() {
        let now = at(2024, 1, 1, 0, 0);
        let tz: Tz = "America/New_York".parse().unwrap();
        let local = first_run(ScheduleType::Once, "2024-06-01T09:00:00", tz, now).unwrap();
        assert_eq!(local, at(2024, 6, 1, 13, 0));
        assert!(first_run(ScheduleType::Once, "later", tz, now).is_none());
        assert!(first_run(ScheduleType::Interval, "1000", tz, now).is_some());
    }

    proptest! {
        #[test]
        fn once_never_recomputes(value in ".*") {
            prop_assert!(compute_next_run(ScheduleType::Once, &value, Tz::UTC, Utc::now()).is_none());
        }

        #[test]
        fn positive_intervals_land_exactly(ms in 1i64..10_000_000) {
            let now = at(2024, 1, 1, 0, 0);
            let next = compute_next_run(ScheduleType::Interval, &ms.to_string(), Tz::UTC, now).unwrap();
            prop_assert_eq!(next - now, Duration::milliseconds(ms));
        }
    }
}
