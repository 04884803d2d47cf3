//! ISO calendar week arithmetic for the rollover engine.
//!
//! All functions are pure and timezone-agnostic: weeks run Monday–Sunday and
//! are numbered per ISO-8601 (Thursday-anchored), written as zero-padded
//! `"YYYY-Www"` identifiers. These ids are the canonical keys for current-week
//! documents, archived summaries, and deterministic instance ids, so every
//! other module routes its date math through here.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use thiserror::Error;

/// Average weeks per month, used to normalize monthly durations to the
/// unified weeksRemaining counter once, at goal creation.
const WEEKS_PER_MONTH: f64 = 4.33;

/// Upper bound on `weeks_between` ranges. A user more than ten years behind
/// the system week indicates corrupt data, not downtime.
const MAX_WEEK_SPAN: usize = 522;

#[derive(Debug, Error, PartialEq)]
pub enum WeekIdError {
    #[error("malformed week id '{0}' (expected YYYY-Www)")]
    Malformed(String),
    #[error("week id '{0}' does not name a valid ISO week")]
    OutOfRange(String),
    #[error("week range {0}..{1} exceeds {MAX_WEEK_SPAN} weeks")]
    SpanTooLarge(String, String),
}

/// Format the ISO week containing `date` as `"YYYY-Www"`.
pub fn current_iso_week(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

/// Parse a `"YYYY-Www"` id into the Monday that starts that week.
pub fn parse_iso_week(week_id: &str) -> Result<NaiveDate, WeekIdError> {
    let (year_part, week_part) = week_id
        .split_once("-W")
        .ok_or_else(|| WeekIdError::Malformed(week_id.to_string()))?;
    let year: i32 = year_part
        .parse()
        .map_err(|_| WeekIdError::Malformed(week_id.to_string()))?;
    let week: u32 = week_part
        .parse()
        .map_err(|_| WeekIdError::Malformed(week_id.to_string()))?;
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
        .ok_or_else(|| WeekIdError::OutOfRange(week_id.to_string()))
}

/// Monday and Sunday of the given week.
pub fn week_range(week_id: &str) -> Result<(NaiveDate, NaiveDate), WeekIdError> {
    let monday = parse_iso_week(week_id)?;
    Ok((monday, monday + Duration::days(6)))
}

/// The id of the week immediately after `week_id`.
pub fn next_week_id(week_id: &str) -> Result<String, WeekIdError> {
    let monday = parse_iso_week(week_id)?;
    Ok(current_iso_week(monday + Duration::days(7)))
}

/// Ordered week ids from `from` (inclusive) to `to` (exclusive).
///
/// Returns an empty list when `from` is not strictly before `to` — callers
/// archive exactly this range, so a user already at or past the target week
/// archives nothing.
pub fn weeks_between(from: &str, to: &str) -> Result<Vec<String>, WeekIdError> {
    let from_monday = parse_iso_week(from)?;
    let to_monday = parse_iso_week(to)?;
    if from_monday >= to_monday {
        return Ok(Vec::new());
    }

    let mut weeks = Vec::new();
    let mut cursor = from_monday;
    while cursor < to_monday {
        if weeks.len() >= MAX_WEEK_SPAN {
            return Err(WeekIdError::SpanTooLarge(from.to_string(), to.to_string()));
        }
        weeks.push(current_iso_week(cursor));
        cursor += Duration::days(7);
    }
    Ok(weeks)
}

/// Calendar month (`"YYYY-MM"`) of the week's Monday.
///
/// A week straddling a month boundary belongs to its Monday's month; monthly
/// consistency goals carry completions forward exactly while this value is
/// stable across consecutive weeks.
pub fn month_id(week_id: &str) -> Result<String, WeekIdError> {
    let monday = parse_iso_week(week_id)?;
    Ok(format!("{:04}-{:02}", monday.year(), monday.month()))
}

/// Normalize a month count to its week-equivalent duration.
pub fn months_to_weeks(months: u32) -> i32 {
    (months as f64 * WEEKS_PER_MONTH).ceil() as i32
}

/// Whole ISO weeks from `current_week_id` until the week containing
/// `target_date` (a `YYYY-MM-DD` string, RFC 3339 prefixes accepted).
///
/// Returns −1 for an unparseable date or one whose week already passed, which
/// downstream reads as "exhausted". Invalid dates are a data-shape problem in
/// the stored goal, so they are logged rather than propagated.
pub fn weeks_until_date(target_date: &str, current_week_id: &str) -> Result<i32, WeekIdError> {
    let current_monday = parse_iso_week(current_week_id)?;

    let Some(date_part) = target_date.get(..10) else {
        log::warn!("Unparseable target date '{}'", target_date);
        return Ok(-1);
    };
    let Ok(target) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
        log::warn!("Unparseable target date '{}'", target_date);
        return Ok(-1);
    };

    let target_monday = parse_iso_week(&current_iso_week(target))?;
    let days = (target_monday - current_monday).num_days();
    if days < 0 {
        return Ok(-1);
    }
    Ok((days / 7) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn iso_week_ids_are_zero_padded() {
        assert_eq!(current_iso_week(date(2025, 3, 3)), "2025-W10");
        assert_eq!(current_iso_week(date(2025, 1, 6)), "2025-W02");
    }

    #[test]
    fn year_boundary_belongs_to_iso_year() {
        // Dec 30 2024 is the Monday of 2025-W01.
        assert_eq!(current_iso_week(date(2024, 12, 30)), "2025-W01");
        // Dec 31 2025 falls in 2026-W01.
        assert_eq!(current_iso_week(date(2025, 12, 31)), "2026-W01");
    }

    #[test]
    fn parse_round_trips_through_format() {
        let monday = parse_iso_week("2025-W10").unwrap();
        assert_eq!(monday, date(2025, 3, 3));
        assert_eq!(current_iso_week(monday), "2025-W10");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(matches!(
            parse_iso_week("2025-10"),
            Err(WeekIdError::Malformed(_))
        ));
        assert!(matches!(
            parse_iso_week("not a week"),
            Err(WeekIdError::Malformed(_))
        ));
        assert!(matches!(
            parse_iso_week("2025-W54"),
            Err(WeekIdError::OutOfRange(_))
        ));
    }

    #[test]
    fn week_range_spans_monday_to_sunday() {
        let (start, end) = week_range("2025-W10").unwrap();
        assert_eq!(start, date(2025, 3, 3));
        assert_eq!(end, date(2025, 3, 9));
    }

    #[test]
    fn next_week_crosses_short_and_long_years() {
        assert_eq!(next_week_id("2025-W10").unwrap(), "2025-W11");
        // 2025 has 52 ISO weeks; 2026 has 53.
        assert_eq!(next_week_id("2025-W52").unwrap(), "2026-W01");
        assert_eq!(next_week_id("2026-W52").unwrap(), "2026-W53");
        assert_eq!(next_week_id("2026-W53").unwrap(), "2027-W01");
    }

    #[test]
    fn weeks_between_is_inclusive_exclusive() {
        assert_eq!(
            weeks_between("2025-W10", "2025-W13").unwrap(),
            vec!["2025-W10", "2025-W11", "2025-W12"]
        );
        assert!(weeks_between("2025-W10", "2025-W10").unwrap().is_empty());
        assert!(weeks_between("2025-W11", "2025-W10").unwrap().is_empty());
    }

    #[test]
    fn weeks_between_rejects_absurd_spans() {
        assert!(matches!(
            weeks_between("2000-W01", "2025-W01"),
            Err(WeekIdError::SpanTooLarge(_, _))
        ));
    }

    #[test]
    fn month_id_follows_the_monday() {
        // W05 Monday is Jan 27; W06 Monday is Feb 3.
        assert_eq!(month_id("2025-W05").unwrap(), "2025-01");
        assert_eq!(month_id("2025-W06").unwrap(), "2025-02");
        // W09 Monday Feb 24 vs W10 Monday Mar 3 — the month flip used by carry tests.
        assert_eq!(month_id("2025-W09").unwrap(), "2025-02");
        assert_eq!(month_id("2025-W10").unwrap(), "2025-03");
    }

    #[test]
    fn months_normalize_with_ceiling() {
        assert_eq!(months_to_weeks(1), 5);
        assert_eq!(months_to_weeks(2), 9);
        assert_eq!(months_to_weeks(3), 13);
        assert_eq!(months_to_weeks(12), 52);
    }

    #[test]
    fn weeks_until_date_counts_whole_weeks() {
        // 2025-W50 Monday is Dec 8; Dec 31 falls in 2026-W01 (Monday Dec 29).
        assert_eq!(weeks_until_date("2025-12-31", "2025-W50").unwrap(), 3);
        // Date inside the current week.
        assert_eq!(weeks_until_date("2025-12-10", "2025-W50").unwrap(), 0);
        // Accepts RFC 3339 timestamps by prefix.
        assert_eq!(
            weeks_until_date("2025-12-31T00:00:00Z", "2025-W50").unwrap(),
            3
        );
    }

    #[test]
    fn weeks_until_date_flags_past_and_invalid_as_exhausted() {
        assert_eq!(weeks_until_date("2025-11-30", "2025-W50").unwrap(), -1);
        assert_eq!(weeks_until_date("soon", "2025-W50").unwrap(), -1);
        assert_eq!(weeks_until_date("", "2025-W50").unwrap(), -1);
    }
}
