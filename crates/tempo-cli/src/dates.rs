//! Flexible date and date-range parsing for the CLI.
//!
//! Ranges: `today`, `yesterday`, `last 7 days`, `last 30 days`,
//! `last week` (previous calendar week, locale week start), `last month`
//! (previous calendar month), and `<date> to <date>` / `<date> - <date>`.
//! Date literals accept ISO and day-month[-year] with numeric or named
//! months; an omitted year defaults to the current one. `last N days`
//! periods run backward from yesterday.

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, thiserror::Error)]
pub enum DateParseError {
    #[error("unrecognized date format: {0}")]
    UnrecognizedDate(String),
    #[error("invalid calendar date: {0}")]
    InvalidDate(String),
}

static FLEXIBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})[-/. ]([A-Za-z]+|\d{1,2})(?:[-/. ](\d{2,4}))?$").expect("date regex")
});

fn month_from_name(name: &str) -> Option<u32> {
    let key: String = name.to_lowercase().chars().take(3).collect();
    let month = match key.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Parse a single flexible date literal relative to `today`.
pub fn parse_flexible_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, DateParseError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("yesterday") {
        return Ok(today - Duration::days(1));
    }
    if raw.eq_ignore_ascii_case("today") {
        return Ok(today);
    }

    if let Some(caps) = FLEXIBLE_RE.captures(raw) {
        let day: u32 = caps[1]
            .parse()
            .map_err(|_| DateParseError::UnrecognizedDate(raw.to_string()))?;
        let month_raw = &caps[2];
        let month = match month_raw.parse::<u32>() {
            Ok(n) => n,
            Err(_) => month_from_name(month_raw)
                .ok_or_else(|| DateParseError::UnrecognizedDate(raw.to_string()))?,
        };
        let year = match caps.get(3) {
            Some(y) => {
                let mut year: i32 = y
                    .as_str()
                    .parse()
                    .map_err(|_| DateParseError::UnrecognizedDate(raw.to_string()))?;
                if year < 100 {
                    year += 2000;
                }
                year
            }
            None => today.year(),
        };
        return NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| DateParseError::InvalidDate(raw.to_string()));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| DateParseError::UnrecognizedDate(raw.to_string()))
}

/// First day of the week per locale environment: Sunday for US locales,
/// Monday otherwise. 0 = Monday .. 6 = Sunday.
pub fn week_start_day() -> u32 {
    for var in ["LC_ALL", "LC_TIME", "LANG"] {
        if let Ok(value) = std::env::var(var) {
            if value.is_empty() {
                continue;
            }
            return if value.to_uppercase().contains("US") { 6 } else { 0 };
        }
    }
    0
}

/// The previous calendar week relative to `reference`.
pub fn last_week_range(reference: NaiveDate, week_start: u32) -> (NaiveDate, NaiveDate) {
    let days_since_start = (reference.weekday().num_days_from_monday() + 7 - week_start) % 7;
    let current_week_start = reference - Duration::days(days_since_start as i64);
    let start = current_week_start - Duration::days(7);
    (start, start + Duration::days(6))
}

/// The previous calendar month relative to `reference`.
pub fn last_month_range(reference: NaiveDate) -> (NaiveDate, NaiveDate) {
    let current_month_start = reference.with_day(1).unwrap_or(reference);
    let end = current_month_start - Duration::days(1);
    let start = end.with_day(1).unwrap_or(end);
    (start, end)
}

/// Parse a date range phrase relative to `today`.
pub fn parse_date_range(raw: &str, today: NaiveDate) -> Result<(NaiveDate, NaiveDate), DateParseError> {
    let raw = raw.trim().to_lowercase();
    let raw = if raw.is_empty() { "yesterday" } else { raw.as_str() };
    let yesterday = today - Duration::days(1);

    match raw {
        "today" => return Ok((today, today)),
        "yesterday" => return Ok((yesterday, yesterday)),
        "last 7 days" => return Ok((yesterday - Duration::days(6), yesterday)),
        "last 30 days" => return Ok((yesterday - Duration::days(29), yesterday)),
        "last week" => return Ok(last_week_range(yesterday, week_start_day())),
        "last month" => return Ok(last_month_range(yesterday)),
        _ => {}
    }

    // Explicit range: "<date> to <date>" or "<date> - <date>". The hyphen
    // form requires surrounding spaces so ISO dates survive.
    for separator in [" to ", " - "] {
        if let Some((start_raw, end_raw)) = raw.split_once(separator) {
            let start = parse_flexible_date(start_raw, today)?;
            let end = parse_flexible_date(end_raw, today)?;
            return Ok((start, end));
        }
    }

    let single = parse_flexible_date(raw, today)?;
    Ok((single, single))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // Wednesday.
    fn today() -> NaiveDate {
        date(2025, 6, 18)
    }

    #[test]
    fn test_today_yesterday() {
        assert_eq!(parse_date_range("today", today()).unwrap(), (today(), today()));
        assert_eq!(
            parse_date_range("yesterday", today()).unwrap(),
            (date(2025, 6, 17), date(2025, 6, 17))
        );
        // Empty defaults to yesterday.
        assert_eq!(
            parse_date_range("", today()).unwrap(),
            (date(2025, 6, 17), date(2025, 6, 17))
        );
    }

    #[test]
    fn test_last_n_days_end_at_yesterday() {
        assert_eq!(
            parse_date_range("last 7 days", today()).unwrap(),
            (date(2025, 6, 11), date(2025, 6, 17))
        );
        assert_eq!(
            parse_date_range("last 30 days", today()).unwrap(),
            (date(2025, 5, 19), date(2025, 6, 17))
        );
    }

    #[test]
    fn test_last_week_monday_start() {
        // Reference Tuesday 2025-06-17; Monday-start week.
        let (start, end) = last_week_range(date(2025, 6, 17), 0);
        assert_eq!(start, date(2025, 6, 9));
        assert_eq!(end, date(2025, 6, 15));
    }

    #[test]
    fn test_last_week_sunday_start() {
        let (start, end) = last_week_range(date(2025, 6, 17), 6);
        assert_eq!(start, date(2025, 6, 8));
        assert_eq!(end, date(2025, 6, 14));
    }

    #[test]
    fn test_last_month() {
        let (start, end) = last_month_range(date(2025, 6, 17));
        assert_eq!(start, date(2025, 5, 1));
        assert_eq!(end, date(2025, 5, 31));

        // January boundary.
        let (start, end) = last_month_range(date(2025, 1, 10));
        assert_eq!(start, date(2024, 12, 1));
        assert_eq!(end, date(2024, 12, 31));
    }

    #[test]
    fn test_flexible_date_formats() {
        for raw in ["31-12-2024", "31/12/2024", "31.12.2024", "31 12 2024", "31-Dec-2024", "31 December 2024"] {
            assert_eq!(parse_flexible_date(raw, today()).unwrap(), date(2024, 12, 31), "{raw}");
        }
    }

    #[test]
    fn test_flexible_date_defaults_year() {
        assert_eq!(parse_flexible_date("31-12", today()).unwrap(), date(2025, 12, 31));
        assert_eq!(parse_flexible_date("5-Mar", today()).unwrap(), date(2025, 3, 5));
    }

    #[test]
    fn test_two_digit_year() {
        assert_eq!(parse_flexible_date("31-12-24", today()).unwrap(), date(2024, 12, 31));
    }

    #[test]
    fn test_iso_date() {
        assert_eq!(parse_flexible_date("2025-06-01", today()).unwrap(), date(2025, 6, 1));
    }

    #[test]
    fn test_explicit_ranges() {
        assert_eq!(
            parse_date_range("2025-06-01 to 2025-06-30", today()).unwrap(),
            (date(2025, 6, 1), date(2025, 6, 30))
        );
        assert_eq!(
            parse_date_range("1-6-2025 - 30-6-2025", today()).unwrap(),
            (date(2025, 6, 1), date(2025, 6, 30))
        );
        assert_eq!(
            parse_date_range("1 jun to 15 jun", today()).unwrap(),
            (date(2025, 6, 1), date(2025, 6, 15))
        );
    }

    #[test]
    fn test_single_date_is_degenerate_range() {
        assert_eq!(
            parse_date_range("2025-06-05", today()).unwrap(),
            (date(2025, 6, 5), date(2025, 6, 5))
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_flexible_date("not a date", today()).is_err());
        assert!(parse_flexible_date("32-13-2024", today()).is_err());
        assert!(parse_date_range("sometime soon", today()).is_err());
    }
}
