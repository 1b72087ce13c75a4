//! Relative date phrases resolved against the dataset's reference date.
//! The data is historical, so wall-clock time is never consulted here.

use chrono::{Datelike, Duration, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// Window used for "recent" / "recently".
pub const RECENT_WINDOW_DAYS: i64 = 30;

static LAST_N_UNITS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:last|past|previous)\s+(\d{1,4})\s+(day|week|month|year)s?\b").unwrap()
});

static LAST_UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:last|past|previous)\s+(day|week|month|year)\b").unwrap());

static RECENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\brecent(?:ly)?\b").unwrap());

fn subtract(reference: NaiveDate, amount: u32, unit: &str) -> Option<NaiveDate> {
    match unit {
        "day" => reference.checked_sub_signed(Duration::days(amount as i64)),
        "week" => reference.checked_sub_signed(Duration::weeks(amount as i64)),
        "month" => reference.checked_sub_months(Months::new(amount)),
        "year" => reference.checked_sub_months(Months::new(amount.saturating_mul(12))),
        _ => None,
    }
}

/// Resolve a phrase like "last 30 days" to a concrete date.
///
/// Range-start parameters get the beginning of the window; range-end
/// parameters (`range_end = true`) get the reference date itself.
pub fn resolve_relative_date(text: &str, reference: NaiveDate, range_end: bool) -> Option<NaiveDate> {
    let lower = text.to_lowercase();

    if lower.contains("yesterday") {
        return reference.checked_sub_signed(Duration::days(1));
    }
    if lower.contains("today") {
        return Some(reference);
    }

    let start = if let Some(cap) = LAST_N_UNITS.captures(&lower) {
        let amount: u32 = cap[1].parse().ok()?;
        subtract(reference, amount, &cap[2])
    } else if let Some(cap) = LAST_UNIT.captures(&lower) {
        subtract(reference, 1, &cap[1])
    } else if RECENT.is_match(&lower) {
        reference.checked_sub_signed(Duration::days(RECENT_WINDOW_DAYS))
    } else if lower.contains("year to date") || lower.contains("ytd") || lower.contains("this year")
    {
        NaiveDate::from_ymd_opt(reference.year(), 1, 1)
    } else if lower.contains("this month") {
        NaiveDate::from_ymd_opt(reference.year(), reference.month(), 1)
    } else {
        None
    };
    let start = start?;

    if range_end {
        Some(reference)
    } else {
        Some(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 5, 31).unwrap()
    }

    #[test]
    fn test_last_n_days() {
        assert_eq!(
            resolve_relative_date("orders in the last 30 days", reference(), false),
            NaiveDate::from_ymd_opt(2016, 5, 1)
        );
    }

    #[test]
    fn test_last_month_uses_calendar_months() {
        assert_eq!(
            resolve_relative_date("sales last 2 months", reference(), false),
            NaiveDate::from_ymd_opt(2016, 3, 31)
        );
        assert_eq!(
            resolve_relative_date("past month", reference(), false),
            NaiveDate::from_ymd_opt(2016, 4, 30)
        );
    }

    #[test]
    fn test_recent_is_relative_to_reference_not_now() {
        assert_eq!(
            resolve_relative_date("recent invoices", reference(), false),
            NaiveDate::from_ymd_opt(2016, 5, 1)
        );
    }

    #[test]
    fn test_range_end_resolves_to_reference() {
        assert_eq!(
            resolve_relative_date("last 7 days", reference(), true),
            Some(reference())
        );
    }

    #[test]
    fn test_no_relative_phrase() {
        assert_eq!(resolve_relative_date("top suppliers", reference(), false), None);
    }
}
