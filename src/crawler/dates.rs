//! Timestamp parsing for the date formats the archive pages use

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %I:%M %p",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%B %d %Y %I:%M %p",
    "%B %d %Y %H:%M",
    "%b %d %Y %I:%M %p",
    "%b %d %Y %H:%M",
];

/// Parses a page timestamp into UTC
///
/// Accepts RFC 3339, epoch seconds or milliseconds, the classic permalink
/// form `2008-03-01 12:34 pm (UTC)`, and long forms such as
/// `March 1st, 2008, 12:34 pm`. Times without an offset are taken as UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit()) {
        let value: i64 = text.parse().ok()?;
        // Twelve or more digits is milliseconds
        return if text.len() >= 12 {
            Utc.timestamp_millis_opt(value).single()
        } else {
            Utc.timestamp_opt(value, 0).single()
        };
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    let cleaned = clean(text);

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    for format in ["%Y-%m-%d", "%B %d %Y", "%b %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, format) {
            return date.and_hms_opt(0, 0, 0).map(|d| Utc.from_utc_datetime(&d));
        }
    }

    None
}

/// Drops a trailing UTC marker, commas and ordinal suffixes
fn clean(text: &str) -> String {
    let text = text
        .trim_end_matches("(UTC)")
        .trim_end()
        .trim_end_matches(" UTC")
        .replace(',', " ");

    text.split_whitespace()
        .map(strip_ordinal)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_ordinal(word: &str) -> &str {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(number) = word.strip_suffix(suffix) {
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                return number;
            }
        }
    }
    word
}
