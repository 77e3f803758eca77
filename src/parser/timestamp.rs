//! Timestamp grammar for export message lines.
//!
//! Three bracketed formats appear in the dialect, in order of preference:
//! `[YYYY-MM-DD HH:MM:SS UTC]` (authoritative), `[H:MM AM/PM]` and `[HH:MM]`
//! (both combined with the last seen date header). Only the leading bracketed
//! token on a line is ever consumed; bracketed tokens inside the body are
//! preserved verbatim.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

static FULL_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2}) (\d{2}:\d{2}:\d{2}) UTC\]").expect("hardcoded regex")
});

static AMPM_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{1,2}):(\d{2}) (AM|PM)\]").expect("hardcoded regex")
});

static HHMM_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d{2}):(\d{2})\]").expect("hardcoded regex"));

static DATE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-{2,} (\d{4})-(\d{2})-(\d{2}) -{2,}\s*$").expect("hardcoded regex")
});

/// Parse a `---- YYYY-MM-DD ----` date header line.
pub fn parse_date_header(line: &str) -> Option<NaiveDate> {
    let captures = DATE_HEADER.captures(line.trim_end())?;
    let year = captures[1].parse().ok()?;
    let month = captures[2].parse().ok()?;
    let day = captures[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse the leading bracketed timestamp of a message line.
///
/// Returns the UTC timestamp and the remainder of the line after the token
/// and any following space. `current_date` is the last date header seen,
/// required for the two time-only formats.
pub fn parse_leading_timestamp<'a>(
    line: &'a str,
    current_date: Option<NaiveDate>,
) -> Option<(DateTime<Utc>, &'a str)> {
    if let Some(captures) = FULL_TS.captures(line) {
        let date = NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d").ok()?;
        let time = NaiveTime::parse_from_str(&captures[2], "%H:%M:%S").ok()?;
        let ts = Utc.from_utc_datetime(&date.and_time(time));
        let rest = line[captures[0].len()..].trim_start_matches(' ');
        return Some((ts, rest));
    }

    if let Some(captures) = AMPM_TS.captures(line) {
        let date = current_date?;
        let hour: u32 = captures[1].parse().ok()?;
        let minute: u32 = captures[2].parse().ok()?;
        if hour == 0 || hour > 12 || minute > 59 {
            return None;
        }
        let hour = match (&captures[3], hour) {
            (meridiem, 12) if meridiem == "AM" => 0,
            (meridiem, h) if meridiem == "PM" && h != 12 => h + 12,
            (_, h) => h,
        };
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let ts = Utc.from_utc_datetime(&date.and_time(time));
        let rest = line[captures[0].len()..].trim_start_matches(' ');
        return Some((ts, rest));
    }

    if let Some(captures) = HHMM_TS.captures(line) {
        let date = current_date?;
        let hour: u32 = captures[1].parse().ok()?;
        let minute: u32 = captures[2].parse().ok()?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let ts = Utc.from_utc_datetime(&date.and_time(time));
        let rest = line[captures[0].len()..].trim_start_matches(' ');
        return Some((ts, rest));
    }

    None
}

/// Parse loose datetime text from header fields (`Created:`, `set on` suffixes).
///
/// Accepts the authoritative format with or without the `UTC` suffix and a
/// bare date.
pub fn parse_header_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_end_matches(" UTC");
    if let Ok(datetime) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&datetime));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}
