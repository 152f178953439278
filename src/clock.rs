//! Wall clock, date normalization, and content identity.
//!
//! Every date the system stores is ISO-8601 with an explicit offset; naive
//! local times never leave this module. The clock is pinned to a fixed
//! offset (the campus timezone) so ingestion and query agree on "now".

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use md5::Md5;
use sha2::{Digest, Sha256};

/// A wall clock pinned to a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: FixedOffset,
}

impl Clock {
    pub fn new(utc_offset_hours: i32) -> Self {
        // Offsets beyond ±23h are config typos; clamp rather than panic.
        let secs = utc_offset_hours.clamp(-23, 23) * 3600;
        let offset = FixedOffset::east_opt(secs).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    pub fn now_iso(&self) -> String {
        self.now().to_rfc3339()
    }

    /// Parse a stored ISO-8601 date. Dates without an offset are interpreted
    /// in the clock's timezone.
    pub fn parse_iso(&self, date: &str) -> Option<DateTime<FixedOffset>> {
        if date.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
            return Some(dt);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S") {
            return self.offset.from_local_datetime(&naive).single();
        }
        if let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            let naive = day.and_hms_opt(0, 0, 0)?;
            return self.offset.from_local_datetime(&naive).single();
        }
        None
    }

    /// Normalize a raw board date ("written 25-10-17 15:48", possibly with a
    /// localized prefix) to ISO-8601. Returns an empty string on failure so
    /// callers never store a half-parsed date.
    pub fn board_date_to_iso(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        // Strip any non-digit prefix the board theme prepends to the date.
        let start = trimmed.find(|c: char| c.is_ascii_digit()).unwrap_or(trimmed.len());
        let digits = trimmed[start..].trim();

        if let Ok(naive) = NaiveDateTime::parse_from_str(digits, "%y-%m-%d %H:%M") {
            if let Some(dt) = self.offset.from_local_datetime(&naive).single() {
                return dt.to_rfc3339();
            }
        }
        if let Ok(day) = NaiveDate::parse_from_str(digits, "%y-%m-%d") {
            if let Some(naive) = day.and_hms_opt(0, 0, 0) {
                if let Some(dt) = self.offset.from_local_datetime(&naive).single() {
                    return dt.to_rfc3339();
                }
            }
        }
        String::new()
    }

    /// Days elapsed between a stored date and now (negative for the future).
    pub fn days_since(&self, date: &str) -> Option<i64> {
        let then = self.parse_iso(date)?;
        Some((self.now() - then).num_days())
    }
}

/// Academic semester of a date: months 3–8 are semester 1 of the calendar
/// year; 9–12 semester 2; January/February belong to semester 2 of the
/// previous year.
pub fn semester_of(dt: &DateTime<FixedOffset>) -> (i32, u8) {
    let month = dt.month();
    let year = dt.year();
    if (3..=8).contains(&month) {
        (year, 1)
    } else if month >= 9 {
        (year, 2)
    } else {
        (year - 1, 2)
    }
}

/// Stable identity hash over a post's title + body (SHA-256 hex).
pub fn post_content_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content-address of downloaded file bytes (MD5 hex). Used as the
/// single-flight key for the external extraction API.
pub fn file_bytes_hash(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kst() -> Clock {
        Clock::new(9)
    }

    #[test]
    fn test_board_date_with_prefix() {
        let iso = kst().board_date_to_iso("written 25-10-17 15:48");
        assert_eq!(iso, "2025-10-17T15:48:00+09:00");
    }

    #[test]
    fn test_board_date_bare() {
        let iso = kst().board_date_to_iso("24-01-01 00:00");
        assert_eq!(iso, "2024-01-01T00:00:00+09:00");
    }

    #[test]
    fn test_board_date_unparseable() {
        assert_eq!(kst().board_date_to_iso("no date here"), "");
        assert_eq!(kst().board_date_to_iso(""), "");
    }

    #[test]
    fn test_parse_iso_roundtrip() {
        let clock = kst();
        let dt = clock.parse_iso("2024-02-15T09:00:00+09:00").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 2);
    }

    #[test]
    fn test_parse_iso_naive_gets_offset() {
        let clock = kst();
        let dt = clock.parse_iso("2024-02-15T09:00:00").unwrap();
        assert_eq!(dt.offset().local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn test_semester_boundaries() {
        let clock = kst();
        let spring = clock.parse_iso("2024-03-01T00:00:00+09:00").unwrap();
        assert_eq!(semester_of(&spring), (2024, 1));
        let fall = clock.parse_iso("2024-09-10T00:00:00+09:00").unwrap();
        assert_eq!(semester_of(&fall), (2024, 2));
        let january = clock.parse_iso("2025-01-15T00:00:00+09:00").unwrap();
        assert_eq!(semester_of(&january), (2024, 2));
    }

    #[test]
    fn test_content_hash_stable() {
        let a = post_content_hash("Title", "Body");
        let b = post_content_hash("Title", "Body");
        assert_eq!(a, b);
        assert_ne!(a, post_content_hash("Title", "Other"));
    }

    #[test]
    fn test_file_hash_known_value() {
        // md5("") is the canonical empty digest.
        assert_eq!(file_bytes_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
