//! Date and timestamp recognition for source values.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m-%d-%Y", "%d-%b-%Y", "%B %d, %Y"];

// `%.f` also matches an absent fraction.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse a value carrying a time of day. Offsets are normalized to UTC.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// A timestamp, or a bare date taken as midnight.
pub fn parse_any(s: &str) -> Option<NaiveDateTime> {
    parse_timestamp(s).or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_in_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2015, 1, 31).unwrap();
        for s in ["2015-01-31", "01/31/2015", "2015/01/31", "January 31, 2015"] {
            assert_eq!(parse_date(s), Some(expected), "{s}");
        }
        assert_eq!(parse_date("31/31/2015"), None);
    }

    #[test]
    fn timestamps_in_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2015, 1, 31)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        for s in [
            "2015-01-31 23:30:00",
            "2015-01-31T23:30:00",
            "2015-01-31T23:30:00Z",
            "2015-02-01T01:30:00+02:00",
            "01/31/2015 11:30:00 PM",
            "01/31/2015 23:30",
        ] {
            assert_eq!(parse_timestamp(s), Some(expected), "{s}");
        }
    }

    #[test]
    fn bare_date_is_not_a_timestamp_but_parses_as_any() {
        assert_eq!(parse_timestamp("2015-01-31"), None);
        let midnight = parse_any("2015-01-31").unwrap();
        assert_eq!(format_timestamp(midnight), "2015-01-31 00:00:00");
    }

    #[test]
    fn fractional_seconds_survive_formatting() {
        let ts = parse_timestamp("2015-01-31 23:30:00.25").unwrap();
        assert_eq!(format_timestamp(ts), "2015-01-31 23:30:00.250");
    }
}
