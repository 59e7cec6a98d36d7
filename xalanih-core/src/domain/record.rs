//! Applied-migration records stored in the tracking table

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format used when writing `applied_at` as a bound text parameter
const WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One row of the tracking table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub identifier: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: Option<String>,
}

impl AppliedRecord {
    pub fn new(identifier: impl Into<String>, applied_at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            applied_at,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Render a timestamp the way every engine accepts it as text
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.naive_utc().format(WRITE_FORMAT).to_string()
}

/// Parse a timestamp read back as text.
///
/// Engines render timestamps differently (`2024-01-02 03:04:05`,
/// `2024-01-02T03:04:05.123`, RFC 3339), so several forms are accepted.
/// Stored values carry no zone and are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_form() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_timestamp(&at), "2024-03-09 14:05:07.000000");
        assert_eq!(parse_timestamp(&format_timestamp(&at)), Some(at));
    }

    #[test]
    fn test_parse_engine_renderings() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(parse_timestamp("2024-03-09 14:05:07"), Some(at));
        assert_eq!(parse_timestamp("2024-03-09T14:05:07"), Some(at));
        assert_eq!(parse_timestamp("2024-03-09T14:05:07Z"), Some(at));
        assert_eq!(parse_timestamp("2024-03-09T16:05:07+02:00"), Some(at));
        assert!(parse_timestamp("yesterday").is_none());
    }
}
