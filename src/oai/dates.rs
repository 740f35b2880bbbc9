//! OAI-PMH datestamps and granularity

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};

/// Datestamp granularity announced by a repository's Identify response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh:mm:ssZ`
    Seconds,
}

impl Granularity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "YYYY-MM-DD" => Some(Granularity::Day),
            "YYYY-MM-DDThh:mm:ssZ" => Some(Granularity::Seconds),
            _ => None,
        }
    }

    /// Formats `ts` for a `from`/`until` request argument
    pub fn format(&self, ts: DateTime<Utc>) -> String {
        match self {
            Granularity::Day => ts.format("%Y-%m-%d").to_string(),
            Granularity::Seconds => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Parses a UTC datestamp of either granularity
pub fn parse_datestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}
