use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "invalid date format: {0:?}; expected YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS[Z], or RFC 3339 with an offset"
)]
pub struct DateParseError(pub String);

/// Parse a user-supplied date as UTC.
///
/// Naive values are taken to be UTC already; values with an offset are
/// converted. A bare date means midnight.
pub fn parse_date(input: &str) -> Result<DateTime<Utc>, DateParseError> {
    let value = input.trim();

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    let naive = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(at) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S") {
        return Ok(at.and_utc());
    }

    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| DateParseError(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_accepted_formats() {
        let midnight = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap();

        assert_eq!(parse_date("2025-06-01").unwrap(), midnight);
        assert_eq!(parse_date("2025-06-01T10:30:00").unwrap(), morning);
        assert_eq!(parse_date("2025-06-01T10:30:00Z").unwrap(), morning);
        assert_eq!(
            parse_date("2025-06-01T10:30:00+05:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 5, 30, 0).unwrap()
        );
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rejected_inputs() {
        for bad in ["", "invalid-date", "2025-02-30", "01/06/2025"] {
            let err = parse_date(bad).unwrap_err();
            assert!(err.to_string().starts_with("invalid date format"), "{bad}");
        }
    }
}
