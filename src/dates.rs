use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("unrecognized date token: {0:?}")]
    Unrecognized(String),

    #[error("not a calendar date: {0:?}")]
    Invalid(String),
}

/// Convert a provider date token into `YYYY-MM-DD`.
///
/// `YYYYMMDD` is sliced, `YYYY-MM` gets day `01`, and any other token that
/// already carries a separator is returned as-is. Tokens matching none of
/// these are rejected rather than re-dated.
pub fn normalize_date(token: &str) -> Result<String, DateError> {
    let token = token.trim();

    if token.len() == 8 && token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(format!("{}-{}-{}", &token[0..4], &token[4..6], &token[6..8]));
    }

    if is_year_month(token) {
        return Ok(format!("{token}-01"));
    }

    if token.contains(['-', '/', '.']) {
        return Ok(token.to_string());
    }

    Err(DateError::Unrecognized(token.to_string()))
}

/// Normalize a token and require the result to be a real calendar date.
pub fn parse_report_date(token: &str) -> Result<NaiveDate, DateError> {
    let normalized = normalize_date(token)?;
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .map_err(|_| DateError::Invalid(normalized))
}

fn is_year_month(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_tokens_are_sliced() {
        for token in ["20240105", "19991231", "20260229", "00000000"] {
            let normalized = normalize_date(token).unwrap();
            assert_eq!(
                normalized,
                format!("{}-{}-{}", &token[0..4], &token[4..6], &token[6..8])
            );
            assert_eq!(normalized.len(), 10);
        }
    }

    #[test]
    fn year_month_gets_first_day() {
        assert_eq!(normalize_date("2024-03").unwrap(), "2024-03-01");
    }

    #[test]
    fn separated_forms_pass_through() {
        assert_eq!(normalize_date("2024-03-09").unwrap(), "2024-03-09");
        assert_eq!(normalize_date("2024/03/09").unwrap(), "2024/03/09");
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        assert_eq!(
            normalize_date("yesterday"),
            Err(DateError::Unrecognized("yesterday".to_string()))
        );
        assert!(normalize_date("2024010").is_err());
        assert!(normalize_date("").is_err());
    }

    #[test]
    fn report_dates_must_exist_on_the_calendar() {
        assert_eq!(
            parse_report_date("20240229").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert!(matches!(
            parse_report_date("20230229"),
            Err(DateError::Invalid(_))
        ));
        assert!(matches!(
            parse_report_date("2024/03/09"),
            Err(DateError::Invalid(_))
        ));
    }
}
