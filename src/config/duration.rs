//! ISO-8601 duration parsing for configuration values.
//!
//! All duration-valued configuration keys use the compact `PT`-prefixed
//! grammar (`PT3S`, `PT1M30S`, `P1DT2H`). Parsing is strict: a malformed
//! value is a fatal configuration error, never silently ignored.

use std::time::Duration;

use thiserror::Error;

/// Error raised for a malformed ISO-8601 duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ISO-8601 duration '{value}': {reason}")]
pub struct DurationParseError {
    /// The offending input.
    pub value: String,
    /// Why parsing failed.
    pub reason: &'static str,
}

impl DurationParseError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

/// Parse an ISO-8601 duration (`PnDTnHnMnS`, case-insensitive).
///
/// Supports days, hours, minutes, and seconds with an optional fractional
/// second component. Negative durations are rejected.
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.starts_with('-') {
        return Err(DurationParseError::new(input, "negative durations are not allowed"));
    }

    let upper = s.to_ascii_uppercase();
    let rest = upper
        .strip_prefix('P')
        .ok_or_else(|| DurationParseError::new(input, "must start with 'P'"))?;

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    if date_part.is_empty() && time_part.is_none() {
        return Err(DurationParseError::new(input, "empty duration"));
    }
    if let Some(t) = time_part {
        if t.is_empty() {
            return Err(DurationParseError::new(input, "empty time component after 'T'"));
        }
    }

    let mut total = Duration::ZERO;

    if !date_part.is_empty() {
        for (number, unit) in split_components(date_part, input)? {
            match unit {
                'D' => {
                    let days: u64 = parse_integer(&number, input)?;
                    total = add_unit(total, days, 86_400, input)?;
                }
                _ => return Err(DurationParseError::new(input, "unsupported unit in date component")),
            }
        }
    }

    if let Some(time) = time_part {
        let mut seen_seconds = false;
        for (number, unit) in split_components(time, input)? {
            if seen_seconds {
                return Err(DurationParseError::new(input, "components after seconds"));
            }
            match unit {
                'H' => {
                    let hours: u64 = parse_integer(&number, input)?;
                    total = add_unit(total, hours, 3_600, input)?;
                }
                'M' => {
                    let minutes: u64 = parse_integer(&number, input)?;
                    total = add_unit(total, minutes, 60, input)?;
                }
                'S' => {
                    seen_seconds = true;
                    total = total
                        .checked_add(parse_seconds(&number, input)?)
                        .ok_or_else(|| DurationParseError::new(input, "duration overflows"))?;
                }
                _ => return Err(DurationParseError::new(input, "unknown unit")),
            }
        }
    }

    Ok(total)
}

/// Render a duration in the canonical `PT…S` form used in logs and errors.
pub fn format_iso8601(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if nanos == 0 {
        format!("PT{secs}S")
    } else {
        let fractional = format!("{nanos:09}");
        format!("PT{}.{}S", secs, fractional.trim_end_matches('0'))
    }
}

fn split_components(
    part: &str,
    original: &str,
) -> Result<Vec<(String, char)>, DurationParseError> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() {
                return Err(DurationParseError::new(original, "unit without a value"));
            }
            out.push((std::mem::take(&mut number), c));
        } else {
            return Err(DurationParseError::new(original, "unexpected character"));
        }
    }
    if !number.is_empty() {
        return Err(DurationParseError::new(original, "trailing value without a unit"));
    }
    if out.is_empty() {
        return Err(DurationParseError::new(original, "no components"));
    }
    Ok(out)
}

fn add_unit(
    total: Duration,
    value: u64,
    unit_secs: u64,
    original: &str,
) -> Result<Duration, DurationParseError> {
    let secs = value
        .checked_mul(unit_secs)
        .ok_or_else(|| DurationParseError::new(original, "duration overflows"))?;
    total
        .checked_add(Duration::from_secs(secs))
        .ok_or_else(|| DurationParseError::new(original, "duration overflows"))
}

fn parse_integer(number: &str, original: &str) -> Result<u64, DurationParseError> {
    number
        .parse::<u64>()
        .map_err(|_| DurationParseError::new(original, "invalid integer value"))
}

fn parse_seconds(number: &str, original: &str) -> Result<Duration, DurationParseError> {
    match number.split_once('.') {
        None => Ok(Duration::from_secs(parse_integer(number, original)?)),
        Some((whole, frac)) => {
            if frac.is_empty() || frac.len() > 9 {
                return Err(DurationParseError::new(original, "invalid fractional seconds"));
            }
            let secs = parse_integer(whole, original)?;
            let padded = format!("{frac:0<9}");
            let nanos: u32 = padded
                .parse()
                .map_err(|_| DurationParseError::new(original, "invalid fractional seconds"))?;
            Ok(Duration::new(secs, nanos))
        }
    }
}

/// Serde adapters for ISO-8601 duration fields.
pub mod serde_iso {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    use super::parse_iso8601;

    /// Deserialize a required duration field.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_iso8601(&raw).map_err(D::Error::custom)
    }

    /// Deserialize an optional duration field (absent key stays `None`).
    pub fn option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_iso8601(&s).map_err(D::Error::custom))
            .transpose()
    }

    /// Deserialize a list of durations (e.g. a consumer backoff schedule).
    pub fn list<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        raw.iter()
            .map(|s| parse_iso8601(s).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_seconds() {
        assert_eq!(parse_iso8601("PT3S").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_iso8601("PT0S").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_composite() {
        assert_eq!(
            parse_iso8601("PT1H30M").unwrap(),
            Duration::from_secs(5_400)
        );
        assert_eq!(
            parse_iso8601("P1DT2H3M4S").unwrap(),
            Duration::from_secs(86_400 + 7_200 + 180 + 4)
        );
    }

    #[test]
    fn test_parse_fractional_seconds() {
        assert_eq!(
            parse_iso8601("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_iso8601("PT2.25S").unwrap(),
            Duration::from_millis(2_250)
        );
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(parse_iso8601("pt2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_malformed_is_an_error() {
        for bad in ["", "P", "PT", "5s", "PT5", "PTS", "PT-5S", "-PT5S", "PT1S2M"] {
            assert!(parse_iso8601(bad).is_err(), "expected failure for {bad:?}");
        }
    }

    #[test]
    fn test_overflowing_values_are_an_error_not_a_panic() {
        for huge in [
            "P999999999999999999D",
            "PT999999999999999999H",
            "P99999999999999999DT999999999999999999M",
        ] {
            assert!(parse_iso8601(huge).is_err(), "expected failure for {huge:?}");
        }
    }

    #[test]
    fn test_format_round_trip() {
        for d in [
            Duration::from_secs(120),
            Duration::from_millis(1_500),
            Duration::ZERO,
        ] {
            assert_eq!(parse_iso8601(&format_iso8601(d)).unwrap(), d);
        }
    }
}
