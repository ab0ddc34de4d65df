//! Parsing for the human-readable duration strings used by templates and config.
//!
//! Accepts everything `humantime` does (`45s`, `30m`, `2h`, `1d`, `1w`,
//! `1h30m`, `1h 30m`), case-insensitively. A bare number without a unit is
//! rejected so that `2` is never silently read as seconds or hours.

use std::time::Duration;

use crate::error::{CoreError, Result};

/// Parse a duration string such as `"2h"` or `"1h30m"`.
///
/// # Examples
/// ```
/// # use lab_core::duration::parse_duration;
/// # use std::time::Duration;
/// assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert!(parse_duration("90").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let invalid = |reason: String| CoreError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty value".to_string()));
    }
    if trimmed.ends_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("missing unit (use s, m, h, d or w)".to_string()));
    }

    let duration = humantime::parse_duration(&trimmed.to_ascii_lowercase())
        .map_err(|e| invalid(e.to_string()))?;
    if duration.is_zero() {
        return Err(invalid("duration must be greater than zero".to_string()));
    }
    Ok(duration)
}
