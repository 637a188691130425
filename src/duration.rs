//! Human-readable durations for command line flags.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use atc_sensor_relay::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, unit, scale): (&str, &str, fn(u64) -> Option<Duration>) =
        if let Some(num) = src.strip_suffix("ms") {
            (num, "milliseconds", |n| Some(Duration::from_millis(n)))
        } else if let Some(num) = src.strip_suffix('h') {
            (num, "hours", |n| n.checked_mul(3600).map(Duration::from_secs))
        } else if let Some(num) = src.strip_suffix('m') {
            (num, "minutes", |n| n.checked_mul(60).map(Duration::from_secs))
        } else if let Some(num) = src.strip_suffix('s') {
            (num, "seconds", |n| Some(Duration::from_secs(n)))
        } else {
            (src, "duration", |n| Some(Duration::from_secs(n)))
        };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", unit, number))?;
    scale(value).ok_or_else(|| format!("{} out of range: {}", unit, number))
}
