//! Utilities shared by the amqp-pubsub crates
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Boolean Parsing**: Lenient truthy/falsy parsing for string-typed metadata
//! - **Timestamp Utilities**: Millisecond timestamps and their formatting
//! - **Counter Implementation**: Thread-safe counter with a high-water mark ([`Counter`])
//!
//! ## Usage Examples:
//! ```rust
//! use amqp_pubsub_utils::{is_truthy, to_duration};
//!
//! let duration = to_duration("1m30s");
//! assert_eq!(duration.as_secs(), 90);
//!
//! assert!(is_truthy("Yes"));
//! assert!(!is_truthy("0"));
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::anyhow;

mod counter;

pub use counter::Counter;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// # Example:
/// ```
/// let duration = amqp_pubsub_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let backoff = amqp_pubsub_utils::to_duration("250ms");
/// assert_eq!(backoff.as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    try_to_duration(text).unwrap_or(Duration::ZERO)
}

/// Strict form of [`to_duration`]. Returns `None` when a segment is malformed, a unit is
/// unknown, or the total does not fit in `u64` milliseconds.
///
/// ```
/// use amqp_pubsub_utils::try_to_duration;
/// assert_eq!(try_to_duration("0s").map(|d| d.as_millis()), Some(0));
/// assert_eq!(try_to_duration("0.5s"), None);
/// assert_eq!(try_to_duration("999999999999999d"), None);
/// ```
pub fn try_to_duration(text: &str) -> Option<Duration> {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    if text.is_empty() {
        return None;
    }
    let mut ms: u64 = 0;
    for x in text.split_inclusive(['s', 'm', 'h', 'd', 'Y']) {
        let mut chars = x.chars();
        let u = chars.nth_back(0)?;
        let v = chars.as_str().trim().parse::<u64>().ok()?;
        let scale: u64 = match u {
            'Y' => 1,
            's' => 1000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => return None,
        };
        ms = ms.checked_add(v.checked_mul(scale)?)?;
    }
    Some(Duration::from_millis(ms))
}

/// Lenient boolean parsing, `y`, `yes`, `true`, `on` and `1` are truthy (case-insensitive)
#[inline]
pub fn is_truthy(text: &str) -> bool {
    matches!(text.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "true" | "t" | "on" | "1")
}

/// Strict boolean parsing, unknown values are an error
///
/// # Example:
/// ```
/// assert_eq!(amqp_pubsub_utils::parse_bool("TRUE").unwrap(), true);
/// assert_eq!(amqp_pubsub_utils::parse_bool("off").unwrap(), false);
/// assert!(amqp_pubsub_utils::parse_bool("maybe").is_err());
/// ```
#[inline]
pub fn parse_bool(text: &str) -> anyhow::Result<bool> {
    if is_truthy(text) {
        return Ok(true);
    }
    match text.trim().to_ascii_lowercase().as_str() {
        "n" | "no" | "false" | "f" | "off" | "0" => Ok(false),
        _ => Err(anyhow!(format!("invalid boolean value, {text:?}"))),
    }
}

/// Get current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}
