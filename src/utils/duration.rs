use crate::error::{LockError, Result};
use std::time::Duration;

/// Parse a duration string like "250ms", "30s", "5m", "2h".
/// Defaults to seconds if no unit specified
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(LockError::InvalidDuration {
            input: s.to_string(),
            message: "empty string".to_string(),
        });
    }

    // "ms" must be checked before "s" and "m".
    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        // No unit, assume seconds
        (s, "s")
    };

    let value: u64 = num_str.trim().parse().map_err(|_| LockError::InvalidDuration {
        input: s.to_string(),
        message: "expected format: NUMBER[ms|s|m|h] (e.g., '250ms', '8s', '5m')".to_string(),
    })?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 60 * 60),
        _ => Duration::from_secs(value),
    };

    Ok(duration)
}
