//! Shared utility functions used across the crate.

use std::time::Duration;

use crate::error::{Result, SwarmError};

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return None;
    }

    if unit.is_empty() || unit == "ms" {
        if let Ok(millis) = number.parse::<u64>() {
            return Some(Duration::from_millis(millis));
        }
        if unit.is_empty() {
            return None;
        }
    }

    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

/// Like [`parse_duration_str`] but reports which setting was malformed.
pub fn parse_duration(s: &str, setting: &str) -> Result<Duration> {
    parse_duration_str(s)
        .ok_or_else(|| SwarmError::Config(format!("invalid duration '{}' for {}", s, setting)))
}

/// Floor for timer periods taken from settings; a zero period would make
/// `tokio::time::interval` panic.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub fn timer_period(period: Duration) -> Duration {
    period.max(MIN_INTERVAL)
}

/// Ticks needed to move `distance` users at `rate` users per tick.
pub fn ticks_to_converge(distance: usize, rate: f64) -> u64 {
    if distance == 0 {
        return 0;
    }
    (distance as f64 / rate).ceil() as u64
}
