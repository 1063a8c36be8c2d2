//! Timecode parsing for trim windows
//!
//! Accepts `1h2m3s` style codes (as found in VOD share links), `HH:MM:SS`,
//! `MM:SS` and plain seconds.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timecode `{0}`")]
pub struct TimecodeError(pub String);

/// Parse a timecode into seconds
pub fn parse_timecode(input: &str) -> Result<f64, TimecodeError> {
    let text = input.trim();
    let err = || TimecodeError(input.to_string());
    if text.is_empty() {
        return Err(err());
    }

    if text.contains(':') {
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() > 3 {
            return Err(err());
        }
        let mut total = 0.0;
        for (i, part) in parts.iter().enumerate() {
            let value: f64 = part.parse().map_err(|_| err())?;
            if value < 0.0 || (i > 0 && value >= 60.0) {
                return Err(err());
            }
            total = total * 60.0 + value;
        }
        return Ok(total);
    }

    if text.ends_with(|c: char| matches!(c, 'h' | 'm' | 's')) {
        let mut total = 0.0;
        let mut number = String::new();
        let mut last_unit = 0;
        for ch in text.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
                continue;
            }
            let (unit, rank) = match ch {
                'h' => (3600.0, 1),
                'm' => (60.0, 2),
                's' => (1.0, 3),
                _ => return Err(err()),
            };
            if number.is_empty() || rank <= last_unit {
                return Err(err());
            }
            let value: f64 = number.parse().map_err(|_| err())?;
            total += value * unit;
            number.clear();
            last_unit = rank;
        }
        return Ok(total);
    }

    let value: f64 = text.parse().map_err(|_| err())?;
    if value < 0.0 || !value.is_finite() {
        return Err(err());
    }
    Ok(value)
}

/// Format seconds as `HH:MM:SS.mmm` for ffmpeg arguments
pub fn format_timestamp(seconds: f64) -> String {
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let (h, rem) = (millis / 3_600_000, millis % 3_600_000);
    let (m, rem) = (rem / 60_000, rem % 60_000);
    let (s, ms) = (rem / 1000, rem % 1000);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}

/// Format whole seconds as `HH:MM:SS`
pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}
