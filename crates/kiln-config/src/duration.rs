//! Duration strings.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Parse a humantime duration (`90s`, `15m`, `2h`, `1h 30m`). A bare number
/// is seconds.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = value
            .parse()
            .map_err(|_| ConfigError::invalid(field, format!("not a duration: {:?}", value)))?;
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(value)
        .map_err(|e| ConfigError::invalid(field, format!("{:?}: {}", value, e)))
}

/// Render a duration the way it is written in config files.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}
