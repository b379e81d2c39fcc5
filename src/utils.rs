use std::time::Duration;
use crate::errors::{Result, FleetError};

/// Parse a duration string like "30s", "10m", "5h", "7d" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(FleetError::config("Empty duration string"));
    }

    let (number_part, unit_part) = s.split_at(s.len() - 1);

    let value: u64 = number_part.parse()
        .map_err(|_| FleetError::config(format!("Invalid number in duration: {}", number_part)))?;

    if value == 0 {
        return Err(FleetError::config("Duration must be positive"));
    }

    let duration = match unit_part {
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 86400),
        _ => return Err(FleetError::config(format!("Invalid duration unit '{}'. Use 's', 'm', 'h' or 'd'", unit_part))),
    };

    Ok(duration)
}

/// Generate a fresh correlation ID for an outbound command
pub fn new_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
