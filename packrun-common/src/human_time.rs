//! Human-readable time formatting
//!
//! Used by activity log entries and the CLI for elapsed time and
//! remaining-time estimates.

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Format a duration in whole seconds, picking the coarsest sensible unit pair.
///
/// # Examples
///
/// ```
/// use packrun_common::human_time::format_duration;
///
/// assert_eq!(format_duration(45), "45s");
/// assert_eq!(format_duration(330), "5m 30s");
/// assert_eq!(format_duration(3_720), "1h 02m");
/// assert_eq!(format_duration(90_000), "1d 01h");
/// ```
pub fn format_duration(seconds: u64) -> String {
    if seconds < MINUTE {
        format!("{}s", seconds)
    } else if seconds < HOUR {
        format!("{}m {:02}s", seconds / MINUTE, seconds % MINUTE)
    } else if seconds < DAY {
        format!("{}h {:02}m", seconds / HOUR, (seconds % HOUR) / MINUTE)
    } else {
        format!("{}d {:02}h", seconds / DAY, (seconds % DAY) / HOUR)
    }
}

/// Format a remaining-time estimate; zero reads as "almost done".
pub fn format_eta(remaining_seconds: u64) -> String {
    if remaining_seconds == 0 {
        "almost done".to_string()
    } else {
        format!("~{} remaining", format_duration(remaining_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(60), "1m 00s");
        assert_eq!(format_duration(3_599), "59m 59s");
        assert_eq!(format_duration(3_600), "1h 00m");
        assert_eq!(format_duration(86_399), "23h 59m");
        assert_eq!(format_duration(86_400), "1d 00h");
    }

    #[test]
    fn test_eta() {
        assert_eq!(format_eta(0), "almost done");
        assert_eq!(format_eta(600), "~10m 00s remaining");
    }
}
