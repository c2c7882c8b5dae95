use std::time::Duration;

use crate::Error;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = 30 * DAY;

/// Parses the short time-window form used by telemetry queries: an integer
/// followed by a unit in `{h, d, w, m}`, where `m` means a 30-day month,
/// not a calendar month.
pub fn parse_time_window(input: &str) -> Result<Duration, Error> {
    let input = input.trim();
    let unit = input.chars().last().ok_or_else(|| {
        Error::Validation(format!("empty time window {input:?}"))
    })?;

    let multiplier = match unit {
        'h' => HOUR,
        'd' => DAY,
        'w' => WEEK,
        'm' => MONTH,
        other => {
            return Err(Error::Validation(format!(
                "unknown time window unit {other:?} in {input:?}, expected one of h/d/w/m"
            )))
        }
    };

    let count_str = &input[..input.len() - unit.len_utf8()];
    let count: u64 = count_str.parse().map_err(|_| {
        Error::Validation(format!("invalid time window {input:?}: not of the form <int><h|d|w|m>"))
    })?;

    if count == 0 {
        return Err(Error::Validation(format!(
            "time window {input:?} must be a positive integer"
        )));
    }

    Ok(Duration::from_secs(count * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_time_window("1h").unwrap(), Duration::from_secs(HOUR));
        assert_eq!(parse_time_window("7d").unwrap(), Duration::from_secs(7 * DAY));
        assert_eq!(parse_time_window("2w").unwrap(), Duration::from_secs(2 * WEEK));
        assert_eq!(parse_time_window("1m").unwrap(), Duration::from_secs(MONTH));
    }

    #[test]
    fn rejects_zero_unknown_unit_and_garbage() {
        assert!(parse_time_window("0d").is_err());
        assert!(parse_time_window("5y").is_err());
        assert!(parse_time_window("abc").is_err());
        assert!(parse_time_window("").is_err());
    }
}
