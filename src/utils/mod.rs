use chrono::{DateTime, Datelike, Utc};

/// Month key used to bucket provider-API usage, e.g. "2025-11".
pub fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

/// Usage percentage for quota display; 0 when the limit is 0.
pub fn usage_percentage(calls: i64, limit: u32) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    calls as f64 / limit as f64 * 100.0
}

/// Highest configured warning threshold at or below the current usage, as a
/// display label ("none", "80%", "95%", ...).
pub fn warning_level(percentage: f64, thresholds: &[f64]) -> String {
    thresholds
        .iter()
        .rev()
        .find(|&&t| percentage >= t)
        .map(|t| format!("{:.0}%", t))
        .unwrap_or_else(|| "none".to_string())
}

/// Ratings are stored full-precision; API payloads show two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Days in a month, for month-end usage projection.
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first = chrono::NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    Some((next - first).num_days() as u32)
}

/// Parse a "YYYY-MM" month key back into (year, month).
pub fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (year, month) = key.split_once('-')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_key_pads() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(month_key(at), "2025-03");
    }

    #[test]
    fn usage_percentage_handles_zero_limit() {
        assert_eq!(usage_percentage(500, 1000), 50.0);
        assert_eq!(usage_percentage(10, 0), 0.0);
    }

    #[test]
    fn warning_level_picks_highest_crossed() {
        let thresholds = [80.0, 90.0, 95.0];
        assert_eq!(warning_level(50.0, &thresholds), "none");
        assert_eq!(warning_level(80.0, &thresholds), "80%");
        assert_eq!(warning_level(92.3, &thresholds), "90%");
        assert_eq!(warning_level(99.0, &thresholds), "95%");
    }

    #[test]
    fn round2_truncates_display_noise() {
        assert_eq!(round2(1618.13371), 1618.13);
        assert_eq!(round2(-42.319), -42.32);
    }

    #[test]
    fn days_in_month_handles_rollover() {
        assert_eq!(days_in_month(2024, 12), Some(31));
        assert_eq!(days_in_month(2024, 2), Some(29));
        assert_eq!(days_in_month(2025, 2), Some(28));
        assert_eq!(days_in_month(2025, 13), None);
    }

    #[test]
    fn month_key_parses_back() {
        assert_eq!(parse_month_key("2025-03"), Some((2025, 3)));
        assert_eq!(parse_month_key("garbage"), None);
    }
}
