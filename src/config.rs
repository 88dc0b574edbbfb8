use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Month-day pair, used for the active-season window so that comparisons
/// survive the year rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub const fn new(month: u32, day: u32) -> Self {
        Self { month, day }
    }
}

/// Every tunable of the system. Read once at process start, replaced whole
/// via PUT /api/admin/config; in-flight tasks keep the snapshot captured at
/// task start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Provider quota
    pub monthly_api_limit: u32,
    /// Ascending soft-warning percentages, logged once per month each.
    pub warning_thresholds: Vec<f64>,
    /// Refresh calls are refused at or above this usage percentage.
    pub quota_block_threshold: f64,

    // Active-season window (inclusive, month-day pairs, may wrap the year)
    pub season_start: MonthDay,
    pub season_end: MonthDay,

    // Weekly scheduled update (UTC wall clock)
    pub update_weekday: String,
    pub update_hour: u32,
    pub update_minute: u32,

    // Elo parameters
    pub k_factor: f64,
    pub home_field_advantage: f64,
    pub mov_cap: f64,

    // Prediction parameters
    pub base_score: f64,
    pub score_sensitivity: f64,
    pub high_confidence: f64,
    pub medium_confidence: f64,

    /// When true, playoff and bowl games count toward ratings.
    pub count_postseason: bool,

    // Provider client
    pub provider_timeout_secs: u64,
    pub provider_max_retries: u32,
    /// Overall update-task timeout in seconds; expiry issues cancellation.
    pub task_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            monthly_api_limit: 1000,
            warning_thresholds: vec![80.0, 90.0, 95.0],
            quota_block_threshold: 90.0,
            season_start: MonthDay::new(8, 1),
            season_end: MonthDay::new(1, 31),
            update_weekday: "sunday".to_string(),
            update_hour: 6,
            update_minute: 0,
            k_factor: 32.0,
            home_field_advantage: 65.0,
            mov_cap: 2.5,
            base_score: 30.0,
            score_sensitivity: 3.5,
            high_confidence: 0.80,
            medium_confidence: 0.65,
            count_postseason: false,
            provider_timeout_secs: 30,
            provider_max_retries: 3,
            task_timeout_secs: 30 * 60,
        }
    }
}

impl AppConfig {
    /// Whether `now` falls inside the active-season window. The window is
    /// inclusive on both ends and may wrap the year boundary (the default
    /// August 1 – January 31 does).
    pub fn in_active_window(&self, now: DateTime<Utc>) -> bool {
        let md = MonthDay::new(now.month(), now.day());
        if self.season_start <= self.season_end {
            self.season_start <= md && md <= self.season_end
        } else {
            md >= self.season_start || md <= self.season_end
        }
    }

    pub fn update_weekday(&self) -> Weekday {
        self.update_weekday.parse().unwrap_or(Weekday::Sun)
    }

    /// Reject obviously broken values before accepting a PUT.
    pub fn validate(&self) -> Result<(), String> {
        if self.monthly_api_limit == 0 {
            return Err("monthly_api_limit must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&self.quota_block_threshold) {
            return Err("quota_block_threshold must be within 0..=100".to_string());
        }
        if self
            .warning_thresholds
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            return Err("warning_thresholds must be strictly ascending".to_string());
        }
        if self.update_hour > 23 || self.update_minute > 59 {
            return Err("update time must be a valid wall-clock time".to_string());
        }
        if self.update_weekday.parse::<Weekday>().is_err() {
            return Err(format!("unknown weekday: {}", self.update_weekday));
        }
        if self.k_factor <= 0.0 || self.mov_cap <= 0.0 {
            return Err("k_factor and mov_cap must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.high_confidence)
            || !(0.0..=1.0).contains(&self.medium_confidence)
            || self.medium_confidence >= self.high_confidence
        {
            return Err("confidence boundaries must satisfy 0 <= medium < high <= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn default_window_wraps_year_boundary() {
        let config = AppConfig::default();
        assert!(config.in_active_window(at(2024, 8, 1)));
        assert!(config.in_active_window(at(2024, 11, 15)));
        assert!(config.in_active_window(at(2025, 1, 31)));
        assert!(!config.in_active_window(at(2025, 2, 1)));
        assert!(!config.in_active_window(at(2024, 7, 31)));
        assert!(!config.in_active_window(at(2024, 5, 10)));
    }

    #[test]
    fn non_wrapping_window() {
        let config = AppConfig {
            season_start: MonthDay::new(3, 1),
            season_end: MonthDay::new(6, 30),
            ..AppConfig::default()
        };
        assert!(config.in_active_window(at(2024, 4, 15)));
        assert!(!config.in_active_window(at(2024, 7, 1)));
        assert!(!config.in_active_window(at(2024, 12, 25)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.monthly_api_limit = 0;
        assert!(config.validate().is_err());

        config = AppConfig {
            warning_thresholds: vec![90.0, 80.0],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        config = AppConfig {
            update_weekday: "someday".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        config = AppConfig {
            medium_confidence: 0.9,
            high_confidence: 0.8,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn weekday_parses() {
        let config = AppConfig::default();
        assert_eq!(config.update_weekday(), Weekday::Sun);
    }
}
