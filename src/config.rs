use crate::buffers::{BufferSettings, WindowName};
use crate::liveness::LivenessThresholds;
use chrono::TimeDelta;
use std::env;
use std::time::Duration;

pub const DEFAULT_DEVICE_ID: &str = "ESP32C6_001";

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub device_id: String,
    /// Recorded as `user_id` on audit entries written by this process
    pub operator: String,
    pub poll_interval: Duration,
    /// Full reload of the multi-hour windows
    pub reload_interval: Duration,
    pub liveness_tick: Duration,
    pub buffers: BufferSettings,
    pub liveness: LivenessThresholds,
    pub twelve_hour_bucket: TimeDelta,
    pub twenty_four_hour_bucket: TimeDelta,
    /// Activity level below which a bucket counts as quiet
    pub quiet_threshold: f64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            operator: "dashboard".to_string(),
            poll_interval: Duration::from_secs(3),
            reload_interval: Duration::from_secs(120),
            liveness_tick: Duration::from_secs(2),
            buffers: BufferSettings::default(),
            liveness: LivenessThresholds::default(),
            twelve_hour_bucket: TimeDelta::minutes(5),
            twenty_four_hour_bucket: TimeDelta::minutes(10),
            quiet_threshold: 10.0,
        }
    }
}

impl DashboardConfig {
    /// Defaults overridden by `MOVEOMETER_*` variables. Unparseable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let buffers = BufferSettings {
            latest_max_items: env_parse("MOVEOMETER_LATEST_MAX_ITEMS", defaults.buffers.latest_max_items),
            page_size: env_parse("MOVEOMETER_PAGE_SIZE", defaults.buffers.page_size),
            max_rows: env_parse("MOVEOMETER_MAX_ROWS", defaults.buffers.max_rows),
            max_rows_24h: env_parse("MOVEOMETER_MAX_ROWS_24H", defaults.buffers.max_rows_24h),
            ..defaults.buffers.clone()
        };

        Self {
            device_id: env_var("MOVEOMETER_DEVICE_ID", &defaults.device_id),
            operator: env_var("MOVEOMETER_OPERATOR", &defaults.operator),
            poll_interval: env_seconds("MOVEOMETER_POLL_SECS", 3),
            reload_interval: env_seconds("MOVEOMETER_RELOAD_SECS", 120),
            liveness_tick: env_seconds("MOVEOMETER_LIVENESS_TICK_SECS", 2),
            buffers,
            quiet_threshold: env_parse("MOVEOMETER_QUIET_THRESHOLD", defaults.quiet_threshold),
            ..defaults
        }
    }

    /// Bucket width for the aggregated timelines; `None` for raw windows
    pub fn bucket_width(&self, window: WindowName) -> Option<TimeDelta> {
        match window {
            WindowName::TwelveHour => Some(self.twelve_hour_bucket),
            WindowName::TwentyFourHour => Some(self.twenty_four_hour_bucket),
            WindowName::Latest | WindowName::Hour => None,
        }
    }
}

fn env_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Interval in whole seconds, never zero
fn env_seconds(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DashboardConfig::default();
        assert_eq!(config.device_id, "ESP32C6_001");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.reload_interval, Duration::from_secs(120));
        assert_eq!(config.buffers.latest_max_items, 100);
        assert_eq!(config.bucket_width(WindowName::TwelveHour), Some(TimeDelta::minutes(5)));
        assert_eq!(config.bucket_width(WindowName::TwentyFourHour), Some(TimeDelta::minutes(10)));
        assert_eq!(config.bucket_width(WindowName::Hour), None);
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("MOVEOMETER_TEST_UNSET_VARIABLE", 7usize), 7);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        env::set_var("MOVEOMETER_TEST_ZERO_TICK_SECS", "0");
        assert_eq!(env_seconds("MOVEOMETER_TEST_ZERO_TICK_SECS", 2), Duration::from_secs(1));
        assert_eq!(env_seconds("MOVEOMETER_TEST_UNSET_TICK_SECS", 2), Duration::from_secs(2));
    }
}
