use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::Ms;
use crate::payment::RetryPolicy;

/// Server configuration, read from `HOLDFAST_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub hold_max_age_ms: Ms,
    pub reaper_interval: Duration,
    pub payment: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        }
        Self {
            port: parsed(&lookup, "HOLDFAST_PORT", 5480),
            bind: lookup("HOLDFAST_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("HOLDFAST_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            max_connections: parsed(&lookup, "HOLDFAST_MAX_CONNECTIONS", 256),
            compact_threshold: parsed(&lookup, "HOLDFAST_COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("HOLDFAST_METRICS_PORT").and_then(|s| s.parse().ok()),
            hold_max_age_ms: parsed::<Ms>(&lookup, "HOLDFAST_HOLD_MAX_AGE_MS", 3_600_000).max(1),
            // tokio's interval panics on a zero period
            reaper_interval: Duration::from_millis(parsed(&lookup, "HOLDFAST_REAPER_INTERVAL_MS", 30_000u64).max(1)),
            payment: RetryPolicy {
                timeout: Duration::from_millis(parsed(&lookup, "HOLDFAST_PAYMENT_TIMEOUT_MS", 10_000)),
                attempts: parsed(&lookup, "HOLDFAST_PAYMENT_RETRIES", 3u32).max(1),
                backoff: Duration::from_millis(parsed(&lookup, "HOLDFAST_PAYMENT_BACKOFF_MS", 200)),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("calendar.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hold_max_age_ms: self.hold_max_age_ms,
            payment: self.payment,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.addr(), "0.0.0.0:5480");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.hold_max_age_ms, 3_600_000);
        assert_eq!(cfg.reaper_interval, Duration::from_secs(30));
        assert_eq!(cfg.payment.attempts, 3);
        assert_eq!(cfg.payment.timeout, Duration::from_secs(10));
        assert_eq!(cfg.payment.backoff, Duration::from_millis(200));
    }

    #[test]
    fn overrides_and_bad_values() {
        let cfg = config(&[
            ("HOLDFAST_PORT", "7000"),
            ("HOLDFAST_BIND", "127.0.0.1"),
            ("HOLDFAST_METRICS_PORT", "9100"),
            ("HOLDFAST_HOLD_MAX_AGE_MS", "not-a-number"),
            ("HOLDFAST_PAYMENT_RETRIES", "0"),
        ]);
        assert_eq!(cfg.addr(), "127.0.0.1:7000");
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.hold_max_age_ms, 3_600_000);
        assert_eq!(cfg.payment.attempts, 1);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/calendar.wal"));
    }

    #[test]
    fn zero_periods_are_clamped() {
        let cfg = config(&[
            ("HOLDFAST_REAPER_INTERVAL_MS", "0"),
            ("HOLDFAST_HOLD_MAX_AGE_MS", "-5"),
        ]);
        assert_eq!(cfg.reaper_interval, Duration::from_millis(1));
        assert_eq!(cfg.hold_max_age_ms, 1);
    }
}
