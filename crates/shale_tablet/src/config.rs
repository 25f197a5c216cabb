//! Node configuration. Everything tunable lives here rather than in
//! process-wide statics, so several nodes can coexist in one process with
//! different settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hot-row protection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotRowProtectionMode {
    /// No serialization of contending transactions.
    Disable,
    /// Track and report would-wait decisions without blocking anyone.
    DryRun,
    /// Serialize transactions contending on the same row key.
    Enable,
}

impl Default for HotRowProtectionMode {
    fn default() -> Self {
        HotRowProtectionMode::Disable
    }
}

/// Limits for the hot-row transaction serializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotRowProtectionConfig {
    pub mode: HotRowProtectionMode,
    /// Transactions allowed to proceed concurrently for one row key.
    pub max_concurrency: usize,
    /// Cap on queued plus running transactions per row key.
    pub max_queue_size: usize,
    /// Cap on queued plus running transactions across all row keys.
    pub max_global_queue_size: usize,
}

impl Default for HotRowProtectionConfig {
    fn default() -> Self {
        Self {
            mode: HotRowProtectionMode::default(),
            max_concurrency: 5,
            max_queue_size: 20,
            max_global_queue_size: 1000,
        }
    }
}

/// Connection parameters for the backing storage instance, forwarded to the
/// subsystems that own physical connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub app_user: String,
    pub dba_user: String,
}

/// Top-level configuration of a tablet server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    /// Deadline attached to OLTP requests. Zero disables deadlines, and also
    /// disarms the shutdown time bomb.
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,
    /// Redact bind variables from errors returned to callers.
    pub terse_errors: bool,
    pub hot_row_protection: HotRowProtectionConfig,
    /// Allow DML batches to skip BEGIN/COMMIT and run autocommit.
    pub passthrough_dmls: bool,
    /// Truncation length for SQL and bind variables in error logs.
    /// Zero disables truncation.
    pub max_error_sql_len: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            terse_errors: false,
            hot_row_protection: HotRowProtectionConfig::default(),
            passthrough_dmls: false,
            max_error_sql_len: 0,
        }
    }
}

impl TabletConfig {
    pub fn hot_row_protection_enabled(&self) -> bool {
        self.hot_row_protection.mode != HotRowProtectionMode::Disable
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = TabletConfig::default();
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert!(!config.terse_errors);
        assert!(!config.hot_row_protection_enabled());
        assert_eq!(config.hot_row_protection.max_concurrency, 5);
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = r#"{
            "query_timeout": 0.5,
            "terse_errors": true,
            "hot_row_protection": {"mode": "enable", "max_queue_size": 3}
        }"#;
        let config: TabletConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.query_timeout, Duration::from_millis(500));
        assert!(config.terse_errors);
        assert!(config.hot_row_protection_enabled());
        assert_eq!(config.hot_row_protection.max_queue_size, 3);
        // Unspecified fields keep their defaults.
        assert_eq!(config.hot_row_protection.max_global_queue_size, 1000);
    }
}
