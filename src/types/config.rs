//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and then overridden by
//! `WARDEN_*` environment variables. Every section has defaults, so an empty
//! object is a valid config file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::governor::Limits;
use crate::types::{Error, Result};

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Handle registry reaping.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Resource governor sampling and limits.
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Throttle layer coalescing.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Shutdown orchestration deadlines.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the background loops cannot run with.
    ///
    /// Tick periods must be non-zero.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("registry.sweep_interval", self.registry.sweep_interval),
            ("governor.sample_interval", self.governor.sample_interval),
            ("governor.queue_probe_interval", self.governor.queue_probe_interval),
        ];
        for (key, period) in periods {
            if period.is_zero() {
                return Err(Error::validation(format!("{} must be non-zero", key)));
            }
        }
        Ok(())
    }

    /// Apply `WARDEN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("WARDEN_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("WARDEN_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        if let Some(raw) = lookup("WARDEN_SWEEP_INTERVAL") {
            self.registry.sweep_interval = parse_duration("WARDEN_SWEEP_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("WARDEN_SAMPLE_INTERVAL") {
            self.governor.sample_interval = parse_duration("WARDEN_SAMPLE_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("WARDEN_QUEUE_PROBE_INTERVAL") {
            self.governor.queue_probe_interval =
                parse_duration("WARDEN_QUEUE_PROBE_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("WARDEN_TASK_TIMEOUT") {
            self.shutdown.task_timeout = parse_duration("WARDEN_TASK_TIMEOUT", &raw)?;
        }
        self.validate()
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| Error::validation(format!("{}={:?}: {}", key, raw, e)))
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Handle registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How often destroyed handles are reaped.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Resource governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Main sampling period.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Period at which registered queue probes are re-evaluated.
    #[serde(with = "humantime_serde")]
    pub queue_probe_interval: Duration,

    /// Initial ceilings.
    #[serde(default)]
    pub limits: Limits,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            queue_probe_interval: Duration::from_secs(5),
            limits: Limits::default(),
        }
    }
}

/// Throttle layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Delay used by callers that do not pick one.
    #[serde(with = "humantime_serde")]
    pub default_delay: Duration,

    /// TTL used by callers that do not pick one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Cache entries older than this are swept regardless of their TTL.
    #[serde(with = "humantime_serde")]
    pub max_cache_age: Duration,

    /// Upper bound on how long a throttled batch may keep being re-armed.
    /// `None` lets a channel that never goes quiet coalesce forever.
    #[serde(default, with = "humantime_serde")]
    pub max_batch_age: Option<Duration>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_millis(100),
            default_ttl: Duration::from_secs(5),
            max_cache_age: Duration::from_secs(60),
            max_batch_age: Some(Duration::from_secs(1)),
        }
    }
}

/// Shutdown orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Deadline for each registered cleanup task.
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Grace period between a window close request and force-destroy.
    #[serde(with = "humantime_serde")]
    pub window_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(5),
            window_grace: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.governor.sample_interval, Duration::from_secs(10));
        assert_eq!(config.governor.queue_probe_interval, Duration::from_secs(5));
        assert_eq!(config.throttle.default_delay, Duration::from_millis(100));
        assert_eq!(config.throttle.max_cache_age, Duration::from_secs(60));
        assert_eq!(config.shutdown.task_timeout, Duration::from_secs(5));
        assert_eq!(config.governor.limits.max_memory_mb, 2048.0);
    }

    #[test]
    fn test_from_file_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "registry": {{ "sweep_interval": "2s" }},
                "throttle": {{
                    "default_delay": "50ms",
                    "default_ttl": "1s",
                    "max_cache_age": "10s",
                    "max_batch_age": null
                }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.throttle.default_delay, Duration::from_millis(50));
        assert_eq!(config.throttle.max_batch_age, None);
        // Untouched sections keep their defaults
        assert_eq!(config.shutdown.task_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let err = Config::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WARDEN_LOG_FORMAT", "JSON"),
            ("WARDEN_SWEEP_INTERVAL", "45s"),
            ("WARDEN_TASK_TIMEOUT", "250ms"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert!(config.observability.json_logs);
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(45));
        assert_eq!(config.shutdown.task_timeout, Duration::from_millis(250));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_from_file_rejects_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "governor": {{ "sample_interval": "0s", "queue_probe_interval": "5s" }} }}"#)
            .unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("governor.sample_interval")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_env_override_rejects_zero_interval() {
        for key in [
            "WARDEN_SWEEP_INTERVAL",
            "WARDEN_SAMPLE_INTERVAL",
            "WARDEN_QUEUE_PROBE_INTERVAL",
        ] {
            let mut config = Config::default();
            let err = config
                .apply_env_from(|k| (k == key).then(|| "0s".to_string()))
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{} accepted zero", key);
        }
    }

    #[test]
    fn test_env_override_rejects_garbage_duration() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(|k| (k == "WARDEN_SAMPLE_INTERVAL").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
