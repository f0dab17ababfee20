//! Bridge configuration.
//!
//! Values come from three layers, later ones overriding earlier ones:
//! built-in defaults, an optional JSON file ([`BridgeConfig::from_json_file`]),
//! and `TICKBRIDGE_*` environment variables ([`BridgeConfig::apply_env`]).
//! The binary applies its command-line flags last.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_MAX_WORKERS: &str = "TICKBRIDGE_MAX_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "TICKBRIDGE_QUEUE_CAPACITY";
pub const ENV_ADMISSION_TIMEOUT_MS: &str = "TICKBRIDGE_ADMISSION_TIMEOUT_MS";

const MAX_ADMISSION_TIMEOUT_MS: u64 = 3_600_000;

/// Tunables for one bridge instance.
///
/// # Example
///
/// ```
/// use tickbridge_common::BridgeConfig;
/// use std::time::Duration;
///
/// let config = BridgeConfig::new()
///     .with_max_workers(2)
///     .with_queue_capacity(Some(64))
///     .with_admission_timeout(Some(Duration::from_secs(5)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum number of concurrently running pool workers
    pub max_workers: usize,
    /// Maximum number of queued (not yet running) jobs; `None` is unbounded
    pub queue_capacity: Option<usize>,
    /// How long an inbound unit may wait for admission; `None` waits forever
    pub admission_timeout_ms: Option<u64>,
    /// Stack size for worker threads; platform default when `None`
    pub worker_stack_size: Option<usize>,
    pub worker_name_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: Some(1024),
            admission_timeout_ms: Some(30_000),
            worker_stack_size: None,
            worker_name_prefix: "tickbridge-worker".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.admission_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_worker_stack_size(mut self, size: usize) -> Self {
        self.worker_stack_size = Some(size);
        self
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_ms.map(Duration::from_millis)
    }

    /// Loads a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidRequest(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Overlays `TICKBRIDGE_*` environment variables onto this configuration.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            self.max_workers = parse_number(ENV_MAX_WORKERS, &raw)? as usize;
        }
        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = match parse_number(ENV_QUEUE_CAPACITY, &raw)? {
                0 => None,
                n => Some(n as usize),
            };
        }
        if let Some(raw) = lookup(ENV_ADMISSION_TIMEOUT_MS) {
            self.admission_timeout_ms = match parse_number(ENV_ADMISSION_TIMEOUT_MS, &raw)? {
                0 => None,
                n => Some(n),
            };
        }
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_workers` is zero
    /// - `queue_capacity` is `Some(0)`
    /// - the admission timeout is zero or longer than one hour
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be greater than zero".to_string());
        }

        if self.queue_capacity == Some(0) {
            return Err("queue_capacity must be greater than zero (use null for unbounded)".to_string());
        }

        if let Some(ms) = self.admission_timeout_ms {
            if ms == 0 {
                return Err("admission timeout must be greater than zero".to_string());
            }
            if ms > MAX_ADMISSION_TIMEOUT_MS {
                return Err(format!("admission timeout must be <= 1 hour (got {} ms)", ms));
            }
        }

        Ok(())
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| BridgeError::InvalidRequest(format!("{} must be a non-negative integer: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.queue_capacity, Some(1024));
        assert_eq!(config.admission_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern_chaining() {
        let config = BridgeConfig::new()
            .with_max_workers(1)
            .with_queue_capacity(None)
            .with_admission_timeout(None)
            .with_worker_stack_size(256 * 1024);

        assert_eq!(config.max_workers, 1);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.admission_timeout(), None);
        assert_eq!(config.worker_stack_size, Some(256 * 1024));
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let err = BridgeConfig::new().with_max_workers(0).validate().unwrap_err();
        assert!(err.contains("max_workers"));
    }

    #[test]
    fn test_validate_zero_capacity_fails() {
        let err = BridgeConfig::new().with_queue_capacity(Some(0)).validate().unwrap_err();
        assert!(err.contains("queue_capacity"));
    }

    #[test]
    fn test_validate_excessive_timeout_fails() {
        let err = BridgeConfig::new()
            .with_admission_timeout(Some(Duration::from_secs(7200)))
            .validate()
            .unwrap_err();
        assert!(err.contains("1 hour"));
    }

    #[test]
    fn test_env_overlay() {
        let config = BridgeConfig::new()
            .apply_vars(vars(&[
                (ENV_MAX_WORKERS, "8"),
                (ENV_QUEUE_CAPACITY, "0"),
                (ENV_ADMISSION_TIMEOUT_MS, "250"),
            ]))
            .unwrap();

        assert_eq!(config.max_workers, 8);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.admission_timeout_ms, Some(250));
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let result = BridgeConfig::new().apply_vars(vars(&[(ENV_MAX_WORKERS, "lots")]));
        assert!(matches!(result, Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn test_from_json_file_keeps_defaults_for_missing_fields() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), r#"{"max_workers": 2, "admission_timeout_ms": null}"#).unwrap();

        let config = BridgeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.admission_timeout_ms, None);
        assert_eq!(config.queue_capacity, Some(1024));
    }

    #[test]
    fn test_from_json_file_missing_file() {
        let result = BridgeConfig::from_json_file("/nonexistent/tickbridge.json");
        assert!(matches!(result, Err(BridgeError::InvalidRequest(_))));
    }
}
