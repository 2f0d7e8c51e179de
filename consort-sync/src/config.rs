//! Client configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::error::SyncError;

/// Tunables for one [`SyncClient`](crate::client::SyncClient).
///
/// ```toml
/// heartbeat_interval_secs = 10
/// heartbeats_enabled = true
/// max_pending_operations = 512
/// max_pending_updates = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum time between heartbeats of one ordered collection.
    pub heartbeat_interval_secs: u64,
    /// Publish heartbeats at all.
    pub heartbeats_enabled: bool,
    /// Unacknowledged local operations allowed per ordered collection.
    pub max_pending_operations: usize,
    /// Unacknowledged local writes allowed per property.
    pub max_pending_updates: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            heartbeats_enabled: true,
            max_pending_operations: 512,
            max_pending_updates: 64,
        }
    }
}

impl SyncConfig {
    /// Parse from TOML; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, SyncError> {
        let config: Self = toml::from_str(source).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_pending_operations == 0 {
            return Err(SyncError::Config("max_pending_operations must be at least 1".into()));
        }
        if self.max_pending_updates == 0 {
            return Err(SyncError::Config("max_pending_updates must be at least 1".into()));
        }
        if self.heartbeats_enabled && self.heartbeat_interval_secs == 0 {
            return Err(SyncError::Config(
                "heartbeat_interval_secs must be positive when heartbeats are enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
        assert_eq!(SyncConfig::default().heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str("max_pending_updates = 8").unwrap();
        assert_eq!(config.max_pending_updates, 8);
        assert_eq!(config.max_pending_operations, 512);
        assert!(config.heartbeats_enabled);
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert!(matches!(
            SyncConfig::from_toml_str("max_pending_operations = 0"),
            Err(SyncError::Config(_))
        ));
        let config = SyncConfig::from_toml_str(
            "heartbeats_enabled = false\nheartbeat_interval_secs = 0",
        )
        .unwrap();
        assert!(!config.heartbeats_enabled);
    }

    #[test]
    fn test_malformed_toml() {
        assert!(SyncConfig::from_toml_str("heartbeat_interval_secs = \"soon\"").is_err());
    }
}
