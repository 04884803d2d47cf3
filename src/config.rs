//! Engine configuration, loaded from `~/.momentum/config.json`.
//!
//! Every field has a default, so a missing file is a valid zero-config
//! install: weekly rollover Monday 00:00 UTC, standard settle backoff, and
//! the database in its default location.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::consistency::RetrySettings;

fn default_enabled() -> bool {
    true
}

/// Monday just after midnight, so the new ISO week exists when the batch runs.
fn default_cron() -> String {
    "5 0 * * 1".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// One cron-scheduled job: 5-field cron expression plus the timezone it is
/// evaluated in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cron: default_cron(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub schedule: ScheduleEntry,
    pub consistency: RetrySettings,
    /// Override for the database location; `None` means
    /// `~/.momentum/momentum.db`.
    pub store_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn config_path() -> Result<PathBuf, String> {
        let home = dirs::home_dir().ok_or_else(|| "Could not determine home directory".to_string())?;
        Ok(home.join(".momentum").join("config.json"))
    }

    /// Load the configuration, falling back to defaults when no file exists.
    /// An unreadable or malformed file is an error, not a silent default.
    pub fn load() -> Result<Self, String> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("Invalid config {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_documented_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.cron, "5 0 * * 1");
        assert_eq!(config.schedule.timezone, "UTC");
        assert_eq!(config.consistency.retries, 3);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let raw = r#"{
            "schedule": { "cron": "0 6 * * 1", "timezone": "America/New_York" },
            "consistency": { "retries": 5 }
        }"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.cron, "0 6 * * 1");
        assert_eq!(config.schedule.timezone, "America/New_York");
        assert_eq!(config.consistency.retries, 5);
        assert_eq!(config.consistency.base_delay_ms, 800);
    }
}
