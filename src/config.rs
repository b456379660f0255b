//! Configuration surface recognized by the updater
use crate::constants;
use serde::{Deserialize, Serialize};

/// Updater configuration, typically deserialized from the host app's config.
///
/// Defaults mirror the documented option defaults: failed and superseded
/// bundles are auto-deleted, updates apply deferred (at the background
/// boundary), and the readiness deadline is ten seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterConfig {
    /// Manifest endpoint polled for updates; empty disables auto update
    pub auto_update_url: String,
    /// Whether the foreground hook polls the manifest endpoint
    pub auto_update: bool,
    /// Endpoint for fire-and-forget stats reports; empty disables reporting
    pub stats_url: String,
    /// Delete a bundle that failed its readiness deadline
    pub auto_delete_failed: bool,
    /// Delete the previous fallback once its successor is confirmed
    pub auto_delete_previous: bool,
    /// Milliseconds the app has to call `notify_app_ready` before rollback
    pub app_ready_timeout: u64,
    /// Wipe all downloaded bundles when the native major version increases
    pub reset_when_update: bool,
    /// Activate a fresh download immediately instead of staging it
    pub direct_update: bool,
    /// Native app version, used to detect native upgrades
    pub version_native: String,
    /// Application id sent with manifest and stats requests
    pub app_id: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            auto_update_url: String::new(),
            auto_update: false,
            stats_url: String::new(),
            auto_delete_failed: true,
            auto_delete_previous: true,
            app_ready_timeout: constants::DEFAULT_APP_READY_TIMEOUT_MS,
            reset_when_update: true,
            direct_update: false,
            version_native: String::new(),
            app_id: String::new(),
        }
    }
}

impl UpdaterConfig {
    /// Auto update requires both the flag and a manifest URL
    pub fn is_auto_update_enabled(&self) -> bool {
        self.auto_update && !self.auto_update_url.is_empty()
    }
}

/// Parses the leading numeric component of a version string
pub fn major_of(version: &str) -> u64 {
    version
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .split(['.', '-', '+'])
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UpdaterConfig::default();
        assert!(config.auto_delete_failed);
        assert!(config.auto_delete_previous);
        assert!(config.reset_when_update);
        assert!(!config.direct_update);
        assert_eq!(config.app_ready_timeout, 10_000);
        assert!(!config.is_auto_update_enabled());
    }

    #[test]
    fn test_auto_update_needs_url() {
        let mut config = UpdaterConfig {
            auto_update: true,
            ..Default::default()
        };
        assert!(!config.is_auto_update_enabled());
        config.auto_update_url = "https://updates.example.com".into();
        assert!(config.is_auto_update_enabled());
    }

    #[test]
    fn test_major_of() {
        assert_eq!(major_of("4.2.1"), 4);
        assert_eq!(major_of("v10.0"), 10);
        assert_eq!(major_of("3"), 3);
        assert_eq!(major_of(""), 0);
        assert_eq!(major_of("beta"), 0);
    }

    #[test]
    fn test_camel_case_keys() {
        let config: UpdaterConfig = serde_json::from_str(
            r#"{"autoUpdateUrl":"https://u.example.com","autoUpdate":true,"appReadyTimeout":500}"#,
        )
        .unwrap();
        assert_eq!(config.auto_update_url, "https://u.example.com");
        assert_eq!(config.app_ready_timeout, 500);
        assert!(config.auto_delete_failed);
    }
}
