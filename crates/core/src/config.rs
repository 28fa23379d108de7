use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_INAPP__` and an optional TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub in_app: InAppConfig,
    #[serde(default)]
    pub tag_groups: TagGroupsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InAppConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_display_interval_ms")]
    pub display_interval_ms: u64,
    /// Channels created at or before this instant count as new users.
    #[serde(default)]
    pub new_user_cutoff: Option<DateTime<Utc>>,
}

/// Tag-group cache settings. Field names match the `tag_groups` object of
/// the remote config payload so the same type parses both.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagGroupsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_age_seconds")]
    pub cache_max_age_seconds: u64,
    #[serde(default = "default_cache_stale_read_time_seconds")]
    pub cache_stale_read_time_seconds: u64,
    #[serde(default = "default_cache_prefer_local_until_seconds")]
    pub cache_prefer_local_until_seconds: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_display_interval_ms() -> u64 {
    30_000
}
fn default_cache_max_age_seconds() -> u64 {
    600
}
fn default_cache_stale_read_time_seconds() -> u64 {
    3600
}
fn default_cache_prefer_local_until_seconds() -> u64 {
    600
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            display_interval_ms: default_display_interval_ms(),
            new_user_cutoff: None,
        }
    }
}

impl Default for TagGroupsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cache_max_age_seconds: default_cache_max_age_seconds(),
            cache_stale_read_time_seconds: default_cache_stale_read_time_seconds(),
            cache_prefer_local_until_seconds: default_cache_prefer_local_until_seconds(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CAMPAIGN_INAPP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.in_app.enabled);
        assert_eq!(config.in_app.display_interval_ms, 30_000);
        assert!(config.in_app.new_user_cutoff.is_none());
        assert_eq!(config.tag_groups.cache_max_age_seconds, 600);
        assert_eq!(config.tag_groups.cache_stale_read_time_seconds, 3600);
    }

    #[test]
    fn test_partial_remote_tag_groups() {
        let parsed: TagGroupsConfig =
            serde_json::from_value(serde_json::json!({"enabled": false, "cache_max_age_seconds": 120}))
                .unwrap();
        assert!(!parsed.enabled);
        assert_eq!(parsed.cache_max_age_seconds, 120);
        assert_eq!(parsed.cache_prefer_local_until_seconds, 600);
    }
}
