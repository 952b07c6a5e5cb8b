use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::harness::Isolation;
use crate::lifecycle::LifecyclePolicy;
use crate::provisioner::Readiness;
use crate::runtime::ImageSpec;
use crate::settings::DEFAULT_CONFIG_PATH;

pub const DEFAULT_HARNESS_CONFIG: &str = "config/harness.toml";
pub const DEFAULT_IMAGE: &str = "postgres:16-alpine";
pub const DEFAULT_CREDENTIAL: &str = "test";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READINESS_INTERVAL_MS: u64 = 250;

/// How the harness provisions its database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub image: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub startup_timeout_secs: u64,
    pub readiness_interval_ms: u64,
    pub readiness: Readiness,
    pub lifecycle: LifecyclePolicy,
    pub isolation: Isolation,
    /// Probe the endpoint after teardown and report a leak if it still answers.
    pub verify_teardown: bool,
    /// Static application config file, layered under the overlay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            username: DEFAULT_CREDENTIAL.to_string(),
            password: DEFAULT_CREDENTIAL.to_string(),
            database: DEFAULT_CREDENTIAL.to_string(),
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            readiness_interval_ms: DEFAULT_READINESS_INTERVAL_MS,
            readiness: Readiness::Postgres,
            lifecycle: LifecyclePolicy::PerClass,
            isolation: Isolation::Database,
            verify_teardown: true,
            settings_path: Some(DEFAULT_CONFIG_PATH.to_string()),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        ImageSpec::parse(&self.image).map_err(|e| anyhow::anyhow!("{e}"))?;

        if self.username.is_empty() {
            return Err(anyhow::anyhow!("username must not be empty"));
        }

        if self.password.is_empty() {
            return Err(anyhow::anyhow!("password must not be empty"));
        }

        if self.database.is_empty() {
            return Err(anyhow::anyhow!("database must not be empty"));
        }

        if self.startup_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "startup_timeout_secs must be greater than 0"
            ));
        }

        if self.readiness_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "readiness_interval_ms must be greater than 0"
            ));
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Applies `DBHARNESS_*` overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup("DBHARNESS_IMAGE") {
            self.image = image;
        }

        if let Some(username) = lookup("DBHARNESS_USERNAME") {
            self.username = username;
        }

        if let Some(password) = lookup("DBHARNESS_PASSWORD") {
            self.password = password;
        }

        if let Some(database) = lookup("DBHARNESS_DATABASE") {
            self.database = database;
        }

        if let Some(timeout_str) = lookup("DBHARNESS_STARTUP_TIMEOUT") {
            if let Ok(timeout_secs) = timeout_str.parse::<u64>() {
                self.startup_timeout_secs = timeout_secs;
            }
        }

        if let Some(policy_str) = lookup("DBHARNESS_LIFECYCLE") {
            match policy_str.parse::<LifecyclePolicy>() {
                Ok(policy) => self.lifecycle = policy,
                Err(e) => log::warn!("Ignoring DBHARNESS_LIFECYCLE: {e}"),
            }
        }

        if let Some(isolation_str) = lookup("DBHARNESS_ISOLATION") {
            match isolation_str.parse::<Isolation>() {
                Ok(isolation) => self.isolation = isolation,
                Err(e) => log::warn!("Ignoring DBHARNESS_ISOLATION: {e}"),
            }
        }
    }
}

/// Load configuration: env vars > config file > defaults
pub fn load_config(config_path: Option<&Path>) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::default();

    if let Some(path) = config_path {
        if path.exists() {
            let file_content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            config = toml::from_str(&file_content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            log::info!("Loaded harness configuration from file: {}", path.display());
        } else {
            log::info!(
                "Config file not found: {}, using defaults",
                path.display()
            );
        }
    }

    config.apply_env_overrides();

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    log::debug!("Final harness config: {config:?}");

    Ok(config)
}

/// Create a sample configuration file
pub fn create_sample_config(path: &Path) -> Result<()> {
    let config = HarnessConfig::default();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.image, "postgres:16-alpine");
        assert_eq!(config.username, "test");
        assert_eq!(config.lifecycle, LifecyclePolicy::PerClass);
    }

    #[test]
    fn test_config_serialization() {
        let config = HarnessConfig::default();
        let toml_str = toml::to_string(&config).unwrap();

        let parsed: HarnessConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: HarnessConfig = toml::from_str(
            r#"
            image = "postgres:15"
            lifecycle = "process-wide"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.image, "postgres:15");
        assert_eq!(parsed.lifecycle, LifecyclePolicy::ProcessWide);
        assert_eq!(parsed.password, "test");
        assert_eq!(parsed.startup_timeout_secs, 60);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DBHARNESS_IMAGE", "postgres:17"),
            ("DBHARNESS_STARTUP_TIMEOUT", "5"),
            ("DBHARNESS_LIFECYCLE", "process-wide"),
            ("DBHARNESS_ISOLATION", "not-a-mode"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.image, "postgres:17");
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.lifecycle, LifecyclePolicy::ProcessWide);
        // Invalid values leave the previous setting in place
        assert_eq!(config.isolation, Isolation::Database);
    }

    #[test]
    fn test_config_validation_errors() {
        let config = HarnessConfig {
            startup_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HarnessConfig {
            image: ":latest".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HarnessConfig {
            password: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        create_sample_config(&path).unwrap();

        let loaded: HarnessConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, HarnessConfig::default());
    }
}
