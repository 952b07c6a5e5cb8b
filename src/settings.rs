use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::error::ConfigurationBindingError;
use crate::overlay::ResolvedOverlay;

pub const ENV_PREFIX: &str = "APP";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Configuration of the application under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    pub datasource: Datasource,
    pub server: Server,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datasource {
    pub url: String,
    pub username: String,
    pub password: String,
    pub pool_size: usize,
}

impl Default for Datasource {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/app".to_string(),
            username: "app".to_string(),
            password: "app".to_string(),
            pool_size: 8,
        }
    }
}

impl fmt::Debug for Datasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datasource")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// 0 binds a random free port.
    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Settings {
    /// Loads from `config/default.toml` and `APP__*` variables without overrides.
    pub fn new() -> Result<Self, ConfigurationBindingError> {
        Self::load(
            Some(Path::new(DEFAULT_CONFIG_PATH)),
            &ResolvedOverlay::default(),
        )
    }

    /// Builds settings with precedence defaults < file < environment < overlay.
    ///
    /// The overlay is applied as overrides on this one value only; it does not touch
    /// the process environment or any other settings instance.
    pub fn load(
        config_path: Option<&Path>,
        overlay: &ResolvedOverlay,
    ) -> Result<Self, ConfigurationBindingError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        for (key, value) in overlay.iter() {
            builder = builder.set_override(key, value)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Every dotted key the application reads when it builds its settings.
    pub fn readable_keys() -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if let Ok(value) = serde_json::to_value(Settings::default()) {
            flatten_keys("", &value, &mut keys);
        }
        keys
    }
}

fn flatten_keys(prefix: &str, value: &serde_json::Value, keys: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (name, child) in map {
                let key = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };
                flatten_keys(&key, child, keys);
            }
        }
        _ => {
            keys.insert(prefix.to_string());
        }
    }
}
