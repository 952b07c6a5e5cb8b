//! Runtime configuration overrides resolved from a live database.
//!
//! Keys map to zero-argument resolvers. Nothing is read at registration; every resolver
//! runs in [`ConfigOverlay::resolve`], which the harness calls only once the instance is
//! ready and right before the application settings are built.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::endpoint::EndpointSource;
use crate::error::{ConfigurationBindingError, HarnessError, ProvisioningError};

pub const DATASOURCE_URL: &str = "datasource.url";
pub const DATASOURCE_USERNAME: &str = "datasource.username";
pub const DATASOURCE_PASSWORD: &str = "datasource.password";

type Resolver = Box<dyn Fn() -> Result<String, ProvisioningError> + Send + Sync>;

/// Deferred key/value overrides for one test environment.
#[derive(Default)]
pub struct ConfigOverlay {
    resolvers: BTreeMap<String, Resolver>,
}

impl ConfigOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `supplier` for `key`, replacing any earlier registration.
    pub fn register<F>(&mut self, key: impl Into<String>, supplier: F) -> &mut Self
    where
        F: Fn() -> Result<String, ProvisioningError> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.resolvers.insert(key.clone(), Box::new(supplier)).is_some() {
            log::debug!("Overlay key {key} re-registered");
        }
        self
    }

    /// Binds the datasource URL, username and password to `source`.
    pub fn register_datasource<S>(&mut self, source: Arc<S>) -> &mut Self
    where
        S: EndpointSource + ?Sized + 'static,
    {
        let url_source = source.clone();
        let username_source = source.clone();
        let password_source = source;

        self.register(DATASOURCE_URL, move || {
            url_source.current_endpoint().map(|e| e.url())
        })
        .register(DATASOURCE_USERNAME, move || {
            username_source.current_endpoint().map(|e| e.username)
        })
        .register(DATASOURCE_PASSWORD, move || {
            password_source.current_endpoint().map(|e| e.password)
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Checks that every key is one the application actually reads.
    pub fn verify(&self, readable_keys: &BTreeSet<String>) -> Result<(), ConfigurationBindingError> {
        match self.keys().find(|key| !readable_keys.contains(*key)) {
            Some(key) => Err(ConfigurationBindingError::UnknownKey(key.to_string())),
            None => Ok(()),
        }
    }

    /// Runs every resolver against the current state of its source.
    pub fn resolve(&self) -> Result<ResolvedOverlay, HarnessError> {
        let mut values = BTreeMap::new();
        for (key, resolver) in &self.resolvers {
            let value = resolver()?;
            if value.is_empty() {
                return Err(ConfigurationBindingError::EmptyValue(key.clone()).into());
            }
            values.insert(key.clone(), value);
        }
        Ok(ResolvedOverlay { values })
    }
}

impl fmt::Debug for ConfigOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}

/// The values of an overlay at the moment it was resolved.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedOverlay {
    values: BTreeMap<String, String>,
}

impl ResolvedOverlay {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Environment variable form, e.g. `APP__DATASOURCE__URL` for prefix `APP`.
    pub fn env_vars(&self, prefix: &str) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(key, value)| {
                let name = format!("{prefix}__{}", key.replace('.', "__")).to_uppercase();
                (name, value.clone())
            })
            .collect()
    }

    /// Nested TOML table, one level per dotted key segment.
    pub fn to_toml(&self) -> toml::Table {
        let mut root = toml::Table::new();
        for (key, value) in &self.values {
            let mut segments: Vec<&str> = key.split('.').collect();
            let Some(leaf) = segments.pop() else {
                continue;
            };
            let mut table = &mut root;
            for segment in segments {
                let entry = table
                    .entry(segment.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                if !entry.is_table() {
                    *entry = toml::Value::Table(toml::Table::new());
                }
                let toml::Value::Table(next) = entry else {
                    unreachable!("entry was just made a table");
                };
                table = next;
            }
            table.insert(leaf.to_string(), toml::Value::String(value.clone()));
        }
        root
    }
}

impl fmt::Debug for ResolvedOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if key.ends_with("password") {
                map.entry(key, &"***");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use std::sync::Mutex;

    /// An endpoint source whose state can change after registration.
    #[derive(Default)]
    struct Switchable {
        current: Mutex<Option<Endpoint>>,
    }

    impl EndpointSource for Switchable {
        fn current_endpoint(&self) -> Result<Endpoint, ProvisioningError> {
            self.current
                .lock()
                .unwrap()
                .clone()
                .ok_or(ProvisioningError::NotStarted)
        }
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "localhost".to_string(),
            port,
            database: "test".to_string(),
            username: "test".to_string(),
            password: "test".to_string(),
        }
    }

    #[test]
    fn test_resolvers_read_state_at_resolve_time() {
        let source = Arc::new(Switchable::default());
        let mut overlay = ConfigOverlay::new();
        overlay.register_datasource(source.clone());

        // Registered before the instance exists: resolving now must fail, not yield a placeholder
        let err = overlay.resolve().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning(ProvisioningError::NotStarted)
        ));

        *source.current.lock().unwrap() = Some(endpoint(40001));
        let resolved = overlay.resolve().unwrap();
        assert_eq!(
            resolved.get(DATASOURCE_URL),
            Some("postgres://localhost:40001/test")
        );

        *source.current.lock().unwrap() = Some(endpoint(40002));
        let resolved = overlay.resolve().unwrap();
        assert_eq!(
            resolved.get(DATASOURCE_URL),
            Some("postgres://localhost:40002/test")
        );
        assert_eq!(resolved.get(DATASOURCE_USERNAME), Some("test"));
    }

    #[test]
    fn test_verify_rejects_unknown_keys() {
        let mut overlay = ConfigOverlay::new();
        overlay.register("spring.datasource.url", || Ok("x".to_string()));

        let readable: BTreeSet<String> = [DATASOURCE_URL.to_string()].into_iter().collect();
        let err = overlay.verify(&readable).unwrap_err();
        assert!(matches!(err, ConfigurationBindingError::UnknownKey(key) if key == "spring.datasource.url"));
    }

    #[test]
    fn test_empty_value_is_a_binding_error() {
        let mut overlay = ConfigOverlay::new();
        overlay.register(DATASOURCE_PASSWORD, || Ok(String::new()));
        assert!(matches!(
            overlay.resolve(),
            Err(HarnessError::Binding(ConfigurationBindingError::EmptyValue(_)))
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut overlay = ConfigOverlay::new();
        overlay.register("server.port", || Ok("1".to_string()));
        overlay.register("server.port", || Ok("2".to_string()));
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay.resolve().unwrap().get("server.port"), Some("2"));
    }

    #[test]
    fn test_env_and_toml_rendering() {
        let mut overlay = ConfigOverlay::new();
        overlay.register_datasource(Arc::new(Switchable {
            current: Mutex::new(Some(endpoint(5555))),
        }));
        let resolved = overlay.resolve().unwrap();

        let env = resolved.env_vars("APP");
        assert!(env.contains(&(
            "APP__DATASOURCE__URL".to_string(),
            "postgres://localhost:5555/test".to_string()
        )));

        let table = resolved.to_toml();
        assert_eq!(
            table["datasource"]["username"].as_str(),
            Some("test")
        );

        assert!(format!("{resolved:?}").contains("\"datasource.password\": \"***\""));
    }
}
