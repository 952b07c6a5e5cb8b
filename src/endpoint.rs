use std::fmt;
use std::sync::Arc;

use crate::error::ProvisioningError;

/// Connection parameters of a running database instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Endpoint {
    /// Datasource URL without credentials; username and password travel in their own keys.
    pub fn url(&self) -> String {
        format!("postgres://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Fully credentialed connection string for direct connections.
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=disable",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    /// Same server, different database.
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ProvisioningError> {
        if self.host.is_empty() {
            return Err(ProvisioningError::EndpointUnavailable(
                "empty host".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ProvisioningError::EndpointUnavailable(
                "port 0 is not a mapped port".to_string(),
            ));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ProvisioningError::EndpointUnavailable(
                "empty credentials".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.database);
        config
    }
}

// Keep the password out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Anything that can report the endpoint of a live database at the moment it is asked.
///
/// Implementations must read their current state on every call. Configuration
/// resolvers hold on to a source and only call it when settings are finalized, so a
/// value cached before the instance started would leak a placeholder into the
/// application.
pub trait EndpointSource: Send + Sync {
    fn current_endpoint(&self) -> Result<Endpoint, ProvisioningError>;
}

impl<T: EndpointSource + ?Sized> EndpointSource for Arc<T> {
    fn current_endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        (**self).current_endpoint()
    }
}
