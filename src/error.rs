use std::time::Duration;

use thiserror::Error;

/// The ephemeral database could not be started or its endpoint is not available.
///
/// Any of these aborts the whole test class before its body runs.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    #[error("invalid image reference '{0}'")]
    InvalidImage(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("database did not accept connections within {timeout:?}: {last_error}")]
    NotReady {
        timeout: Duration,
        last_error: String,
    },

    #[error("could not resolve container endpoint: {0}")]
    EndpointUnavailable(String),

    #[error("database instance is already started")]
    AlreadyStarted,

    #[error("database instance has not been started")]
    NotStarted,

    #[error("database instance has been stopped")]
    Stopped,

    #[error("shared database failed to start earlier in this process: {0}")]
    PreviouslyFailed(String),

    #[error("failed to prepare isolated database '{database}': {reason}")]
    Isolation { database: String, reason: String },
}

/// A configuration override does not line up with what the application reads.
#[derive(Debug, Error)]
pub enum ConfigurationBindingError {
    #[error("overlay key '{0}' is not read by the application")]
    UnknownKey(String),

    #[error("overlay key '{0}' resolved to an empty value")]
    EmptyValue(String),

    #[error("failed to build application settings: {0}")]
    Build(#[from] config::ConfigError),
}

/// Cleanup failed after the tests ran.
///
/// Logged and recorded, never allowed to replace the result of the tests themselves.
#[derive(Debug, Clone, Error)]
pub enum TeardownError {
    #[error("failed to stop container {id}: {reason}")]
    Container { id: String, reason: String },

    #[error("{host}:{port} still accepts connections after teardown")]
    StillListening { host: String, port: u16 },

    #[error("shared database still has {leases} live lease(s)")]
    InUse { leases: usize },

    #[error("failed to drop isolated database '{database}': {reason}")]
    Isolation { database: String, reason: String },

    #[error("application shutdown failed: {0}")]
    Application(String),
}

/// Umbrella error returned by the harness entry points.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Binding(#[from] ConfigurationBindingError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("lifecycle policy conflict: process already uses {active}, refused {requested}")]
    PolicyConflict {
        active: crate::lifecycle::LifecyclePolicy,
        requested: crate::lifecycle::LifecyclePolicy,
    },

    #[error("invalid harness configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("application failed to initialize: {0:#}")]
    Application(anyhow::Error),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_error_messages() {
        let err = ProvisioningError::NotReady {
            timeout: Duration::from_secs(3),
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "database did not accept connections within 3s: connection refused"
        );

        let err = ProvisioningError::InvalidImage("".to_string());
        assert_eq!(err.to_string(), "invalid image reference ''");
    }

    #[test]
    fn test_harness_error_is_transparent() {
        let err: HarnessError = ProvisioningError::NotStarted.into();
        assert_eq!(err.to_string(), "database instance has not been started");
        assert!(matches!(
            err,
            HarnessError::Provisioning(ProvisioningError::NotStarted)
        ));
    }
}
