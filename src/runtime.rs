//! The container runtime boundary.
//!
//! The harness only needs "start image X, expose port Y, tell me where it landed, stop
//! it". Everything else about the container engine stays behind [`ContainerRuntime`].

use std::future::Future;
use std::time::Duration;

use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use crate::config::HarnessConfig;
use crate::error::{ProvisioningError, TeardownError};

pub const POSTGRES_PORT: u16 = 5432;
const POSTGRES_READY_MESSAGE: &str = "database system is ready to accept connections";
const DEFAULT_TAG: &str = "latest";

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub tag: String,
    pub exposed_port: u16,
    pub env: Vec<(String, String)>,
    pub ready_message: Option<String>,
    pub startup_timeout: Duration,
}

impl ImageSpec {
    /// Parses `name[:tag]`, accepting a registry host with a port (`host:5000/name:tag`).
    ///
    /// Digest references (`name@sha256:...`) are rejected; images are launched by tag.
    pub fn parse(reference: &str) -> Result<Self, ProvisioningError> {
        let invalid = || ProvisioningError::InvalidImage(reference.to_string());

        let reference = reference.trim();
        if reference.is_empty()
            || reference
                .chars()
                .any(|c| c.is_whitespace() || c.is_ascii_uppercase() || c == '@')
        {
            return Err(invalid());
        }

        let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if name.is_empty() || tag.is_empty() || name.ends_with('/') {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
            exposed_port: POSTGRES_PORT,
            env: Vec::new(),
            ready_message: None,
            startup_timeout: Duration::from_secs(60),
        })
    }

    /// A PostgreSQL image configured with the harness credentials.
    pub fn postgres(config: &HarnessConfig) -> Result<Self, ProvisioningError> {
        let mut spec = Self::parse(&config.image)?;
        spec.env = vec![
            ("POSTGRES_USER".to_string(), config.username.clone()),
            ("POSTGRES_PASSWORD".to_string(), config.password.clone()),
            ("POSTGRES_DB".to_string(), config.database.clone()),
        ];
        spec.ready_message = Some(POSTGRES_READY_MESSAGE.to_string());
        spec.startup_timeout = config.startup_timeout();
        Ok(spec)
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// A container that has been launched and not yet stopped.
pub trait RunningContainer: Send + Sync + 'static {
    fn id(&self) -> String;

    fn host(&self) -> impl Future<Output = Result<String, ProvisioningError>> + Send;

    fn mapped_port(
        &self,
        internal: u16,
    ) -> impl Future<Output = Result<u16, ProvisioningError>> + Send;

    /// Stops and removes the container.
    fn stop(self) -> impl Future<Output = Result<(), TeardownError>> + Send;
}

/// Launches containers.
pub trait ContainerRuntime: Send + Sync + 'static {
    type Container: RunningContainer;

    fn launch(
        &self,
        image: &ImageSpec,
    ) -> impl Future<Output = Result<Self::Container, ProvisioningError>> + Send;
}

/// Docker (or any engine testcontainers can reach) via the `testcontainers` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Testcontainers;

impl ContainerRuntime for Testcontainers {
    type Container = ContainerAsync<GenericImage>;

    fn launch(
        &self,
        image: &ImageSpec,
    ) -> impl Future<Output = Result<Self::Container, ProvisioningError>> + Send {
        let image = image.clone();
        async move {
            let mut generic = GenericImage::new(image.name.clone(), image.tag.clone());
            if let Some(message) = &image.ready_message {
                generic = generic.with_wait_for(WaitFor::message_on_stderr(message.clone()));
            }

            let mut request = generic
                .with_exposed_port(image.exposed_port.tcp())
                .with_startup_timeout(image.startup_timeout);
            for (key, value) in &image.env {
                request = request.with_env_var(key.clone(), value.clone());
            }

            log::info!("Launching container from {}", image.reference());
            request.start().await.map_err(|e| {
                ProvisioningError::RuntimeUnavailable(format!(
                    "failed to start {}: {e}",
                    image.reference()
                ))
            })
        }
    }
}

impl RunningContainer for ContainerAsync<GenericImage> {
    fn id(&self) -> String {
        ContainerAsync::id(self).to_string()
    }

    async fn host(&self) -> Result<String, ProvisioningError> {
        self.get_host()
            .await
            .map(|host| host.to_string())
            .map_err(|e| ProvisioningError::EndpointUnavailable(e.to_string()))
    }

    async fn mapped_port(&self, internal: u16) -> Result<u16, ProvisioningError> {
        self.get_host_port_ipv4(internal)
            .await
            .map_err(|e| ProvisioningError::EndpointUnavailable(e.to_string()))
    }

    async fn stop(self) -> Result<(), TeardownError> {
        let id = ContainerAsync::id(&self).to_string();
        ContainerAsync::stop(&self)
            .await
            .map_err(|e| TeardownError::Container {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        // Dropping the handle removes the stopped container.
        drop(self);
        log::info!("Container {id} stopped and removed");
        Ok(())
    }
}
