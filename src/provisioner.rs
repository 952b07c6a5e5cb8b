use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_postgres::NoTls;

use crate::config::HarnessConfig;
use crate::endpoint::{Endpoint, EndpointSource};
use crate::error::{ProvisioningError, TeardownError};
use crate::runtime::{ContainerRuntime, ImageSpec, RunningContainer};

/// How the provisioner decides an instance is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Connect with the configured credentials and run `SELECT 1`.
    Postgres,
    /// The mapped port accepts a TCP connection.
    Tcp,
}

enum Lifecycle<C> {
    Idle,
    Running(C),
    Stopped,
}

#[derive(Debug, Clone)]
enum Phase {
    NotStarted,
    Ready {
        container_id: String,
        endpoint: Endpoint,
    },
    Stopped,
}

/// Owns one ephemeral database instance from launch to teardown.
pub struct Provisioner<R: ContainerRuntime> {
    runtime: R,
    config: HarnessConfig,
    lifecycle: Mutex<Lifecycle<R::Container>>,
    // Readable without awaiting so configuration resolvers can consult it.
    phase: RwLock<Phase>,
}

impl<R: ContainerRuntime> Provisioner<R> {
    pub fn new(runtime: R, config: HarnessConfig) -> Self {
        Self {
            runtime,
            config,
            lifecycle: Mutex::new(Lifecycle::Idle),
            phase: RwLock::new(Phase::NotStarted),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Launches the container and waits until it accepts connections.
    ///
    /// The launch and the readiness wait share one deadline, `startup_timeout`. A
    /// container that was launched but never became ready is stopped before the error
    /// is returned.
    pub async fn start(&self) -> Result<Endpoint, ProvisioningError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Err(ProvisioningError::AlreadyStarted);
        }

        let image = ImageSpec::postgres(&self.config)?;
        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;

        log::info!(
            "Provisioning {} (startup timeout {timeout:?})",
            image.reference()
        );
        let container = match tokio::time::timeout_at(deadline, self.runtime.launch(&image)).await
        {
            Ok(launched) => launched?,
            Err(_) => {
                return Err(ProvisioningError::NotReady {
                    timeout,
                    last_error: "container launch did not complete".to_string(),
                })
            }
        };

        let container_id = container.id();
        // The probe itself can stall on a port that accepts but never answers.
        let ready =
            match tokio::time::timeout_at(deadline, self.await_ready(&container, deadline, timeout))
                .await
            {
                Ok(ready) => ready,
                Err(_) => Err(ProvisioningError::NotReady {
                    timeout,
                    last_error: "readiness probe did not complete".to_string(),
                }),
            };
        match ready {
            Ok(endpoint) => {
                log::info!(
                    "Database {container_id} ready at {}:{}",
                    endpoint.host,
                    endpoint.port
                );
                self.set_phase(Phase::Ready {
                    container_id,
                    endpoint: endpoint.clone(),
                });
                *lifecycle = Lifecycle::Running(container);
                Ok(endpoint)
            }
            Err(e) => {
                log::error!("Database {container_id} failed to become ready: {e}");
                if let Err(stop_err) = container.stop().await {
                    log::warn!("Failed to stop unready container {container_id}: {stop_err}");
                }
                Err(e)
            }
        }
    }

    async fn await_ready(
        &self,
        container: &R::Container,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Endpoint, ProvisioningError> {
        let host = container.host().await?;
        let port = container.mapped_port(crate::runtime::POSTGRES_PORT).await?;
        let endpoint = Endpoint {
            host,
            port,
            database: self.config.database.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        endpoint.validate()?;

        let interval = self.config.readiness_interval();
        let mut last_error = String::from("no readiness probe completed");
        loop {
            match probe(&endpoint, self.config.readiness, interval).await {
                Ok(()) => return Ok(endpoint),
                Err(e) => {
                    log::debug!("Readiness probe against port {port} failed: {e}");
                    last_error = e;
                }
            }

            if Instant::now() + interval >= deadline {
                return Err(ProvisioningError::NotReady {
                    timeout,
                    last_error,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Connection parameters of the running instance.
    pub fn endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        match &*self.read_phase() {
            Phase::Ready { endpoint, .. } => Ok(endpoint.clone()),
            Phase::NotStarted => Err(ProvisioningError::NotStarted),
            Phase::Stopped => Err(ProvisioningError::Stopped),
        }
    }

    pub fn container_id(&self) -> Option<String> {
        match &*self.read_phase() {
            Phase::Ready { container_id, .. } => Some(container_id.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.read_phase(), Phase::Ready { .. })
    }

    /// Stops the instance and releases the container. A no-op when nothing is running.
    ///
    /// With `verify_teardown` enabled, the old endpoint is probed once more and a
    /// still-listening port is reported as a leak.
    pub async fn stop(&self) -> Result<(), TeardownError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let container = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(container) => container,
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        let endpoint = self.endpoint().ok();
        self.set_phase(Phase::Stopped);

        let id = container.id();
        log::info!("Stopping database {id}");
        container.stop().await?;

        if let (true, Some(endpoint)) = (self.config.verify_teardown, endpoint) {
            if accepts_tcp(&endpoint.host, endpoint.port, self.config.readiness_interval()).await
            {
                return Err(TeardownError::StillListening {
                    host: endpoint.host,
                    port: endpoint.port,
                });
            }
        }
        Ok(())
    }

    fn read_phase(&self) -> std::sync::RwLockReadGuard<'_, Phase> {
        self.phase.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        let mut guard = self
            .phase
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = phase;
    }
}

impl<R: ContainerRuntime> EndpointSource for Provisioner<R> {
    fn current_endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        self.endpoint()
    }
}

impl<R: ContainerRuntime> Drop for Provisioner<R> {
    fn drop(&mut self) {
        // The container handle releases itself when dropped; this only makes it visible.
        if let Some(id) = self.container_id() {
            log::warn!("Provisioner dropped without stop(), releasing container {id}");
        }
    }
}

async fn probe(endpoint: &Endpoint, readiness: Readiness, interval: Duration) -> Result<(), String> {
    match readiness {
        Readiness::Tcp => {
            if accepts_tcp(&endpoint.host, endpoint.port, interval).await {
                Ok(())
            } else {
                Err(format!("{}:{} refused connection", endpoint.host, endpoint.port))
            }
        }
        Readiness::Postgres => {
            let mut config = endpoint.pg_config();
            config.connect_timeout(interval.max(Duration::from_millis(100)));

            let (client, connection) = config.connect(NoTls).await.map_err(|e| e.to_string())?;
            let connection_task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    log::debug!("Readiness probe connection closed: {e}");
                }
            });

            let result = client
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());

            drop(client);
            let _ = connection_task.await;
            result
        }
    }
}

pub(crate) async fn accepts_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
