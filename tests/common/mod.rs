//! Fakes shared by the integration tests.
//!
//! `FakeRuntime` stands in for the container engine: a "container" is a TCP listener on
//! an ephemeral local port, so readiness, endpoints and teardown can be observed without
//! Docker.

#![allow(dead_code)] // Each test binary uses a different subset

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbharness::{
    Application, ContainerRuntime, HarnessConfig, ImageSpec, Isolation, ProvisioningError,
    Readiness, RunningContainer, Settings, TeardownError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FakeMode {
    /// Listens until stopped. Connections are accepted but never answered.
    #[default]
    Ready,
    /// Launches, but nothing ever listens on the mapped port.
    NeverReady,
    /// The engine cannot be reached.
    Unavailable,
    /// Reports a successful stop but keeps listening.
    LeakOnStop,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    pub mode: FakeMode,
    pub launch_delay: Duration,
    pub stop_delay: Duration,
    launches: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    leaked: Arc<Mutex<Vec<TcpListener>>>,
}

impl FakeRuntime {
    pub fn new(mode: FakeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Containers launched so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Containers launched and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl ContainerRuntime for FakeRuntime {
    type Container = FakeContainer;

    async fn launch(&self, image: &ImageSpec) -> Result<FakeContainer, ProvisioningError> {
        let number = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.launch_delay).await;

        if self.mode == FakeMode::Unavailable {
            return Err(ProvisioningError::RuntimeUnavailable(format!(
                "fake engine refused {}",
                image.reference()
            )));
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| ProvisioningError::RuntimeUnavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProvisioningError::RuntimeUnavailable(e.to_string()))?
            .port();
        let listener = match self.mode {
            // Closing the listener leaves a port nobody answers on
            FakeMode::NeverReady => None,
            _ => Some(listener),
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(FakeContainer {
            id: format!("fake-{number}"),
            port,
            listener,
            leak_on_stop: self.mode == FakeMode::LeakOnStop,
            stop_delay: self.stop_delay,
            leaked: self.leaked.clone(),
            live: self.live.clone(),
        })
    }
}

pub struct FakeContainer {
    id: String,
    port: u16,
    listener: Option<TcpListener>,
    leak_on_stop: bool,
    stop_delay: Duration,
    leaked: Arc<Mutex<Vec<TcpListener>>>,
    live: Arc<AtomicUsize>,
}

impl RunningContainer for FakeContainer {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn host(&self) -> Result<String, ProvisioningError> {
        Ok("127.0.0.1".to_string())
    }

    async fn mapped_port(&self, _internal: u16) -> Result<u16, ProvisioningError> {
        Ok(self.port)
    }

    async fn stop(mut self) -> Result<(), TeardownError> {
        tokio::time::sleep(self.stop_delay).await;
        if self.leak_on_stop {
            if let Some(listener) = self.listener.take() {
                self.leaked.lock().unwrap().push(listener);
            }
        }
        Ok(())
    }
}

impl Drop for FakeContainer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Harness configuration suited to the fake runtime.
pub fn fake_config() -> HarnessConfig {
    HarnessConfig {
        readiness: Readiness::Tcp,
        isolation: Isolation::None,
        startup_timeout_secs: 5,
        readiness_interval_ms: 20,
        settings_path: None,
        ..Default::default()
    }
}

pub fn accepts_connections(port: u16) -> bool {
    std::net::TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(200),
    )
    .is_ok()
}

/// Keeps the settings it was initialized with.
pub struct RecordingApp {
    pub settings: Settings,
}

impl Application for RecordingApp {
    async fn initialize(settings: Settings) -> anyhow::Result<Self> {
        Ok(Self { settings })
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads only the datasource URL, so any other override is a binding mistake.
pub struct UrlOnlyApp;

impl Application for UrlOnlyApp {
    async fn initialize(_settings: Settings) -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        Ok(())
    }

    fn readable_keys() -> std::collections::BTreeSet<String> {
        ["datasource.url".to_string()].into_iter().collect()
    }
}

/// Refuses to start.
pub struct BrokenApp;

impl Application for BrokenApp {
    async fn initialize(_settings: Settings) -> anyhow::Result<Self> {
        Err(anyhow::anyhow!("schema migration failed"))
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        Ok(())
    }
}
