//! Lifecycle policies for the ephemeral database.
//!
//! A process uses exactly one policy. The first harness entry point records it and any
//! later request for the other policy fails with [`HarnessError::PolicyConflict`].
//!
//! Under [`LifecyclePolicy::ProcessWide`] the instance belongs to a [`SharedDatabase`].
//! Every `#[tokio::test]` runs on its own runtime and that runtime goes away when the test
//! returns, taking any task it owns with it. A container started on one test's runtime
//! can therefore not be handed to the next test. `SharedDatabase` keeps a dedicated
//! runtime of its own, and start/stop always run there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

use crate::config::HarnessConfig;
use crate::endpoint::{Endpoint, EndpointSource};
use crate::error::{HarnessError, ProvisioningError, TeardownError};
use crate::provisioner::Provisioner;
use crate::runtime::{ContainerRuntime, Testcontainers};

const SHARED_RUNTIME_THREADS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePolicy {
    /// One instance per test class, started before its body and stopped after it.
    PerClass,
    /// One instance for the whole process, stopped explicitly or at process exit.
    ProcessWide,
}

impl fmt::Display for LifecyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePolicy::PerClass => write!(f, "per-class"),
            LifecyclePolicy::ProcessWide => write!(f, "process-wide"),
        }
    }
}

impl FromStr for LifecyclePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-class" | "per_class" | "class" => Ok(LifecyclePolicy::PerClass),
            "process-wide" | "process_wide" | "process" => Ok(LifecyclePolicy::ProcessWide),
            other => Err(format!("unknown lifecycle policy '{other}'")),
        }
    }
}

static ACTIVE_POLICY: OnceLock<LifecyclePolicy> = OnceLock::new();

/// Records `policy` as the process policy, or fails if the other one is already in use.
pub fn enforce_policy(policy: LifecyclePolicy) -> Result<(), HarnessError> {
    let active = *ACTIVE_POLICY.get_or_init(|| {
        log::info!("Database lifecycle policy for this process: {policy}");
        policy
    });
    check_policy(active, policy)
}

pub fn active_policy() -> Option<LifecyclePolicy> {
    ACTIVE_POLICY.get().copied()
}

fn check_policy(active: LifecyclePolicy, requested: LifecyclePolicy) -> Result<(), HarnessError> {
    if active == requested {
        Ok(())
    } else {
        Err(HarnessError::PolicyConflict { active, requested })
    }
}

enum Status {
    Idle,
    Running,
    Failed(ProvisioningError),
    ShutDown,
}

/// One database instance shared by every test class in the process.
///
/// The first [`acquire`](Self::acquire) starts the instance; concurrent first callers
/// wait on the same start and exactly one container is launched. A failed start is
/// remembered and returned to every later caller.
pub struct SharedDatabase<R: ContainerRuntime> {
    provisioner: Arc<Provisioner<R>>,
    status: Mutex<Status>,
    leases: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    starts: AtomicUsize,
    executor: OnceLock<Result<Runtime, String>>,
}

impl<R: ContainerRuntime> SharedDatabase<R> {
    pub fn new(runtime: R, config: HarnessConfig) -> Self {
        Self {
            provisioner: Arc::new(Provisioner::new(runtime, config)),
            status: Mutex::new(Status::Idle),
            leases: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            executor: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        self.provisioner.config()
    }

    /// Returns a lease on the running instance, starting it first if needed.
    pub async fn acquire(&self) -> Result<Lease, HarnessError> {
        enforce_policy(LifecyclePolicy::ProcessWide)?;

        // Fast path. The lease is counted before the flag is read and shutdown() sets the
        // flag before reading the count, so one of the two always sees the other.
        let lease = self.lease();
        if !self.shutting_down.load(Ordering::SeqCst) && self.provisioner.is_running() {
            return Ok(lease);
        }
        drop(lease);

        let mut status = self.status.lock().await;
        match &*status {
            Status::Running => return Ok(self.lease()),
            Status::Failed(e) => {
                return Err(ProvisioningError::PreviouslyFailed(e.to_string()).into())
            }
            Status::ShutDown => return Err(ProvisioningError::Stopped.into()),
            Status::Idle => {}
        }

        let provisioner = self.provisioner.clone();
        let started = self
            .executor()?
            .spawn(async move { provisioner.start().await })
            .await
            .map_err(|e| ProvisioningError::RuntimeUnavailable(format!("start task failed: {e}")))?;
        self.starts.fetch_add(1, Ordering::SeqCst);

        match started {
            Ok(endpoint) => {
                log::info!(
                    "Shared database started at {}:{}",
                    endpoint.host,
                    endpoint.port
                );
                *status = Status::Running;
                Ok(self.lease())
            }
            Err(e) => {
                log::error!("Shared database failed to start: {e}");
                *status = Status::Failed(e.clone());
                Err(e.into())
            }
        }
    }

    /// Starts the instance ahead of the first test class.
    pub async fn warm_up(&self) -> Result<Endpoint, HarnessError> {
        let lease = self.acquire().await?;
        Ok(lease.endpoint()?)
    }

    pub fn endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        self.provisioner.endpoint()
    }

    pub fn live_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    /// Number of real starts performed. At most one.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.provisioner.is_running()
    }

    /// Stops the instance. Refused while leases are outstanding.
    pub async fn shutdown(&self) -> Result<(), TeardownError> {
        let mut status = self.status.lock().await;
        self.shutting_down.store(true, Ordering::SeqCst);
        let leases = self.live_leases();
        if leases > 0 {
            self.shutting_down.store(false, Ordering::SeqCst);
            return Err(TeardownError::InUse { leases });
        }

        let was_running = matches!(*status, Status::Running);
        *status = Status::ShutDown;
        if !was_running {
            return Ok(());
        }

        let provisioner = self.provisioner.clone();
        let executor = self.executor().map_err(|e| TeardownError::Container {
            id: self.provisioner.container_id().unwrap_or_default(),
            reason: e.to_string(),
        })?;
        executor
            .spawn(async move { provisioner.stop().await })
            .await
            .map_err(|e| TeardownError::Container {
                id: String::new(),
                reason: format!("stop task failed: {e}"),
            })?
    }

    /// Stops the instance regardless of leases. Meant for process-exit hooks, which run
    /// outside any async context.
    pub fn shutdown_at_exit(&self) {
        if !self.provisioner.is_running() {
            return;
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut status) = self.status.try_lock() {
            *status = Status::ShutDown;
        }

        let leases = self.live_leases();
        if leases > 0 {
            log::warn!("Stopping shared database at exit with {leases} live lease(s)");
        }

        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(e) => {
                log::error!("Cannot stop shared database at exit: {e}");
                return;
            }
        };
        let provisioner = self.provisioner.clone();
        if let Err(e) = executor.block_on(async move { provisioner.stop().await }) {
            log::error!("Failed to stop shared database at exit: {e}");
        }
    }

    fn lease(&self) -> Lease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        Lease {
            source: self.provisioner.clone(),
            leases: self.leases.clone(),
        }
    }

    fn executor(&self) -> Result<&Runtime, ProvisioningError> {
        self.executor
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(SHARED_RUNTIME_THREADS)
                    .thread_name("dbharness-shared")
                    .enable_all()
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| ProvisioningError::RuntimeUnavailable(e.clone()))
    }
}

impl<R: ContainerRuntime> Drop for SharedDatabase<R> {
    fn drop(&mut self) {
        // A runtime may not be dropped from inside another runtime.
        if let Some(Ok(executor)) = self.executor.take() {
            executor.shutdown_background();
        }
    }
}

/// One counted user of a [`SharedDatabase`]. Dropping the lease releases it.
pub struct Lease {
    source: Arc<dyn EndpointSource>,
    leases: Arc<AtomicUsize>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl Lease {
    pub fn endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        self.source.current_endpoint()
    }

    pub fn source(&self) -> Arc<dyn EndpointSource> {
        self.source.clone()
    }

    pub fn release(self) {}
}

impl EndpointSource for Lease {
    fn current_endpoint(&self) -> Result<Endpoint, ProvisioningError> {
        self.endpoint()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let remaining = self.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("Shared database lease released, {remaining} remaining");
    }
}

pub(crate) static PROCESS_DATABASE: OnceLock<SharedDatabase<Testcontainers>> = OnceLock::new();

/// The process-wide testcontainers database, created from `config` on first use.
///
/// Later calls return the same instance and ignore their `config`. The instance is
/// stopped by an exit hook when the process ends.
pub fn process_database(config: &HarnessConfig) -> &'static SharedDatabase<Testcontainers> {
    PROCESS_DATABASE.get_or_init(|| SharedDatabase::new(Testcontainers, config.clone()))
}

#[ctor::dtor]
fn stop_process_database() {
    if let Some(database) = PROCESS_DATABASE.get() {
        database.shutdown_at_exit();
    }
}
