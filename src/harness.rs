//! Test-class orchestration.
//!
//! A [`TestEnvironment`] is one test class's view of the world: a ready database, the
//! overlay resolved from it, the settings built with that overlay, and the application
//! initialized from those settings, in exactly that order.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::app::{AppContext, Application};
use crate::config::{load_config, HarnessConfig, DEFAULT_HARNESS_CONFIG};
use crate::endpoint::{Endpoint, EndpointSource};
use crate::error::{HarnessError, ProvisioningError, Result, TeardownError};
use crate::lifecycle::{enforce_policy, Lease, LifecyclePolicy, SharedDatabase, PROCESS_DATABASE};
use crate::overlay::{ConfigOverlay, ResolvedOverlay};
use crate::provisioner::Provisioner;
use crate::runtime::{ContainerRuntime, Testcontainers};
use crate::settings::Settings;

/// Whether each environment gets its own database on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// `CREATE DATABASE harness_<uuid>` per environment, dropped at teardown.
    Database,
    /// Use the instance database directly.
    None,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Database => write!(f, "database"),
            Isolation::None => write!(f, "none"),
        }
    }
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" => Ok(Isolation::Database),
            "none" => Ok(Isolation::None),
            other => Err(format!("unknown isolation mode '{other}'")),
        }
    }
}

static TEARDOWN_FAILURES: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn record_failure(class: &str, error: &TeardownError) {
    log::error!("Teardown of {class} failed: {error}");
    let mut failures = TEARDOWN_FAILURES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    failures.push(format!("{class}: {error}"));
}

/// Teardown failures recorded so far in this process.
pub fn teardown_failures() -> Vec<String> {
    TEARDOWN_FAILURES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// False once any teardown failed. Test results are unaffected, the run is not.
pub fn is_healthy() -> bool {
    teardown_failures().is_empty()
}

enum Backing<R: ContainerRuntime> {
    Owned(Arc<Provisioner<R>>),
    Shared(Lease),
}

/// A per-environment database on a shared server.
struct IsolatedDatabase {
    server: Arc<dyn EndpointSource>,
    name: String,
}

impl IsolatedDatabase {
    async fn create(server: Arc<dyn EndpointSource>) -> std::result::Result<Self, ProvisioningError> {
        let name = format!("harness_{}", Uuid::new_v4().simple());
        let admin = server.current_endpoint()?;

        log::info!(
            "Creating isolated database {name} on port {}",
            admin.port
        );
        execute_admin(&admin, &format!("CREATE DATABASE {name}"))
            .await
            .map_err(|reason| ProvisioningError::Isolation {
                database: name.clone(),
                reason,
            })?;

        Ok(Self { server, name })
    }

    async fn drop_database(&self) -> std::result::Result<(), TeardownError> {
        let failed = |reason: String| TeardownError::Isolation {
            database: self.name.clone(),
            reason,
        };
        let admin = self
            .server
            .current_endpoint()
            .map_err(|e| failed(e.to_string()))?;

        log::info!("Dropping isolated database {}", self.name);
        execute_admin(
            &admin,
            &format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}'",
                self.name
            ),
        )
        .await
        .map_err(failed)?;
        execute_admin(&admin, &format!("DROP DATABASE IF EXISTS {}", self.name))
            .await
            .map_err(failed)
    }
}

impl EndpointSource for IsolatedDatabase {
    fn current_endpoint(&self) -> std::result::Result<Endpoint, ProvisioningError> {
        Ok(self.server.current_endpoint()?.with_database(&self.name))
    }
}

async fn execute_admin(admin: &Endpoint, statement: &str) -> std::result::Result<(), String> {
    let (client, connection) = admin
        .pg_config()
        .connect(NoTls)
        .await
        .map_err(|e| e.to_string())?;
    let connection_task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("Postgres admin connection closed: {e}");
        }
    });

    let result = client
        .batch_execute(statement)
        .await
        .map_err(|e| e.to_string());

    drop(client);
    if let Err(e) = connection_task.await {
        log::debug!("Postgres admin connection join error: {e}");
    }
    result
}

/// Everything one test class runs against.
pub struct TestEnvironment<A: Application = AppContext, R: ContainerRuntime = Testcontainers> {
    name: String,
    app: Option<A>,
    settings: Settings,
    overlay: ResolvedOverlay,
    source: Arc<dyn EndpointSource>,
    isolated: Option<Arc<IsolatedDatabase>>,
    backing: Option<Backing<R>>,
}

impl<A: Application, R: ContainerRuntime> TestEnvironment<A, R> {
    /// Starts a database owned by this environment alone.
    ///
    /// `overlay` may carry extra registrations; the datasource keys and `server.port` are
    /// added on top of it.
    pub async fn per_class(
        name: &str,
        runtime: R,
        config: HarnessConfig,
        overlay: ConfigOverlay,
    ) -> Result<Self> {
        enforce_policy(LifecyclePolicy::PerClass)?;

        let provisioner = Arc::new(Provisioner::new(runtime, config.clone()));
        provisioner.start().await?;

        let source: Arc<dyn EndpointSource> = provisioner.clone();
        Self::assemble(name, Backing::Owned(provisioner), source, &config, overlay).await
    }

    /// Joins the process-wide database.
    pub async fn shared(
        name: &str,
        database: &SharedDatabase<R>,
        overlay: ConfigOverlay,
    ) -> Result<Self> {
        let lease = database.acquire().await?;
        let source = lease.source();
        Self::assemble(
            name,
            Backing::Shared(lease),
            source,
            database.config(),
            overlay,
        )
        .await
    }

    async fn assemble(
        name: &str,
        backing: Backing<R>,
        server: Arc<dyn EndpointSource>,
        config: &HarnessConfig,
        overlay: ConfigOverlay,
    ) -> Result<Self> {
        let mut env = Self {
            name: name.to_string(),
            app: None,
            settings: Settings::default(),
            overlay: ResolvedOverlay::default(),
            source: server.clone(),
            isolated: None,
            backing: Some(backing),
        };

        match env.initialize(server, config, overlay).await {
            Ok(()) => Ok(env),
            Err(e) => {
                log::error!("Environment {name} failed to initialize: {e}");
                env.teardown().await;
                Err(e)
            }
        }
    }

    async fn initialize(
        &mut self,
        server: Arc<dyn EndpointSource>,
        config: &HarnessConfig,
        mut overlay: ConfigOverlay,
    ) -> Result<()> {
        if config.isolation == Isolation::Database {
            let isolated = Arc::new(IsolatedDatabase::create(server).await?);
            self.source = isolated.clone();
            self.isolated = Some(isolated);
        }

        overlay
            .register_datasource(self.source.clone())
            .register("server.port", || Ok("0".to_string()));
        overlay.verify(&A::readable_keys())?;

        // Resolve only now: the database is ready and nothing has read settings yet.
        self.overlay = overlay.resolve()?;
        let settings_path = config.settings_path.as_deref().map(Path::new);
        self.settings = Settings::load(settings_path, &self.overlay)?;
        log::info!(
            "Environment {} initializing application with {:?}",
            self.name,
            self.overlay
        );

        let app = A::initialize(self.settings.clone())
            .await
            .map_err(HarnessError::Application)?;
        self.app = Some(app);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The initialized application.
    pub fn app(&self) -> &A {
        match &self.app {
            Some(app) => app,
            // Construction only hands out environments whose app is initialized.
            None => unreachable!("environment {} has no application", self.name),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn overlay(&self) -> &ResolvedOverlay {
        &self.overlay
    }

    /// Endpoint of this environment's database, read from the live instance.
    pub fn endpoint(&self) -> std::result::Result<Endpoint, ProvisioningError> {
        self.source.current_endpoint()
    }

    /// Tears down in reverse order of construction: application, isolated database,
    /// then the instance itself (per-class) or the lease (process-wide).
    ///
    /// Every step runs even if an earlier one fails. All failures are recorded; the
    /// first is returned.
    pub async fn shutdown(mut self) -> std::result::Result<(), TeardownError> {
        match self.teardown().await.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    async fn teardown(&mut self) -> Vec<TeardownError> {
        let mut failures = Vec::new();

        if let Some(app) = self.app.take() {
            if let Err(e) = app.shutdown().await {
                failures.push(TeardownError::Application(format!("{e:#}")));
            }
        }

        if let Some(isolated) = self.isolated.take() {
            if let Err(e) = isolated.drop_database().await {
                failures.push(e);
            }
        }

        match self.backing.take() {
            Some(Backing::Owned(provisioner)) => {
                if let Err(e) = provisioner.stop().await {
                    failures.push(e);
                }
            }
            Some(Backing::Shared(lease)) => lease.release(),
            None => {}
        }

        for failure in &failures {
            record_failure(&self.name, failure);
        }
        failures
    }
}

impl<A: Application, R: ContainerRuntime> Drop for TestEnvironment<A, R> {
    fn drop(&mut self) {
        if self.backing.is_some() {
            // Fields drop next: the app, the container handle and the lease all release
            // themselves. An isolated database is left for the instance to take with it.
            log::warn!(
                "Environment {} dropped without shutdown, releasing resources",
                self.name
            );
        }
    }
}

/// Runs one test class against a database of its own.
///
/// The body never runs if provisioning or application startup fails. Teardown always
/// runs, also when the body panics; its failures are recorded but never replace the
/// body's outcome.
pub async fn run_class<A, R, T, F>(
    name: &str,
    runtime: R,
    config: HarnessConfig,
    body: F,
) -> Result<T>
where
    A: Application,
    R: ContainerRuntime,
    F: for<'a> FnOnce(&'a TestEnvironment<A, R>) -> BoxFuture<'a, T>,
{
    let env = TestEnvironment::per_class(name, runtime, config, ConfigOverlay::new()).await?;
    run_body(env, body).await
}

/// Runs one test class against the process-wide database.
pub async fn run_shared_class<A, R, T, F>(
    name: &str,
    database: &SharedDatabase<R>,
    body: F,
) -> Result<T>
where
    A: Application,
    R: ContainerRuntime,
    F: for<'a> FnOnce(&'a TestEnvironment<A, R>) -> BoxFuture<'a, T>,
{
    let env = TestEnvironment::shared(name, database, ConfigOverlay::new()).await?;
    run_body(env, body).await
}

/// Runs one test class under the policy chosen in the harness configuration file.
///
/// Reads `config/harness.toml` (if present) and the `DBHARNESS_*` environment, so a whole
/// suite switches between per-class and process-wide instances without code changes.
pub async fn run_test_class<A, T, F>(name: &str, body: F) -> Result<T>
where
    A: Application,
    F: for<'a> FnOnce(&'a TestEnvironment<A, Testcontainers>) -> BoxFuture<'a, T>,
{
    let config =
        load_config(Some(Path::new(DEFAULT_HARNESS_CONFIG))).map_err(HarnessError::Config)?;
    run_test_class_with(name, config, Testcontainers, &PROCESS_DATABASE, body).await
}

/// Runs one test class under `config.lifecycle`.
///
/// Per-class runs start an instance on `runtime` for this class alone. Process-wide runs
/// join the instance held in `shared`, which is created from `runtime` and `config` on
/// first use; later calls ignore both.
pub async fn run_test_class_with<A, R, T, F>(
    name: &str,
    config: HarnessConfig,
    runtime: R,
    shared: &OnceLock<SharedDatabase<R>>,
    body: F,
) -> Result<T>
where
    A: Application,
    R: ContainerRuntime,
    F: for<'a> FnOnce(&'a TestEnvironment<A, R>) -> BoxFuture<'a, T>,
{
    match config.lifecycle {
        LifecyclePolicy::PerClass => run_class(name, runtime, config, body).await,
        LifecyclePolicy::ProcessWide => {
            let database = shared.get_or_init(|| SharedDatabase::new(runtime, config));
            run_shared_class(name, database, body).await
        }
    }
}

async fn run_body<A, R, T, F>(env: TestEnvironment<A, R>, body: F) -> Result<T>
where
    A: Application,
    R: ContainerRuntime,
    F: for<'a> FnOnce(&'a TestEnvironment<A, R>) -> BoxFuture<'a, T>,
{
    let name = env.name.clone();
    log::info!("Running test class {name}");
    let outcome = AssertUnwindSafe(body(&env)).catch_unwind().await;

    if let Err(e) = env.shutdown().await {
        log::error!("Test class {name} finished but teardown failed: {e}");
    }

    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
