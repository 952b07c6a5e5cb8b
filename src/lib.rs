//! Ephemeral PostgreSQL databases for integration tests.
//!
//! A test class gets a database started in a container, its connection parameters
//! injected into the application's configuration as overrides, and an application
//! context booted on a random port from that configuration. One lifecycle policy,
//! per-class or process-wide, applies to the whole test process. [`run_test_class`]
//! picks it from `config/harness.toml` or `DBHARNESS_LIFECYCLE`.
//!
//! ```ignore
//! use dbharness::{run_class, AppContext, HarnessConfig, Testcontainers};
//!
//! #[tokio::test]
//! async fn repository_roundtrip() {
//!     run_class::<AppContext, _, _, _>("repository", Testcontainers, HarnessConfig::default(), |env| {
//!         Box::pin(async move {
//!             let client = env.app().pool.get().await.unwrap();
//!             client.simple_query("SELECT 1").await.unwrap();
//!         })
//!     })
//!     .await
//!     .unwrap();
//! }
//! ```

pub mod app;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod harness;
pub mod lifecycle;
pub mod overlay;
pub mod provisioner;
pub mod runtime;
pub mod settings;

// Re-export commonly used items
pub use app::{AppContext, Application};
pub use config::{load_config, HarnessConfig};
pub use endpoint::{Endpoint, EndpointSource};
pub use error::{ConfigurationBindingError, HarnessError, ProvisioningError, TeardownError};
pub use harness::{
    is_healthy, run_class, run_shared_class, run_test_class, run_test_class_with,
    teardown_failures, Isolation, TestEnvironment,
};
pub use lifecycle::{process_database, Lease, LifecyclePolicy, SharedDatabase};
pub use overlay::{ConfigOverlay, ResolvedOverlay};
pub use provisioner::{Provisioner, Readiness};
pub use runtime::{ContainerRuntime, ImageSpec, RunningContainer, Testcontainers};
pub use settings::Settings;
