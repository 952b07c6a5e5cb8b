use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;

use crate::settings::{Datasource, Settings};

/// The system under test, as far as the harness is concerned.
///
/// `initialize` receives settings that already carry the overlay; it is never called
/// before the database is ready.
pub trait Application: Send + Sized + 'static {
    fn initialize(settings: Settings) -> impl Future<Output = Result<Self>> + Send;

    fn shutdown(self) -> impl Future<Output = Result<()>> + Send;

    /// Configuration keys read during `initialize`.
    fn readable_keys() -> BTreeSet<String> {
        Settings::readable_keys()
    }
}

/// Create a database pool for the configured datasource.
pub fn create_pool(datasource: &Datasource) -> Result<Pool> {
    let mut pg_config: tokio_postgres::Config = datasource
        .url
        .parse()
        .with_context(|| format!("Invalid datasource url: {}", datasource.url))?;
    pg_config
        .user(datasource.username.as_str())
        .password(datasource.password.as_str());

    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(datasource.pool_size)
        .build()
        .context("Failed to build connection pool")?;
    Ok(pool)
}

/// A booted application: connection pool plus an HTTP health listener.
pub struct AppContext {
    pub settings: Settings,
    pub pool: Pool,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_handle: Option<JoinHandle<()>>,
}

impl AppContext {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    async fn start(settings: Settings) -> Result<Self> {
        let pool = create_pool(&settings.datasource)?;

        // Fail here rather than on the first request if the datasource is wrong
        let client = pool
            .get()
            .await
            .with_context(|| format!("Failed to connect to {}", settings.datasource.url))?;
        client
            .simple_query("SELECT 1")
            .await
            .context("Datasource connectivity check failed")?;
        drop(client);

        let listener = TcpListener::bind(("127.0.0.1", settings.server.port))
            .await
            .with_context(|| format!("Failed to bind port {}", settings.server.port))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = spawn_server(listener, router(pool.clone()), shutdown_rx);
        log::info!("Application context listening on {local_addr}");

        Ok(Self {
            settings,
            pool,
            local_addr,
            shutdown_tx,
            server_handle: Some(server_handle),
        })
    }

    async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.server_handle.take() {
            handle.await.context("Application server task failed")?;
        }
        self.pool.close();
        log::info!("Application context on {} stopped", self.local_addr);
        Ok(())
    }
}

impl Application for AppContext {
    fn initialize(settings: Settings) -> impl Future<Output = Result<Self>> + Send {
        AppContext::start(settings)
    }

    fn shutdown(self) -> impl Future<Output = Result<()>> + Send {
        self.stop()
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if self.server_handle.is_some() {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

/// Routes served by the application context.
pub fn router(pool: Pool) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(pool)
}

async fn health_handler(State(pool): State<Pool>) -> (StatusCode, &'static str) {
    let healthy = match pool.get().await {
        Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
        Err(e) => {
            log::debug!("Health check could not get a connection: {e}");
            false
        }
    };

    if healthy {
        (StatusCode::OK, "UP")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN")
    }
}

/// Serves `app` until `shutdown_rx` flips, then drains in-flight requests.
fn spawn_server(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(e) = server.await {
            log::error!("Application server failed: {e}");
        }
    })
}
