//! Anvil server: owns the database, the workflow state machine, the
//! timeout sweep and the HTTP API. The binary crate parses the CLI and
//! calls [`run`].

pub mod api;
pub mod db;
pub mod engine;
pub mod sweep;

use anyhow::Context;
use axum::Router;
use db::Db;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How the binary distinguishes startup failures (exit code 1) from
/// unrecoverable runtime errors (exit code 2).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("startup failed: {0:#}")]
    Startup(anyhow::Error),
    #[error("runtime failure: {0:#}")]
    Runtime(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub database_path: String,
    /// Apply pending migrations on startup; when disabled the server
    /// refuses to serve with required migrations outstanding.
    pub auto_migrate: bool,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 42113).into(),
            database_path: "anvil.db".to_string(),
            auto_migrate: true,
            sweep_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
}

/// Build the application router; shared by [`run`] and tests.
pub fn app(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .nest("/api", api::api_router())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let db = Db::open(&config.database_path)
        .await
        .map_err(|e| ServerError::Startup(anyhow::Error::new(e).context("opening database")))?;

    // Pending migrations either run now or block startup entirely;
    // serving against a half-migrated schema is never an option.
    let required = db
        .required_migrations()
        .await
        .map_err(|e| ServerError::Startup(e.into()))?;
    if !required.is_empty() {
        if config.auto_migrate {
            let applied = db
                .migrate()
                .await
                .map_err(|e| ServerError::Startup(anyhow::Error::new(e).context("migrating")))?;
            info!("applied {} pending migration(s)", applied);
        } else {
            return Err(ServerError::Startup(anyhow::anyhow!(
                "{} required migration(s) pending and auto-apply is disabled: {}",
                required.len(),
                required.join(", ")
            )));
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let sweep_handle = sweep::start(db.clone(), config.sweep_interval, shutdown_rx);

    let state = AppState { db };
    let app = app(state, config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))
        .map_err(ServerError::Startup)?;
    info!(
        "anvil server listening on http://{}",
        listener
            .local_addr()
            .context("reading local address")
            .map_err(ServerError::Startup)?
    );

    let shutdown = shutdown_signal(shutdown_tx);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving")
        .map_err(ServerError::Runtime)?;

    let _ = sweep_handle.await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve when ctrl-c or SIGTERM arrives, fanning the signal out to the
/// background tasks first.
async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
            info!("received SIGTERM");
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let _ = shutdown_tx.send(());
}
