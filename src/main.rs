mod auth;
mod config;
mod git;
mod health;
mod http;
mod metrics;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::directory::FileDirectory;
use crate::auth::{IdentityResolver, PermissionResolver, RoleSource};
use crate::config::Config;
use crate::git::{ProcessRunner, Signature, TokioRunner};
use crate::metrics::MetricsRegistry;
use crate::store::catalog::{FsCatalog, RepositoryCatalog};
use crate::store::RepoStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "githost", about = "Git smart-HTTP hosting gateway")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<RepoStore>,
    /// Session to identity lookup, consulted on every request.
    pub identities: Arc<dyn IdentityResolver>,
    pub resolver: Arc<PermissionResolver>,
    pub catalog: Arc<dyn RepositoryCatalog>,
    pub runner: Arc<dyn ProcessRunner>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        runner: Arc<dyn ProcessRunner>,
        identities: Arc<dyn IdentityResolver>,
        roles: Arc<dyn RoleSource>,
    ) -> Self {
        let signature = Signature {
            name: config.git.user_name.clone(),
            email: config.git.user_email.clone(),
        };
        let store = RepoStore::new(
            config.storage.repositories_path.clone(),
            Arc::clone(&runner),
            signature,
        );
        let resolver = PermissionResolver::new(
            roles,
            config.access.owner_role.clone(),
            config.access.guest_role.clone(),
        );
        let catalog = FsCatalog::new(config.storage.catalog_path.clone());

        Self {
            store: Arc::new(store),
            identities,
            resolver: Arc::new(resolver),
            catalog: Arc::new(catalog),
            runner,
            metrics: MetricsRegistry::new(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(cli.config.as_deref())?);
    tracing::info!(
        config_path = ?cli.config,
        repositories = %config.storage.repositories_path.display(),
        projects = %config.storage.projects_path.display(),
        "starting githost"
    );

    // ---- Ensure storage roots exist ----
    for dir in [
        &config.storage.repositories_path,
        &config.storage.catalog_path,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    // ---- Git ----
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioRunner::new(config.git.binary.clone()));
    match git::commands::version(runner.as_ref()).await {
        Ok(version) => tracing::info!(%version, "git toolchain found"),
        Err(e) => tracing::warn!(error = %e, "git toolchain not usable; protocol requests will fail"),
    }

    // ---- Identity directory ----
    let directory = Arc::new(FileDirectory::new(config.access.directory_path.clone()));
    tracing::info!(
        path = %config.access.directory_path.display(),
        authorize_reads = config.access.authorize_reads,
        "identity directory configured"
    );

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config), runner, directory.clone(), directory);

    run_http_server(state).await?;

    tracing::info!("githost shut down cleanly");
    Ok(())
}
