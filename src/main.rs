//! Sandbox engine server
//!
//! Manages ephemeral container-backed development sandboxes: declarative
//! templates, per-sandbox service provisioning, deferred join sessions,
//! interactive web terminals, and TTL-based reaping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod domain;
mod error;
mod infra;
mod service;

pub use config::Config;
pub use error::{Error, Result};

use infra::docker::DockerManager;
use infra::sqlite::Repository;
use service::catalog::TemplateCatalog;
use service::postgres::PostgresProvider;
use service::provider::ProviderRegistry;
use service::reaper::Reaper;
use service::redis::RedisProvider;
use service::sandbox::SandboxService;
use service::session::SessionService;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<Repository>,
    pub manager: Arc<SandboxService>,
    pub sessions: Arc<SessionService>,
    pub catalog: Arc<TemplateCatalog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::load()?);

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!(
        host = config.server_host,
        port = config.server_port,
        "starting sandbox engine"
    );

    // Initialize store (migrations included) within the startup budget
    let pool = tokio::time::timeout(INIT_TIMEOUT, Repository::init(&config.database_dsn))
        .await
        .map_err(|_| anyhow::anyhow!("store initialization timed out"))??;
    let repository = Arc::new(Repository::new(pool));
    info!("store ready");

    let docker = Arc::new(DockerManager::new(Some(&config.container_runtime_host))?);

    // Service providers
    let mut registry = ProviderRegistry::new();
    registry.register(
        "postgres",
        Arc::new(PostgresProvider::new(&config.database_provider_dsn)?),
    );
    registry.register(
        "redis",
        Arc::new(RedisProvider::new(&config.redis_address, &config.redis_password).await?),
    );
    let registry = Arc::new(registry);
    info!(providers = ?registry.names(), "service providers registered");

    for (name, result) in registry.health_check_all().await {
        if let Err(e) = result {
            warn!(provider = name, error = %e, "provider health check failed");
        }
    }

    // Templates
    let catalog = Arc::new(TemplateCatalog::new());
    if let Err(e) = catalog.load_dir(&config.templates_dir) {
        warn!(dir = config.templates_dir, error = %e, "failed to load templates");
    }

    // Services
    let manager = Arc::new(SandboxService::new(
        repository.clone(),
        docker,
        registry,
        catalog.clone(),
        config.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        repository.clone(),
        manager.clone(),
        catalog.clone(),
    ));

    // Background reaper bound to the process lifetime
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(manager.clone(), sessions.clone(), config.cleanup_interval);
    tokio::spawn(reaper.run(shutdown_rx));

    let state = AppState {
        config: config.clone(),
        repository: repository.clone(),
        manager,
        sessions,
        catalog,
    };

    let app = api::http::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;

    info!("HTTP listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    repository.close().await;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal");
}
