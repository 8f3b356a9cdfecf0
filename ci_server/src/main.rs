//! CI Server: build orchestration for git repositories.
//!
//! A standalone binary that receives build hooks, dispatches builds for the
//! changed branches of registered projects, and serves a read-only JSON API
//! over projects, commits and build logs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::trace::TraceLayer;

use ci_server::config::CiConfig;
use ci_server::services::dispatch::Dispatcher;
use ci_server::services::executor::{BuildExecutor, ExecutorSettings};
use ci_server::services::queue::TaskQueue;
use ci_server::services::vcs::GitVcs;
use ci_server::store::{FsLogStore, MemoryStore};
use ci_server::{metrics, plugins, routes, seeder};

#[derive(Parser)]
#[command(name = "ci-server", about = "CI build orchestrator")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CI_PORT", default_value = "9090")]
    port: u16,

    /// JSON file with projects to register at start
    #[arg(long, env = "CI_PROJECTS_FILE")]
    projects: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let mut config = CiConfig::from_env();
    if cli.projects.is_some() {
        config.projects_file = cli.projects;
    }

    tracing::info!("Starting CI Server...");

    // Plugins
    let registry = plugins::load(&config)?.install()?;

    // State
    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(FsLogStore::new(&config.log_dir));
    let vcs = Arc::new(GitVcs::new());

    if let Some(path) = &config.projects_file {
        let created = seeder::seed_from_file(store.as_ref(), &registry, path).await?;
        tracing::info!(created, file = %path.display(), "Projects loaded");
    }

    // Build workers
    let executor = Arc::new(BuildExecutor::new(
        store.clone(),
        logs.clone(),
        vcs.clone(),
        registry.clone(),
        ExecutorSettings {
            workspace_dir: config.workspace_dir.clone(),
            timeout: config.build_timeout,
        },
    ));
    let (queue, worker) = TaskQueue::spawn(executor, config.max_concurrent_builds);
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        vcs,
        registry,
        Arc::new(queue),
    ));

    let app = routes::ci_router(routes::CiRouterState {
        store,
        logs,
        dispatcher,
    })
    .layer(TraceLayer::new_for_http());

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("CI Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and with it the last queue handle) is gone; let running
    // builds finish.
    tracing::info!("Waiting for running builds...");
    match tokio::time::timeout(Duration::from_secs(30), worker).await {
        Ok(Ok(summary)) => tracing::info!(
            executed = summary.executed,
            faults = summary.faults,
            "Build worker finished"
        ),
        Ok(Err(e)) => tracing::error!("Build worker crashed: {e}"),
        Err(_) => tracing::warn!("Builds still running after 30s, exiting anyway"),
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
