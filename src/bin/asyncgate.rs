//! AsyncGate server CLI — `serve` (default) and `migrate` subcommands,
//! grounded on the teacher's `main.rs` (`Args`/`Command`/`setup_logging`/
//! `run_server`), trimmed to this crate's much smaller operational surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use asyncgate::{config::GateConfig, facades, storage, AppContext};

#[derive(Parser)]
#[command(name = "asyncgate", about = "AsyncGate — durable task ledger", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP listen port
    #[arg(long, env = "ASYNCGATE_PORT")]
    port: Option<u16>,

    /// Data directory for config.toml and logs
    #[arg(long, env = "ASYNCGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ASYNCGATE_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily).
    #[arg(long, env = "ASYNCGATE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Deployment environment name. Outside "development", the lease
    /// sweeper refuses to start with the shared default instance id.
    #[arg(long, env = "ASYNCGATE_ENV", default_value = "development")]
    env: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP façade and the lease-expiry sweeper (default).
    Serve,
    /// Run pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _guard = asyncgate::telemetry::init(&log_level, args.log_file.as_deref());
    let env = args.env.clone();

    let cfg = GateConfig::new(args.port, args.data_dir, args.log);

    match args.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            info!(database_url = %redact(&cfg.database_url), "running migrations");
            storage::connect(&cfg.database_url)
                .await
                .context("failed to connect and migrate")?;
            info!("migrations complete");
        }
        Command::Serve => {
            cfg.validate_instance_id(&env).map_err(anyhow::Error::msg)?;
            run_serve(cfg).await?
        }
    }

    Ok(())
}

async fn run_serve(cfg: GateConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "asyncgate starting");
    info!(
        port = cfg.port,
        instance_id = %cfg.instance_id,
        locatability_policy = ?cfg.locatability_policy,
        "config loaded"
    );

    let ctx = AppContext::new(cfg).await.context("failed to initialize")?;
    let sweeper_handle = ctx.spawn_lease_sweeper();

    let router = facades::build_router(ctx.engine.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", ctx.config.port))
        .await
        .with_context(|| format!("failed to bind port {}", ctx.config.port))?;
    info!(port = ctx.config.port, "listening");

    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = serve => {
            result.context("http server exited")?;
        }
        _ = sweeper_handle => {
            anyhow::bail!("lease sweeper task exited unexpectedly");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT (Ctrl-C) or, on unix, SIGTERM — whichever arrives
/// first — so `axum::serve` can drain in-flight requests instead of
/// dropping connections mid-response.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}

fn redact(database_url: &str) -> String {
    match database_url.split_once('@') {
        Some((_, host_and_db)) => format!("postgres://***@{host_and_db}"),
        None => "postgres://***".to_string(),
    }
}
