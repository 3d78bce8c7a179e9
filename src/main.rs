mod accounts;
mod config;
mod context;
mod flash;
mod geocode;
mod guard;
mod http;
mod images;
mod listings;
mod maintenance;
mod metrics;
mod models;
mod reviews;
mod routes;
mod security;
mod seed;
mod store;

use axum::{ServiceExt, extract::Request};
use clap::{Parser, Subcommand};
use config::{AppConfig, AppEnv};
use context::AppContext;
use eyre::WrapErr;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "wanderlust")]
#[command(about = "Property listing service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Drop all listings and insert the sample set
    Seed,
    /// Replace missing local uploads with the placeholder image, durably
    FixUploads,
}

#[tokio::main]
async fn main() {
    if !AppEnv::from_env().is_production() {
        let _ = dotenvy::dotenv();
    }
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Seed => reseed().await,
        Command::FixUploads => fix_uploads().await,
    };
    if let Err(err) = result {
        error!(target = "wanderlust.api", "{err:?}");
        std::process::exit(1);
    }
}

async fn serve() -> eyre::Result<()> {
    let ctx = AppContext::init(AppConfig::from_env()).await?;
    let addr: SocketAddr = ([0, 0, 0, 0], ctx.config.port).into();
    let app = routes::app(ctx.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(target = "wanderlust.api", "listening on {addr}");

    axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;

    ctx.shutdown().await;
    Ok(())
}

async fn reseed() -> eyre::Result<()> {
    let ctx = AppContext::connect(AppConfig::from_env()).await?;
    if ctx.store.backend() == "memory" {
        warn!(
            target = "wanderlust.seed",
            "seeding the in-memory store; data is discarded when this command exits"
        );
    }
    let inserted = seed::reseed(ctx.store.as_ref(), ctx.seed_owner())
        .await
        .wrap_err("reseed failed")?;
    println!("inserted {inserted} listings");
    Ok(())
}

async fn fix_uploads() -> eyre::Result<()> {
    let ctx = AppContext::connect(AppConfig::from_env()).await?;
    let report = maintenance::fix_missing_uploads(ctx.store.as_ref(), &ctx.guard)
        .await
        .wrap_err("upload reconciliation failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "wanderlust.api", error = %err, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "wanderlust.api", error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "wanderlust.api", "shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
