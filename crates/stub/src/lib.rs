//! Arbor reference server
//!
//! A small, self-contained implementation of the Arbor HTTP contract used to
//! exercise the E2E fixture runtime:
//! - `serve --config <path>` reads the TOML config the harness writes
//! - HTTPS with a self-signed certificate unless cert/key paths are given
//! - nodes, flows and metrics persisted to the configured SQLite files

pub mod auth;
pub mod server;
pub mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_common::ServerConfig;

use crate::server::AppState;
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "arbor-stub")]
#[command(about = "Reference Arbor server for harness tests")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the API over HTTPS
    Serve {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Entry point shared by the binary target.
pub fn run_cli() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            let config = ServerConfig::load(&config)
                .with_context(|| format!("loading config from {}", config.display()))?;
            let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
            runtime.block_on(serve(config))
        }
    }
}

/// Open the databases and serve until SIGTERM or Ctrl-C.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;

    let tls = tls_config(&config).await?;
    let store = Store::open(&config.database)?;
    let state = Arc::new(AppState::new(config, store));
    let app = server::router(state.clone());

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!(
        "Arbor stub '{}' listening on https://{}",
        state.config.instance.name, addr
    );
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Arbor stub stopped");
    Ok(())
}

async fn tls_config(config: &ServerConfig) -> anyhow::Result<RustlsConfig> {
    if !config.server.cert_path.is_empty() {
        return RustlsConfig::from_pem_file(&config.server.cert_path, &config.server.key_path)
            .await
            .context("loading TLS certificate");
    }

    let certified = rcgen::generate_simple_self_signed(vec![
        "127.0.0.1".to_string(),
        "localhost".to_string(),
    ])?;
    let tls = RustlsConfig::from_pem(
        certified.cert.pem().into_bytes(),
        certified.key_pair.serialize_pem().into_bytes(),
    )
    .await
    .context("building self-signed TLS config")?;
    Ok(tls)
}

async fn shutdown_on_signal(handle: axum_server::Handle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    handle.graceful_shutdown(Some(Duration::from_secs(2)));
}
