//! Palaver CLI and streaming HTTP API entry point.
//!
//! Binary name: `palaver`
//!
//! Parses CLI arguments, loads configuration, then either prints the
//! effective configuration or starts the server with its background
//! workers.

mod cli;
mod http;
mod state;

use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use palaver_infra::config::load_effective_config;
use state::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    palaver_observe::init_tracing(cli.otel, cli.log_directives())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let mut config = load_effective_config(cli.config.as_deref()).await;

    let result = match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            serve(config).await
        }
    };

    palaver_observe::shutdown_tracing();
    result
}

async fn serve(config: palaver_types::config::GlobalConfig) -> anyhow::Result<()> {
    let runtime = Runtime::start(&config).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "palaver listening");

    let router = http::router::build_router(runtime.state.clone());
    let cancel = runtime.cancellation();

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        })
        .await?;

    runtime.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
