//! CLI definitions for the `palaver` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Streaming conversation gateway.
#[derive(Parser)]
#[command(name = "palaver", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file. Defaults to `config/config.<env>.toml`, env from `APP_ENV`.
    #[arg(long, global = true, env = "PALAVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server, queue consumers and session sweeper.
    Serve {
        /// Port to listen on (overrides the config file).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides the config file).
        #[arg(long)]
        host: Option<String>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

impl Cli {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_directives(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "info,palaver_core=debug,palaver_infra=debug,palaver_api=debug",
            _ => "trace",
        }
    }
}
