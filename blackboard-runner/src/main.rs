//! Main executable entry point for the blackboard relay.
//!
//! Initializes logging, loads and validates configuration, binds the
//! WebSocket listener and serves until Ctrl-C.

use std::path::PathBuf;

use blackboard_config::{load_config, Config};
use blackboard_transport::RelayServer;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time WebSocket broadcast relay", long_about = None)]
struct Args {
    /// Path to a JSON or TOML configuration file. Built-in defaults are used
    /// when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the WebSocket upgrade path.
    #[arg(long)]
    path: Option<String>,

    /// Do not echo messages back to the client that sent them.
    #[arg(long)]
    exclude_sender: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}...", path.display());
                load_config(path)?
            }
            None => {
                info!("No configuration file given, using defaults.");
                Config::default()
            }
        };

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.path {
            config.server.path = path;
        }
        if self.exclude_sender {
            config.relay.echo_to_sender = false;
        }

        config.validate()?;
        Ok(config)
    }
}

const DEFAULT_LOG_DIRECTIVES: &str =
    "blackboard=info,blackboard_core=info,blackboard_transport=info";

/// `RUST_LOG` directives when set and valid, otherwise `info` for the
/// workspace crates.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_DIRECTIVES))
}

/// Runs the relay.
///
/// # Errors
///
/// Returns an error (and the process exits non-zero) if:
/// - The configuration file cannot be read, parsed or validated.
/// - The listening port cannot be bound.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    info!("Starting blackboard relay...");
    let config = Args::parse().into_config()?;

    let server = match RelayServer::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };
    info!("Clients connect to ws://{}{}", config.server.bind_address(), config.server.path);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C, serving until killed: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Blackboard relay exited.");
    Ok(())
}
