//! huddle-relay binary: load config, set up logging, serve.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use huddle_config::HuddleConfig;
use huddle_relay::{serve, Hub};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "huddle-relay", version, about = "WebSocket signaling relay for huddle voice rooms")]
struct Args {
    /// Port to listen on. Overrides `relay.listen_port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Config file path override.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter override (e.g. `debug` or `huddle_relay=trace`).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => huddle_config::load_config_from(path),
        None => huddle_config::load_config(),
    };
    let (config, load_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (HuddleConfig::default(), Some(e)),
    };

    init_tracing(&args, &config);
    if let Some(e) = load_error {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
    }

    let port = match args.port {
        Some(port) => port,
        None => match u16::try_from(config.relay.listen_port) {
            Ok(port) => port,
            Err(_) => {
                tracing::error!(port = config.relay.listen_port, "Invalid listen port");
                return ExitCode::FAILURE;
            }
        },
    };
    let addr = format!("{}:{}", args.bind, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind TCP listener");
            return ExitCode::FAILURE;
        }
    };

    let idle_timeout = Duration::from_secs(u64::from(config.relay.idle_timeout));
    tracing::info!(addr = %addr, idle_timeout_secs = idle_timeout.as_secs(), "huddle-relay listening");

    let hub = Hub::new();
    tokio::select! {
        _ = serve(listener, hub.clone(), idle_timeout) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(
                connections = hub.connection_count().await,
                records = hub.record_count().await,
                "Shutting down"
            );
        }
    }
    ExitCode::SUCCESS
}

fn init_tracing(args: &Args, config: &HuddleConfig) {
    let directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.directive());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
