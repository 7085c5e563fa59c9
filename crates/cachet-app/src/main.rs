//! Cachet - caching HTTP(S) forward proxy for development.
//!
//! Loads the configuration, sets up logging and runs the proxy until the
//! listener fails or the process is killed.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cachet_core::{Config, LogConfig};
use cachet_proxy::ProxyServer;

/// Caching HTTP(S) forward proxy for development
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides config (example: 127.0.0.1:8080)
    #[arg(short, long)]
    address: Option<String>,

    /// Enable verbose (debug) logging, overrides config
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must happen before any TLS configuration is built.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install default crypto provider");

    let args = Args::parse();

    let config_path = resolve_config_path(args.config);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if let Some(address) = args.address {
        config.server.http.address = address;
    }
    if args.verbose {
        config.log.level = "debug".to_string();
    }

    config.validate().context("invalid configuration")?;

    init_tracing(&config.log);
    tracing::debug!("loaded configuration from {}", config_path.display());

    let server = ProxyServer::new(config).context("failed to create proxy server")?;
    server.run().await.context("server failed")?;
    Ok(())
}

/// Resolves the configuration file path: CLI flag, then the
/// `CACHET_CONFIG` environment variable, then the user config directory.
fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }

    if let Ok(path) = std::env::var("CACHET_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    directories::ProjectDirs::from("dev", "cachet", "cachet")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Initializes the tracing subscriber from the log configuration.
///
/// Unless `third_party` is set, the configured level only applies to the
/// cachet crates so dependency noise stays out of the request log.
fn init_tracing(log: &LogConfig) {
    let directive = if log.third_party {
        log.level.clone()
    } else {
        let level = &log.level;
        format!("cachet_app={level},cachet_core={level},cachet_cache={level},cachet_proxy={level}")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
