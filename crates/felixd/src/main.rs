//! Felix dataplane agent
//!
//! Main entry point for the felixd daemon.

use anyhow::Context;
use clap::Parser;
use felixd::config::DEFAULT_CONFIG_PATH;
use felixd::{Agent, AgentConfig};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "felixd", version, about = "Felix BPF IP set dataplane agent")]
struct Args {
    /// Agent configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// JSON-lines fact stream, `-` for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Log filter, e.g. `debug` or `felix_bpf=debug,info`
    #[arg(long)]
    log_level: Option<String>,

    /// IP version of the managed IP sets
    #[arg(long, value_parser = ["4", "6"])]
    ip_version: Option<String>,
}

impl Args {
    fn apply_overrides(&self, config: &mut AgentConfig) -> anyhow::Result<()> {
        if let Some(input) = &self.input {
            config.input.path = input.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(version) = &self.ip_version {
            config.ipsets.ip_version = version.parse().context("parsing --ip-version")?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply_overrides(&mut config)?;

    init_logging(&config.logging.level)?;

    info!("felixd: Starting dataplane agent");

    let agent = Agent::new(config, std::io::stdout()).context("invalid configuration")?;
    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone());

    match agent.run(cancel).await {
        Ok(report) => {
            info!(?report, "felixd: Agent exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "felixd: Agent exiting with error");
            Err(e.into())
        }
    }
}

/// Initialize structured logging. `RUST_LOG` overrides `level`.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

/// Cancels `cancel` on SIGINT.
fn setup_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("felixd: Received shutdown signal");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "felixd: Failed to listen for shutdown signal"),
        }
    });
}
