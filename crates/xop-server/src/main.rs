use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use xop_router::XopContext;

mod components;
mod config;
mod feed;
mod telemetry;

use telemetry::LogFormat;

#[derive(Parser)]
#[command(name = "xop")]
#[command(author, version, about = "XMPP proxy routing core", long_about = None)]
struct Cli {
    /// Configuration file (default: config/xop.toml, optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("XOP starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => config::load(path, true)?,
        None => config::load(Path::new(config::DEFAULT_CONFIG_PATH), false)?,
    };

    let ctx = XopContext::start(config, &components::registry())
        .await
        .context("Failed to start proxy")?;
    for (name, failure) in &ctx.load_report().failed {
        warn!(component = %name, "Component not loaded: {failure}");
    }
    info!("{}", ctx.components());

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = feed::run(&ctx, stdin) => {
            if let Err(e) = result {
                error!(error = %e, "Input feed failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
        }
    }

    let report = ctx.shutdown().await;
    for (name, e) in &report.failed {
        warn!(component = %name, error = %e, "Component did not stop cleanly");
    }
    info!(stopped = ?report.stopped, "XOP stopped");

    Ok(())
}
