use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use fossibot_bridge::config::{Config, LogLevel};
use fossibot_bridge::Bridge;

/// How long the graceful shutdown sequence may take before the process
/// exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version, about = "MQTT bridge for Fossibot power stations")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/fossibot-bridge/config.toml")]
    config: PathBuf,

    /// Overrides the configured log level.
    #[arg(long, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,
}

fn parse_log_level(raw: &str) -> Result<LogLevel, String> {
    match raw {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warning" => Ok(LogLevel::Warning),
        "error" => Ok(LogLevel::Error),
        other => Err(format!("unknown log level {other:?}")),
    }
}

fn init_logging(config: &Config, override_level: Option<LogLevel>) -> Result<()> {
    let level = override_level.unwrap_or(config.daemon.log_level);
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("rumqttc=warn,tungstenite=warn,info"),
    );
    builder.filter_level(level.filter());
    if let Some(path) = &config.daemon.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("fossibot-bridge: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    init_logging(&config, args.log_level)?;
    log::info!(
        "fossibot-bridge {} starting with {} account(s)",
        env!("CARGO_PKG_VERSION"),
        config.enabled_accounts().count()
    );

    let bridge = Bridge::new(config)?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
            _ = sigterm.recv() => log::info!("SIGTERM received"),
        }
        signal_token.cancel();
    });

    let runner = tokio::spawn(bridge.run(shutdown.clone()));

    // The runner finishes on its own after the shutdown token fires; if
    // the graceful sequence hangs past the grace window, leave anyway.
    tokio::select! {
        result = runner => result.context("bridge task panicked")??,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            log::warn!("Graceful shutdown did not finish within {}s, exiting", SHUTDOWN_GRACE.as_secs());
        }
    }
    Ok(())
}
