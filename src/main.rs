//! `matrix-channel` binary: runs the Matrix adapter against an in-process bus.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use matrix_channel::bus::{InboundSink, MessageBus, OutboundMessage};
use matrix_channel::channels::matrix::client::HttpConnector;
use matrix_channel::channels::matrix::MatrixChannel;
use matrix_channel::channels::{dispatch_outbound, Channel};
use matrix_channel::config::Config;
use matrix_channel::logging;

/// Matrix channel adapter.
#[derive(Debug, Parser)]
#[command(name = "matrix-channel", version, about)]
struct Cli {
    /// Config file path (defaults to `$MATRIX_CHANNEL_CONFIG` or `./config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level console logging for one-shot commands.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the homeserver and bridge rooms to the bus until Ctrl+C.
    Start {
        /// Reply to every admitted message with its own content.
        #[arg(long)]
        echo: bool,

        /// Directory for JSON log files.
        #[arg(long)]
        logs_dir: Option<PathBuf>,
    },
    /// Load and validate configuration, then print it with secrets redacted.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Start { echo, logs_dir } => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            if !config.matrix.enabled {
                anyhow::bail!("matrix adapter is disabled in config");
            }
            let logs_dir = logs_dir.unwrap_or_else(|| default_logs_dir(&config));
            let _guard = logging::init_production(&logs_dir)?;
            run(config, echo).await
        }
        Command::CheckConfig => {
            logging::init_cli(cli.verbose);
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Load from an explicit path, or from the default location.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from_path(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => Config::load(),
    }
}

/// `logs/` next to the Matrix store.
fn default_logs_dir(config: &Config) -> PathBuf {
    config
        .matrix
        .store_dir()
        .parent()
        .map_or_else(|| PathBuf::from("logs"), |p| p.join("logs"))
}

/// Run the adapter until Ctrl+C, then stop it gracefully.
async fn run(config: Config, echo: bool) -> Result<()> {
    let bus = Arc::new(MessageBus::new(config.bus.channel_capacity));
    let inbound: Arc<dyn InboundSink> = Arc::clone(&bus) as Arc<dyn InboundSink>;
    let mut channel = MatrixChannel::new(config.matrix, inbound, Arc::new(HttpConnector));

    channel
        .start()
        .await
        .context("failed to start Matrix channel")?;
    info!(echo, "matrix-channel ready");

    {
        let channels: [&dyn Channel; 1] = [&channel];
        tokio::select! {
            () = consume_inbound(&bus, echo) => info!("inbound queue closed"),
            () = dispatch_outbound(&bus, &channels) => info!("outbound queue closed"),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                }
                info!("shutdown requested");
            }
        }
    }

    channel.stop().await;
    info!("matrix-channel stopped");
    Ok(())
}

/// Stand-in for the agent: log each inbound message, optionally echo it.
async fn consume_inbound(bus: &MessageBus, echo: bool) {
    while let Some(msg) = bus.consume_inbound().await {
        info!(
            session = %msg.session_key(),
            sender = %msg.sender_id,
            room = msg.metadata.get("room").map_or("", String::as_str),
            "inbound message"
        );
        if echo {
            let reply = OutboundMessage::new(msg.channel, msg.chat_id, msg.content);
            if let Err(e) = bus.publish_outbound(reply).await {
                warn!(error = %e, "failed to queue echo reply");
                break;
            }
        }
    }
}
