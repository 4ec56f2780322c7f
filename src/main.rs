//! Failover MQTT client - Main Entry Point
//!
//! Thin command line wrapper around [`FailoverClient`]: publish, subscribe,
//! pipe stdin to a topic, or inspect the offline buffer.

use clap::{Parser, Subcommand};
use failover_mqtt::config::ClientConfig;
use failover_mqtt::observability::{init_logging, logging::parse_level, LogFormat};
use failover_mqtt::store::{JournalStore, OfflineStore};
use failover_mqtt::{FailoverClient, PublishOutcome};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// Failover-aware MQTT publish/subscribe client
#[derive(Parser)]
#[command(name = "failover-mqtt")]
#[command(about = "MQTT client with broker failover and durable offline buffering")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FAILOVER_MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish each stdin line to a topic until EOF or a signal
    Run {
        #[arg(short, long)]
        topic: String,
    },
    /// Publish a single message
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// How long to wait for a broker before leaving the message buffered
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Print messages matching a filter until interrupted
    Subscribe {
        #[arg(short, long)]
        topic: String,
    },
    /// Inspect the offline buffer
    Queue {
        /// List every buffered message
        #[arg(long)]
        list: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => parse_level(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string())),
        1 => parse_level("DEBUG"),
        _ => parse_level("TRACE"),
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()));
    init_logging(level, format, cli.verbose > 1);

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { topic } => run_stdin(config, topic).await,
        Commands::Publish {
            topic,
            message,
            wait_secs,
        } => publish_once(config, topic, message, wait_secs).await,
        Commands::Subscribe { topic } => subscribe(config, topic).await,
        Commands::Queue { list } => inspect_queue(config, list).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["failover.toml", "config/failover.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create failover.toml".into())
        }
    }
}

async fn run_stdin(config: ClientConfig, topic: String) -> Result<(), Box<dyn std::error::Error>> {
    let client = FailoverClient::from_config(&config).await?;
    client
        .on_status_change(|state| info!(%state, "Client state changed"))
        .await;
    client
        .on_message(|topic, payload| info!(topic, bytes = payload.len(), "Message received"))
        .await;
    client.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => match client.publish(&topic, line.as_bytes()).await {
                    Ok(PublishOutcome::Sent) => {}
                    Ok(PublishOutcome::Queued { id }) => info!("Buffered message {} for replay", id),
                    Err(e) => warn!("Publish failed: {}", e),
                },
                None => break,
            }
        }
    }

    client.stop().await?;
    report_stats(&client).await;
    Ok(())
}

async fn publish_once(
    config: ClientConfig,
    topic: String,
    message: String,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = FailoverClient::from_config(&config).await?;
    client.start().await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    let mut status = client.status();
    let _ = tokio::time::timeout_at(deadline, status.wait_for(|state| state.is_connected())).await;

    match client.publish(&topic, message.as_bytes()).await? {
        PublishOutcome::Sent => info!("Message delivered to broker"),
        PublishOutcome::Queued { id } => {
            info!("Message {} buffered for replay", id);
            while client.pending_messages().await? > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let pending = client.pending_messages().await?;
            if pending > 0 {
                warn!("{} messages still buffered; they will be replayed on the next run", pending);
            }
        }
    }

    client.stop().await?;
    Ok(())
}

async fn subscribe(config: ClientConfig, topic: String) -> Result<(), Box<dyn std::error::Error>> {
    let client = FailoverClient::from_config(&config).await?;
    client
        .on_message(|topic, payload| {
            println!("{topic} {}", String::from_utf8_lossy(payload));
        })
        .await;
    client.subscribe(&topic).await?;
    client.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Listening on {}...", topic);
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    client.stop().await?;
    Ok(())
}

async fn inspect_queue(config: ClientConfig, list: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = JournalStore::open(&config.store.path)?;
    let messages = store.drain_ordered().await?;
    println!("{} buffered messages in {}", messages.len(), config.store.path.display());

    if list {
        for message in messages {
            println!(
                "{}\t{}\t{}\t{} bytes",
                message.id,
                message.enqueued_at.to_rfc3339(),
                message.topic,
                message.payload.len()
            );
        }
    }
    Ok(())
}

async fn report_stats(client: &FailoverClient) {
    let stats = client.stats().await;
    match serde_json::to_string(&stats) {
        Ok(json) => info!("Final stats: {}", json),
        Err(e) => warn!("Could not encode stats: {}", e),
    }
}

fn handle_config_command(config: ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
