use anyhow::{Context, Result};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use nadir_bridge::channel::MqttChannel;
use nadir_bridge::logging::{
    LogConfig, LogGuard, RotationPeriod, setup_console_logging, setup_file_logging,
};
use nadir_bridge::{Bridge, DeliveryOutcome, FileStore, Host, HostEvent, Settings};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Subcommand, Debug, Default, Clone)]
enum Commands {
    /// Print the configuration page URL for the stored options
    Show,
    /// Apply a configuration page response and wait for the watch to answer
    Closed {
        #[arg(long)]
        response: String,
    },
    /// Read host events from stdin: `ready`, `show`, `closed <payload>`, `quit`
    #[default]
    Run,
    /// Print the stored options
    Dump,
}

#[derive(Parser, Debug)]
struct Params {
    /// Settings file (if not set, default settings are used)
    #[clap(long)]
    settings: Option<String>,
    /// Directory for log files (if not set, logs go to stderr)
    #[clap(long)]
    log_dir: Option<String>,
    /// Log rotation period: hourly, daily or never
    #[clap(long, default_value = "daily")]
    log_rotation: RotationPeriod,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Hands configuration URLs to whoever drives the bridge from the terminal.
struct StdoutHost;

impl Host for StdoutHost {
    fn open_url(&self, url: &str) {
        println!("{url}");
    }
}

fn setup_logging(params: &Params) -> Result<LogGuard> {
    match &params.log_dir {
        Some(log_dir) => {
            let config = LogConfig::new(log_dir, params.log_rotation);
            setup_file_logging(&config).context("Failed to set up file logging")
        }
        None => Ok(setup_console_logging()),
    }
}

fn parse_event(line: &str) -> Option<HostEvent> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "ready" => Some(HostEvent::Ready),
        "show" => Some(HostEvent::ShowConfiguration),
        "closed" => Some(HostEvent::WebviewClosed {
            response: rest.trim().to_string(),
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let params = Params::parse();
    let _log_guard = setup_logging(&params)?;

    let settings = Settings::load(params.settings.as_deref()).context("Invalid settings file")?;
    let config = settings.bridge_config()?;
    let store = FileStore::new(&settings.store_dir)?;
    let channel = MqttChannel::new(settings.channel_options()?).await?;
    let bridge = Bridge::new(config, store, Arc::new(channel), StdoutHost);

    match params.command.clone().unwrap_or_default() {
        Commands::Show => {
            bridge.show_configuration();
        }
        Commands::Closed { response } => {
            if let Some(delivery) = bridge.configuration_closed(&response)? {
                match delivery.outcome().await {
                    DeliveryOutcome::Acknowledged => println!("Options applied"),
                    DeliveryOutcome::Rejected(reason) => println!("Options stored, not applied: {reason}"),
                }
            } else {
                println!("Nothing to apply");
            }
        }
        Commands::Dump => {
            if let Some(options) = bridge.load_options()? {
                println!("{}", options.to_json());
            }
        }
        Commands::Run => {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim() == "quit" {
                        break;
                    }
                    match parse_event(&line) {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => warn!("Unknown host event: {line}"),
                    }
                }
                info!("Host input closed");
            });
            bridge.run(rx).await;
        }
    }

    Ok(())
}
