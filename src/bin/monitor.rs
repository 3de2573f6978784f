use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use prolific_monitor::api::HttpMarketplace;
use prolific_monitor::browser::BrowserEvent;
use prolific_monitor::config::{CONFIG_PATH, FileSettings, SettingsStore};
use prolific_monitor::monitor::{Collaborators, Monitor};

#[derive(Parser)]
#[command(
    name = "monitor",
    about = "Background Prolific study monitor fed by browser traffic on stdin"
)]
struct Args {
    /// Path to config.toml (falls back to $MONITOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Check for studies once the first credential arrives, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var_os("MONITOR_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let settings = Arc::new(FileSettings::open(&config_path)?);
    let config = settings.config();
    info!("Loaded config from {}", config_path.display());

    let initial = settings.load();
    info!(
        "Starting monitor — api={} uid={} autostart={} interval={}s timeout={}s",
        config.marketplace.api_base,
        if initial.uid.is_empty() { "<unset>" } else { initial.uid.as_str() },
        initial.autostart,
        initial.check_interval().as_secs(),
        config.marketplace.request_timeout().as_secs(),
    );

    let marketplace = Arc::new(HttpMarketplace::new(&config.marketplace.api_base));
    let deps = Collaborators::stdout(marketplace, settings);

    if args.once {
        let (monitor, handle) = Monitor::new(deps, config.marketplace.request_timeout());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(event) = parse_event(&line) {
                handle.dispatch(event);
            }
            if handle.snapshot().authenticated {
                break;
            }
        }
        let state = monitor.run_cycle().await;
        info!("Single check finished in state {state}");
        return Ok(());
    }

    let (handle, task) = Monitor::start(deps, config.marketplace.request_timeout());
    info!("Reading browser events from stdin. Press Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_event(&line) {
                        handle.dispatch(event);
                    }
                }
                Ok(None) => {
                    info!("Browser side closed stdin");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            },
        }
    }

    drop(handle);
    task.abort();
    Ok(())
}

/// Decode one stdin line; blank and malformed lines are skipped.
fn parse_event(line: &str) -> Option<BrowserEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring malformed event: {e}");
            None
        }
    }
}
