//! slotd - parking slot occupancy daemon
//!
//! This daemon:
//! 1. Loads configuration (file from SLOTD_CONFIG / --config, then env overrides)
//! 2. Opens the slot database
//! 3. Starts one stream runner per configured camera, staggered
//! 4. Persists confirmed Occupied / Vacant transitions and dwell transactions
//! 5. Stops all streams on Ctrl-C (or when every stream has ended)

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use slot_occupancy::config::split_csv;
use slot_occupancy::{ConfiguredStreams, Orchestrator, SlotdConfig, SqliteSlotStore, StreamState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SLOTD_CONFIG")]
    config: Option<PathBuf>,
    /// Comma-separated stream ids, overriding the configured set.
    #[arg(long)]
    streams: Option<String>,
    /// Stop each stream after this many frames.
    #[arg(long)]
    frame_limit: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = SlotdConfig::load_from(args.config.as_deref())?;
    if let Some(streams) = args.streams.as_deref() {
        config.streams = split_csv(streams);
    }
    if let Some(limit) = args.frame_limit {
        config.frame_limit = Some(limit);
    }
    config.validate()?;

    let store = SqliteSlotStore::open(&config.db_path)?;
    log::info!(
        "slotd starting: streams [{}], db {}",
        config.streams.join(", "),
        config.db_path
    );

    let settings = config.orchestrator_settings()?;
    let grace = config.shutdown_grace;
    let streams = config.streams.clone();
    let factory = Arc::new(ConfiguredStreams::new(config));
    let mut orchestrator = Orchestrator::launch(&streams, factory, store, settings)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) => {
                log::info!("shutdown signal received, stopping streams...");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if orchestrator.all_terminal() {
                    log::info!("all streams have ended");
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = orchestrator.shutdown(grace)?;
    for (stream_id, state) in &report.streams {
        match state {
            StreamState::Failed(reason) => log::warn!("[{}] failed: {}", stream_id, reason),
            other => log::info!("[{}] {:?}", stream_id, other),
        }
    }
    log::info!("slotd stopped");
    Ok(())
}
