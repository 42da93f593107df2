//! export_slots - dump the slot table and recent dwell transactions as JSON

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use slot_occupancy::storage::{SlotRecord, SlotStore, TransactionRecord};
use slot_occupancy::SqliteSlotStore;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the slot database.
    #[arg(long, env = "SLOTD_DB_PATH", default_value = "parking.db")]
    db: String,
    /// Maximum transactions to export, newest first.
    #[arg(long, default_value_t = 100)]
    limit: usize,
    /// Only export this stream.
    #[arg(long)]
    stream: Option<String>,
}

#[derive(Serialize)]
struct Export {
    slots: Vec<SlotRecord>,
    transactions: Vec<TransactionRecord>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let store = SqliteSlotStore::open(&args.db)?;
    let stream = args.stream.as_deref();
    let export = Export {
        slots: store.slots(stream)?,
        transactions: store.transactions(stream, args.limit)?,
    };
    log::info!(
        "exporting {} slots, {} transactions from {}",
        export.slots.len(),
        export.transactions.len(),
        args.db
    );
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
