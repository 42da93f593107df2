use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::sink::EventSink;
use crate::{OccupancyEvent, SlotStatus};

pub const PAYMENT_UNPAID: &str = "Unpaid";

/// Current state of one slot as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotRecord {
    pub stream_id: String,
    pub slot_label: String,
    pub status: SlotStatus,
    /// Entry time of the current stay; `None` while Vacant.
    pub start_time: Option<u64>,
    pub updated_at: u64,
}

/// One closed stay: Occupied at `entry_time`, Vacant at `exit_time`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub stream_id: String,
    pub slot_label: String,
    pub entry_time: u64,
    pub exit_time: u64,
    pub dwell_s: u64,
    pub payment_status: String,
}

/// Slot table plus dwell transactions.
///
/// "Occupied" opens a stay unless the slot is already Occupied, so a duplicate
/// delivery changes nothing. "Vacant" closes the open stay into a transaction, or
/// just marks the slot Vacant when no stay is open.
pub trait SlotStore {
    fn apply(&mut self, event: &OccupancyEvent) -> Result<()>;

    fn slots(&self, stream_id: Option<&str>) -> Result<Vec<SlotRecord>>;

    /// Most recent first.
    fn transactions(&self, stream_id: Option<&str>, limit: usize) -> Result<Vec<TransactionRecord>>;
}

pub struct SqliteSlotStore {
    conn: Connection,
}

impl SqliteSlotStore {
    /// Open or create the database. `file:` URIs are accepted, which allows
    /// shared in-memory databases in tests.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS slots (
              stream_id TEXT NOT NULL,
              slot_label TEXT NOT NULL,
              status TEXT NOT NULL,
              start_time INTEGER,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (stream_id, slot_label)
            );

            CREATE TABLE IF NOT EXISTS transactions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stream_id TEXT NOT NULL,
              slot_label TEXT NOT NULL,
              entry_time INTEGER NOT NULL,
              exit_time INTEGER NOT NULL,
              dwell_s INTEGER NOT NULL,
              payment_status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_slot ON transactions(stream_id, slot_label);
            "#,
        )?;
        Ok(())
    }
}

impl SlotStore for SqliteSlotStore {
    fn apply(&mut self, event: &OccupancyEvent) -> Result<()> {
        let ts = to_sql_time(event.timestamp_s)?;
        match event.new_status {
            SlotStatus::Occupied => {
                self.conn.execute(
                    r#"
                    INSERT INTO slots (stream_id, slot_label, status, start_time, updated_at)
                    VALUES (?1, ?2, 'Occupied', ?3, ?3)
                    ON CONFLICT(stream_id, slot_label) DO UPDATE SET
                      status = 'Occupied',
                      start_time = excluded.start_time,
                      updated_at = excluded.updated_at
                    WHERE slots.status <> 'Occupied'
                    "#,
                    params![event.stream_id, event.slot_label, ts],
                )?;
            }
            SlotStatus::Vacant => {
                let tx = self.conn.transaction()?;
                let open_entry: Option<Option<i64>> = tx
                    .query_row(
                        "SELECT start_time FROM slots
                         WHERE stream_id = ?1 AND slot_label = ?2 AND status = 'Occupied'",
                        params![event.stream_id, event.slot_label],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(Some(entry)) = open_entry {
                    tx.execute(
                        "INSERT INTO transactions
                           (stream_id, slot_label, entry_time, exit_time, dwell_s, payment_status)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            event.stream_id,
                            event.slot_label,
                            entry,
                            ts,
                            (ts - entry).max(0),
                            PAYMENT_UNPAID
                        ],
                    )?;
                }
                tx.execute(
                    r#"
                    INSERT INTO slots (stream_id, slot_label, status, start_time, updated_at)
                    VALUES (?1, ?2, 'Vacant', NULL, ?3)
                    ON CONFLICT(stream_id, slot_label) DO UPDATE SET
                      status = 'Vacant',
                      start_time = NULL,
                      updated_at = excluded.updated_at
                    "#,
                    params![event.stream_id, event.slot_label, ts],
                )?;
                tx.commit()?;
            }
        }
        Ok(())
    }

    fn slots(&self, stream_id: Option<&str>) -> Result<Vec<SlotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT stream_id, slot_label, status, start_time, updated_at FROM slots
             WHERE ?1 IS NULL OR stream_id = ?1
             ORDER BY stream_id, slot_label",
        )?;
        let rows = stmt.query_map(params![stream_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (stream_id, slot_label, status, start_time, updated_at) = row?;
            out.push(SlotRecord {
                stream_id,
                slot_label,
                status: parse_status(&status)?,
                start_time: start_time.map(from_sql_time),
                updated_at: from_sql_time(updated_at),
            });
        }
        Ok(out)
    }

    fn transactions(&self, stream_id: Option<&str>, limit: usize) -> Result<Vec<TransactionRecord>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("limit exceeds i64 range"))?;
        let mut stmt = self.conn.prepare(
            "SELECT id, stream_id, slot_label, entry_time, exit_time, dwell_s, payment_status
             FROM transactions
             WHERE ?1 IS NULL OR stream_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![stream_id, limit], |row| {
            Ok(TransactionRecord {
                id: row.get(0)?,
                stream_id: row.get(1)?,
                slot_label: row.get(2)?,
                entry_time: from_sql_time(row.get(3)?),
                exit_time: from_sql_time(row.get(4)?),
                dwell_s: from_sql_time(row.get(5)?),
                payment_status: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl EventSink for SqliteSlotStore {
    fn deliver(&mut self, event: &OccupancyEvent) -> Result<()> {
        self.apply(event)
    }
}

/// Same semantics as [`SqliteSlotStore`] on plain maps. Also keeps every delivered
/// event in arrival order.
#[derive(Clone, Debug, Default)]
pub struct InMemorySlotStore {
    slots: BTreeMap<(String, String), SlotRecord>,
    transactions: Vec<TransactionRecord>,
    events: Vec<OccupancyEvent>,
}

impl InMemorySlotStore {
    pub fn events(&self) -> &[OccupancyEvent] {
        &self.events
    }

    pub fn events_for(&self, stream_id: &str) -> Vec<&OccupancyEvent> {
        self.events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .collect()
    }
}

impl SlotStore for InMemorySlotStore {
    fn apply(&mut self, event: &OccupancyEvent) -> Result<()> {
        self.events.push(event.clone());
        let key = (event.stream_id.clone(), event.slot_label.clone());
        let record = self.slots.entry(key).or_insert_with(|| SlotRecord {
            stream_id: event.stream_id.clone(),
            slot_label: event.slot_label.clone(),
            status: SlotStatus::Vacant,
            start_time: None,
            updated_at: event.timestamp_s,
        });

        match event.new_status {
            SlotStatus::Occupied => {
                if record.status != SlotStatus::Occupied {
                    record.status = SlotStatus::Occupied;
                    record.start_time = Some(event.timestamp_s);
                    record.updated_at = event.timestamp_s;
                }
            }
            SlotStatus::Vacant => {
                if let (SlotStatus::Occupied, Some(entry)) = (record.status, record.start_time) {
                    let id = self.transactions.len() as i64 + 1;
                    self.transactions.push(TransactionRecord {
                        id,
                        stream_id: event.stream_id.clone(),
                        slot_label: event.slot_label.clone(),
                        entry_time: entry,
                        exit_time: event.timestamp_s,
                        dwell_s: event.timestamp_s.saturating_sub(entry),
                        payment_status: PAYMENT_UNPAID.to_string(),
                    });
                }
                record.status = SlotStatus::Vacant;
                record.start_time = None;
                record.updated_at = event.timestamp_s;
            }
        }
        Ok(())
    }

    fn slots(&self, stream_id: Option<&str>) -> Result<Vec<SlotRecord>> {
        Ok(self
            .slots
            .values()
            .filter(|r| stream_id.map_or(true, |id| r.stream_id == id))
            .cloned()
            .collect())
    }

    fn transactions(&self, stream_id: Option<&str>, limit: usize) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .transactions
            .iter()
            .rev()
            .filter(|t| stream_id.map_or(true, |id| t.stream_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}

impl EventSink for InMemorySlotStore {
    fn deliver(&mut self, event: &OccupancyEvent) -> Result<()> {
        self.apply(event)
    }
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn to_sql_time(ts: u64) -> Result<i64> {
    i64::try_from(ts).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

fn from_sql_time(ts: i64) -> u64 {
    u64::try_from(ts).unwrap_or(0)
}

fn parse_status(raw: &str) -> Result<SlotStatus> {
    match raw {
        "Occupied" => Ok(SlotStatus::Occupied),
        "Vacant" => Ok(SlotStatus::Vacant),
        other => Err(anyhow!("corrupt slot table: unknown status {:?}", other)),
    }
}
