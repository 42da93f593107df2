//! Slot Occupancy State Engine
//!
//! This crate turns noisy per-frame vehicle detections from fixed parking cameras into
//! stable, debounced occupancy events.
//!
//! # Architecture
//!
//! Each camera stream runs on its own thread and owns everything it mutates:
//!
//! 1. **Frame source**: a finite, rewindable clip wrapped as an endless sequence.
//! 2. **Sampler**: only every Nth frame is handed to the detector.
//! 3. **Detector**: boxes filtered by a confidence floor; failures skip one cycle.
//! 4. **Slots**: each box centre is tested against the slot polygons.
//! 5. **Hysteresis**: a clamped counter per slot confirms Occupied / Vacant.
//!
//! Confirmed transitions from every stream are funnelled into one channel and delivered
//! to an [`sink::EventSink`] by a single dispatcher thread. A stream that fails (bad
//! region config, broken source) is reported and stopped; the others keep running.
//!
//! # Module Structure
//!
//! - `geometry`, `slot`, `sampler`: the pure per-stream engine
//! - `ingest`, `frame`, `detect`, `regions`: per-stream collaborators
//! - `runner`, `orchestrator`, `streams`: execution and supervision
//! - `sink`, `storage`: event delivery and persistence
//! - `config`: daemon configuration

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod orchestrator;
pub mod regions;
pub mod runner;
pub mod sampler;
pub mod sink;
pub mod slot;
pub mod storage;
pub mod streams;

pub use config::SlotdConfig;
pub use detect::{Detection, DetectorBackend, DetectorPolicy, GuardedDetector, StubBackend};
pub use error::SlotError;
pub use frame::Frame;
pub use geometry::{Point, Polygon};
pub use ingest::{FileConfig, FileSource, FrameSource, LoopingFrames, Pull};
pub use orchestrator::{
    Orchestrator, OrchestratorReport, OrchestratorSettings, RunningOrchestrator, StreamState,
};
pub use regions::{JsonRegionProvider, RegionProvider};
pub use runner::{RunnerStats, StreamRunner};
pub use sampler::FrameSampler;
pub use sink::EventSink;
pub use slot::{HysteresisConfig, Slot, SlotBoard, SlotState};
pub use storage::{InMemorySlotStore, SqliteSlotStore};
pub use streams::{ConfiguredStreams, StreamFactory, StreamParts};

// -------------------- Occupancy --------------------

/// Confirmed, externally visible state of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Vacant,
    Occupied,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Vacant => "Vacant",
            SlotStatus::Occupied => "Occupied",
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One confirmed transition. Produced once, handed to the sink, then dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub stream_id: String,
    pub slot_label: String,
    pub new_status: SlotStatus,
    /// Seconds since the Unix epoch at confirmation.
    pub timestamp_s: u64,
}

// -------------------- Helpers --------------------

/// Wall-clock seconds since the Unix epoch. A clock before 1970 reads as 0.
pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stream ids end up in file paths and slot labels, so keep them plain.
pub fn validate_stream_id(stream_id: &str) -> anyhow::Result<()> {
    static STREAM_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STREAM_ID_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,32}$").ok())
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("stream id pattern failed to compile"))?;
    if !re.is_match(stream_id) {
        return Err(anyhow::anyhow!(
            "stream id {:?} must match ^[A-Za-z0-9_-]{{1,32}}$",
            stream_id
        ));
    }
    Ok(())
}

/// Replace `{stream}` in a path or URL template.
pub fn expand_template(template: &str, stream_id: &str) -> String {
    template.replace("{stream}", stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_sink_contract() {
        assert_eq!(SlotStatus::Occupied.to_string(), "Occupied");
        assert_eq!(SlotStatus::Vacant.as_str(), "Vacant");
    }

    #[test]
    fn stream_ids_are_restricted() {
        assert!(validate_stream_id("W3A").is_ok());
        assert!(validate_stream_id("lot_b-2").is_ok());
        assert!(validate_stream_id("").is_err());
        assert!(validate_stream_id("../etc").is_err());
        assert!(validate_stream_id("a b").is_err());
        assert!(validate_stream_id(&"x".repeat(33)).is_err());
    }

    #[test]
    fn template_expansion() {
        assert_eq!(expand_template("config/{stream}.json", "W1"), "config/W1.json");
        assert_eq!(expand_template("stub://fixed", "W1"), "stub://fixed");
    }
}
