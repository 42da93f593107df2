//! Slots and the per-slot hysteresis state machine.
//!
//! A slot has two externally visible states, Vacant and Occupied. The raw
//! per-cycle signal ("is a vehicle centre inside the polygon right now?") is
//! noisy, so it drives a clamped counter instead of the state directly:
//!
//! - a positive signal moves the counter up, clamped at `+frames_to_occupy`;
//!   reaching the clamp confirms Occupied.
//! - a negative signal moves it down, clamped at `-frames_to_vacate`;
//!   reaching the clamp confirms Vacant.
//!
//! The counter is NOT reset when a state is confirmed. After a long-held state the
//! counter sits at its clamp, so the opposite confirmation needs the full distance
//! between the two clamps, not just one threshold's worth of frames.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Polygon};
use crate::{OccupancyEvent, SlotStatus};

pub const DEFAULT_FRAMES_TO_OCCUPY: u32 = 5;
pub const DEFAULT_FRAMES_TO_VACATE: u32 = 30;
/// The counter is an `i32`; thresholds must fit it.
pub const MAX_FRAMES_THRESHOLD: u32 = i32::MAX as u32;

/// Debounce thresholds, in sampling cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    pub frames_to_occupy: u32,
    pub frames_to_vacate: u32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            frames_to_occupy: DEFAULT_FRAMES_TO_OCCUPY,
            frames_to_vacate: DEFAULT_FRAMES_TO_VACATE,
        }
    }
}

impl HysteresisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames_to_occupy == 0 {
            return Err(anyhow!("frames_to_occupy must be >= 1"));
        }
        if self.frames_to_vacate == 0 {
            return Err(anyhow!("frames_to_vacate must be >= 1"));
        }
        if self.frames_to_occupy > MAX_FRAMES_THRESHOLD {
            return Err(anyhow!(
                "frames_to_occupy must be <= {}",
                MAX_FRAMES_THRESHOLD
            ));
        }
        if self.frames_to_vacate > MAX_FRAMES_THRESHOLD {
            return Err(anyhow!(
                "frames_to_vacate must be <= {}",
                MAX_FRAMES_THRESHOLD
            ));
        }
        Ok(())
    }
}

/// Immutable slot definition, owned by the stream runner that loaded it.
#[derive(Clone, Debug)]
pub struct Slot {
    pub stream_id: String,
    pub index: usize,
    pub label: String,
    pub polygon: Polygon,
}

impl Slot {
    /// `index` is the 0-based position in the region config. Labels are 1-based
    /// (`W1-01` is the first slot of stream `W1`).
    pub fn new(stream_id: &str, index: usize, polygon: Polygon) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            index,
            label: slot_label(stream_id, index),
            polygon,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        self.polygon.contains(point)
    }
}

pub fn slot_label(stream_id: &str, index: usize) -> String {
    format!("{}-{:02}", stream_id, index + 1)
}

/// Mutable debounce memory for one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotState {
    status: SlotStatus,
    counter: i32,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            status: SlotStatus::Vacant,
            counter: 0,
        }
    }
}

impl SlotState {
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    /// Advance the state machine by one sampling cycle.
    ///
    /// Returns the newly confirmed status iff it differs from the status before
    /// this step. At most one transition can happen per step.
    pub fn step(&mut self, occupied_now: bool, cfg: &HysteresisConfig) -> Option<SlotStatus> {
        let previous = self.status;
        let occupy = threshold(cfg.frames_to_occupy);
        let vacate = threshold(cfg.frames_to_vacate);

        if occupied_now {
            self.counter = self.counter.saturating_add(1).min(occupy);
            if self.counter >= occupy {
                self.status = SlotStatus::Occupied;
            }
        } else {
            self.counter = self.counter.saturating_sub(1).max(-vacate);
            if self.counter <= -vacate {
                self.status = SlotStatus::Vacant;
            }
        }

        (self.status != previous).then_some(self.status)
    }
}

// Unvalidated configs saturate instead of wrapping.
fn threshold(frames: u32) -> i32 {
    i32::try_from(frames).unwrap_or(i32::MAX)
}

/// Index-aligned slots and their states for one stream.
pub struct SlotBoard {
    slots: Vec<Slot>,
    states: Vec<SlotState>,
    hysteresis: HysteresisConfig,
}

impl SlotBoard {
    pub fn new(slots: Vec<Slot>, hysteresis: HysteresisConfig) -> Self {
        let states = vec![SlotState::default(); slots.len()];
        Self {
            slots,
            states,
            hysteresis,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn states(&self) -> &[SlotState] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Step every slot in index order with its raw signal, returning the
    /// transitions of this cycle in slot-index order.
    pub fn step_all(&mut self, occupied_now: &[bool], timestamp_s: u64) -> Vec<OccupancyEvent> {
        let mut events = Vec::new();
        for ((slot, state), &occupied) in self
            .slots
            .iter()
            .zip(self.states.iter_mut())
            .zip(occupied_now)
        {
            if let Some(new_status) = state.step(occupied, &self.hysteresis) {
                events.push(OccupancyEvent {
                    stream_id: slot.stream_id.clone(),
                    slot_label: slot.label.clone(),
                    new_status,
                    timestamp_s,
                });
            }
        }
        events
    }
}
