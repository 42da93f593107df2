//! Per-stream pipeline.
//!
//! One `StreamRunner` per camera. It exclusively owns the stream's slots, their
//! hysteresis states, the frame source and the detector, so nothing inside a stream
//! is shared or locked. The only way out is the event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::detect::{Detection, DetectorBackend, DetectorPolicy, GuardedDetector};
use crate::error::SlotError;
use crate::frame::Frame;
use crate::ingest::{FrameSource, LoopingFrames};
use crate::regions::{build_slots, RawPolygon};
use crate::sampler::FrameSampler;
use crate::slot::{HysteresisConfig, Slot, SlotBoard};
use crate::OccupancyEvent;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a runner needs besides its parts.
#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub hysteresis: HysteresisConfig,
    pub sampler: FrameSampler,
    pub detector: DetectorPolicy,
    /// Stop cleanly after this many frames. `None` runs until shutdown.
    pub frame_limit: Option<u64>,
    pub health_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            hysteresis: HysteresisConfig::default(),
            sampler: FrameSampler::default(),
            detector: DetectorPolicy::default(),
            frame_limit: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub frames: u64,
    pub cycles: u64,
    pub events: u64,
    pub detector_failures: u64,
}

pub struct StreamRunner {
    stream_id: String,
    board: SlotBoard,
    sampler: FrameSampler,
    detector: GuardedDetector,
    frames: LoopingFrames<Box<dyn FrameSource>>,
    frame_limit: Option<u64>,
    health_interval: Duration,
    frame_index: u64,
    stats: RunnerStats,
}

impl StreamRunner {
    /// Validate the region config and assemble the pipeline.
    ///
    /// Region problems come back as `SlotError::Config`; a detector that cannot
    /// warm up is `SlotError::StreamFatal`.
    pub fn build(
        stream_id: &str,
        polygons: Vec<RawPolygon>,
        source: Box<dyn FrameSource>,
        mut detector: Box<dyn DetectorBackend>,
        settings: &RunnerSettings,
    ) -> Result<Self, SlotError> {
        let slots = build_slots(stream_id, polygons)?;
        settings
            .hysteresis
            .validate()
            .map_err(|e| SlotError::config(stream_id, e.to_string()))?;
        detector
            .warm_up()
            .map_err(|e| SlotError::fatal(stream_id, format!("detector warm-up failed: {:#}", e)))?;
        let detector = GuardedDetector::new(detector, settings.detector.clone())
            .map_err(|e| SlotError::config(stream_id, e.to_string()))?;
        Ok(Self::new(stream_id, slots, source, detector, settings))
    }

    pub fn new(
        stream_id: &str,
        slots: Vec<Slot>,
        source: Box<dyn FrameSource>,
        detector: GuardedDetector,
        settings: &RunnerSettings,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            board: SlotBoard::new(slots, settings.hysteresis),
            sampler: settings.sampler,
            detector,
            frames: LoopingFrames::new(source),
            frame_limit: settings.frame_limit,
            health_interval: settings.health_interval,
            frame_index: 0,
            stats: RunnerStats::default(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn board(&self) -> &SlotBoard {
        &self.board
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
    }

    /// One frame through the pipeline.
    ///
    /// Frames the sampler skips never reach the detector or the slots. A detector
    /// failure counts as an empty cycle unless it pushes the consecutive failure
    /// count to the escalation limit, in which case the stream is done.
    pub fn process_frame(&mut self, frame: Frame) -> Result<Vec<OccupancyEvent>, SlotError> {
        self.frame_index += 1;
        self.stats.frames += 1;
        if !self.sampler.selects(self.frame_index) {
            return Ok(Vec::new());
        }
        self.stats.cycles += 1;
        log::debug!(
            "[{}] cycle at frame {} (frame age {} ms)",
            self.stream_id,
            self.frame_index,
            frame.age_ms()
        );

        let detections = match self.detector.detect(frame) {
            Ok(detections) => detections,
            Err(e) => {
                self.stats.detector_failures += 1;
                let consecutive = self.detector.stats().consecutive_failures;
                if self.detector.exhausted() {
                    log::error!(
                        "[{}] detector failed {} times in a row, giving up: {}",
                        self.stream_id,
                        consecutive,
                        e
                    );
                    return Err(SlotError::fatal(
                        &self.stream_id,
                        format!("detector failed {} consecutive cycles: {}", consecutive, e),
                    ));
                }
                log::warn!(
                    "[{}] {} ({} consecutive), treating cycle as empty",
                    self.stream_id,
                    e,
                    consecutive
                );
                Vec::new()
            }
        };

        let signals = slot_signals(self.board.slots(), &detections);
        let events = self.board.step_all(&signals, crate::now_s());
        for event in &events {
            log::info!(
                "[{}] {} -> {}",
                self.stream_id,
                event.slot_label,
                event.new_status
            );
        }
        self.stats.events += events.len() as u64;
        Ok(events)
    }

    /// Drive the stream until shutdown, the frame limit, or a fatal error.
    ///
    /// `shutdown` is checked at the top of every cycle, before blocking on the
    /// source. A cycle already in progress (including its detector call) completes.
    pub fn run(
        mut self,
        events: &Sender<OccupancyEvent>,
        shutdown: &AtomicBool,
    ) -> Result<RunnerStats, SlotError> {
        self.frames.connect().map_err(|e| {
            SlotError::fatal(&self.stream_id, format!("source connect failed: {:#}", e))
        })?;
        log::info!(
            "[{}] started: {} slots, detector {}, source {}",
            self.stream_id,
            self.board.len(),
            self.detector.name(),
            self.frames.stats().location
        );

        let mut last_health = Instant::now();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("[{}] shutdown requested", self.stream_id);
                break;
            }
            if let Some(limit) = self.frame_limit {
                if self.frame_index >= limit {
                    log::info!("[{}] frame limit {} reached", self.stream_id, limit);
                    break;
                }
            }

            let frame = match self.frames.next() {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    return Err(SlotError::fatal(
                        &self.stream_id,
                        format!("frame source failed: {:#}", e),
                    ))
                }
                None => break,
            };
            if self.frame_index == 0 {
                log::info!(
                    "[{}] receiving frames at {}x{}",
                    self.stream_id,
                    frame.width,
                    frame.height
                );
            }

            for event in self.process_frame(frame)? {
                if events.send(event).is_err() {
                    return Err(SlotError::fatal(&self.stream_id, "event channel closed"));
                }
            }

            if last_health.elapsed() >= self.health_interval {
                self.log_health();
                last_health = Instant::now();
            }
        }

        log::info!(
            "[{}] stopped after {} frames, {} events",
            self.stream_id,
            self.stats.frames,
            self.stats.events
        );
        Ok(self.stats)
    }

    fn log_health(&self) {
        let source = self.frames.stats();
        log::info!(
            "[{}] health: frames={} cycles={} events={} detector_failures={} rewinds={} source_healthy={}",
            self.stream_id,
            self.stats.frames,
            self.stats.cycles,
            self.stats.events,
            self.stats.detector_failures,
            source.rewinds,
            self.frames.is_healthy()
        );
    }
}

/// Raw per-slot signal for one cycle: true iff some detection centre lies in the slot.
pub fn slot_signals(slots: &[Slot], detections: &[Detection]) -> Vec<bool> {
    slots
        .iter()
        .map(|slot| detections.iter().any(|d| slot.contains(d.center())))
        .collect()
}
