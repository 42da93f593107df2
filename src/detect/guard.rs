//! Per-stream detector wrapper.
//!
//! `GuardedDetector` is what the stream runner calls once per sampling cycle. It:
//! - applies the confidence floor and optional class allow-list,
//! - optionally runs the backend on a worker thread with a bounded timeout,
//! - maps every backend failure to `SlotError::DetectionTransient`,
//! - counts consecutive failures so the runner can escalate.
//!
//! A call that times out is not aborted. It finishes on the worker in the
//! background and its result is discarded; until then, further cycles fail fast
//! instead of queueing frames behind it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::SlotError;
use crate::frame::Frame;

pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.2;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorPolicy {
    pub confidence_floor: f32,
    /// Only these class ids count. `None` accepts every class.
    pub classes: Option<Vec<u32>>,
    /// Bound on one detector call. `None` runs the backend inline.
    pub timeout: Option<Duration>,
    /// Consecutive failures tolerated before escalation. 0 never escalates.
    pub max_consecutive_failures: u32,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            classes: None,
            timeout: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl DetectorPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(anyhow!(
                "confidence floor must be within [0, 1], got {}",
                self.confidence_floor
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(anyhow!("detector timeout must be greater than zero"));
        }
        Ok(())
    }

    fn accepts(&self, detection: &Detection) -> bool {
        if detection.confidence < self.confidence_floor {
            return false;
        }
        match &self.classes {
            Some(classes) => classes.contains(&detection.class_id),
            None => true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub consecutive_failures: u32,
}

enum Mode {
    Inline(Box<dyn DetectorBackend>),
    Worker(DetectorWorker),
}

pub struct GuardedDetector {
    name: &'static str,
    mode: Mode,
    policy: DetectorPolicy,
    stats: DetectorStats,
}

impl GuardedDetector {
    pub fn new(backend: Box<dyn DetectorBackend>, policy: DetectorPolicy) -> Result<Self> {
        policy.validate()?;
        let name = backend.name();
        let mode = match policy.timeout {
            Some(_) => Mode::Worker(DetectorWorker::spawn(backend)?),
            None => Mode::Inline(backend),
        };
        Ok(Self {
            name,
            mode,
            policy,
            stats: DetectorStats::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    /// True once the consecutive failure count has reached the escalation limit.
    pub fn exhausted(&self) -> bool {
        self.policy.max_consecutive_failures > 0
            && self.stats.consecutive_failures >= self.policy.max_consecutive_failures
    }

    /// Run one detection. The frame is consumed.
    pub fn detect(&mut self, frame: Frame) -> std::result::Result<Vec<Detection>, SlotError> {
        self.stats.calls += 1;
        let outcome = match &mut self.mode {
            Mode::Inline(backend) => backend
                .detect(frame.pixels(), frame.width, frame.height)
                .map_err(|e| SlotError::DetectionTransient(format!("{:#}", e))),
            Mode::Worker(worker) => {
                // Worker mode is only built with a timeout configured.
                let timeout = self.policy.timeout.unwrap_or(Duration::MAX);
                let outcome = worker.detect(frame, timeout);
                if matches!(outcome, Err(WorkerError::TimedOut)) {
                    self.stats.timeouts += 1;
                }
                outcome.map_err(|e| SlotError::DetectionTransient(e.to_string()))
            }
        };

        match outcome {
            Ok(detections) => {
                self.stats.consecutive_failures = 0;
                Ok(detections
                    .into_iter()
                    .filter(|d| self.policy.accepts(d))
                    .collect())
            }
            Err(e) => {
                self.stats.failures += 1;
                self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
                Err(e)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Worker thread
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum WorkerError {
    TimedOut,
    Busy,
    Gone,
    Backend(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::TimedOut => write!(f, "detector timed out"),
            WorkerError::Busy => write!(f, "detector still busy with a timed-out frame"),
            WorkerError::Gone => write!(f, "detector worker exited"),
            WorkerError::Backend(msg) => write!(f, "{}", msg),
        }
    }
}

type WorkerReply = std::result::Result<Vec<Detection>, String>;

struct DetectorWorker {
    requests: Option<Sender<Frame>>,
    replies: Receiver<WorkerReply>,
    pending: usize,
    join: Option<JoinHandle<()>>,
}

impl DetectorWorker {
    fn spawn(mut backend: Box<dyn DetectorBackend>) -> Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<Frame>();
        let (rep_tx, rep_rx) = mpsc::channel::<WorkerReply>();
        let join = std::thread::Builder::new()
            .name(format!("detector-{}", backend.name()))
            .spawn(move || {
                for frame in req_rx {
                    let reply = backend
                        .detect(frame.pixels(), frame.width, frame.height)
                        .map_err(|e| format!("{:#}", e));
                    if rep_tx.send(reply).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests: Some(req_tx),
            replies: rep_rx,
            pending: 0,
            join: Some(join),
        })
    }

    fn detect(
        &mut self,
        frame: Frame,
        timeout: Duration,
    ) -> std::result::Result<Vec<Detection>, WorkerError> {
        // Discard replies to calls that already timed out.
        while self.pending > 0 {
            match self.replies.try_recv() {
                Ok(_) => self.pending -= 1,
                Err(TryRecvError::Empty) => return Err(WorkerError::Busy),
                Err(TryRecvError::Disconnected) => return Err(WorkerError::Gone),
            }
        }

        let requests = self.requests.as_ref().ok_or(WorkerError::Gone)?;
        requests.send(frame).map_err(|_| WorkerError::Gone)?;
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => reply.map_err(WorkerError::Backend),
            Err(RecvTimeoutError::Timeout) => {
                self.pending += 1;
                Err(WorkerError::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::Gone),
        }
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop. Only join when no call
        // is in flight, so a stuck backend cannot hold up stream shutdown.
        self.requests.take();
        if self.pending == 0 {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use std::sync::{Arc, Mutex};

    fn frame() -> Frame {
        Frame::filled(4, 4, 0).unwrap()
    }

    fn car(confidence: f32, class_id: u32) -> Detection {
        Detection::new(0.0, 0.0, 2.0, 2.0, confidence, class_id)
    }

    #[test]
    fn applies_confidence_floor_and_class_filter() {
        let backend = StubBackend::scripted(vec![Some(vec![
            car(0.1, 0),
            car(0.2, 0),
            car(0.9, 0),
            car(0.9, 7),
        ])]);
        let policy = DetectorPolicy {
            classes: Some(vec![0]),
            ..DetectorPolicy::default()
        };
        let mut guard = GuardedDetector::new(Box::new(backend), policy).unwrap();
        let kept = guard.detect(frame()).unwrap();
        assert_eq!(kept, vec![car(0.2, 0), car(0.9, 0)]);
    }

    #[test]
    fn failures_are_transient_and_counted() {
        let backend = StubBackend::scripted(vec![None, None, Some(vec![])]);
        let policy = DetectorPolicy {
            max_consecutive_failures: 2,
            ..DetectorPolicy::default()
        };
        let mut guard = GuardedDetector::new(Box::new(backend), policy).unwrap();

        assert!(matches!(
            guard.detect(frame()),
            Err(SlotError::DetectionTransient(_))
        ));
        assert!(!guard.exhausted());
        assert!(guard.detect(frame()).is_err());
        assert!(guard.exhausted());

        assert!(guard.detect(frame()).unwrap().is_empty());
        assert!(!guard.exhausted());
        assert_eq!(guard.stats().failures, 2);
        assert_eq!(guard.stats().calls, 3);
    }

    #[test]
    fn zero_limit_never_escalates() {
        let backend = StubBackend::scripted(vec![None]);
        let policy = DetectorPolicy {
            max_consecutive_failures: 0,
            ..DetectorPolicy::default()
        };
        let mut guard = GuardedDetector::new(Box::new(backend), policy).unwrap();
        for _ in 0..500 {
            assert!(guard.detect(frame()).is_err());
        }
        assert!(!guard.exhausted());
    }

    struct GatedBackend {
        gate: Arc<Mutex<()>>,
    }

    impl DetectorBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<Vec<Detection>> {
            let _held = self.gate.lock().map_err(|_| anyhow!("gate poisoned"))?;
            Ok(vec![car(0.9, 0)])
        }
    }

    #[test]
    fn timeout_fails_cycle_then_recovers() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let policy = DetectorPolicy {
            timeout: Some(Duration::from_millis(20)),
            ..DetectorPolicy::default()
        };
        let mut guard =
            GuardedDetector::new(Box::new(GatedBackend { gate: gate.clone() }), policy).unwrap();

        assert!(guard.detect(frame()).is_err());
        assert_eq!(guard.stats().timeouts, 1);
        // Still blocked: fail fast without queueing another frame.
        assert!(guard.detect(frame()).is_err());

        drop(held);
        let mut recovered = None;
        for _ in 0..200 {
            match guard.detect(frame()) {
                Ok(dets) => {
                    recovered = Some(dets);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(recovered, Some(vec![car(0.9, 0)]));
    }

    #[test]
    fn rejects_out_of_range_floor() {
        let policy = DetectorPolicy {
            confidence_floor: 1.5,
            ..DetectorPolicy::default()
        };
        assert!(GuardedDetector::new(Box::new(StubBackend::new()), policy).is_err());
    }
}
