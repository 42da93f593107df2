//! Multi-stream supervision.
//!
//! One named thread per stream. Each thread waits out its startup stagger, builds
//! its parts through the [`StreamFactory`], then runs its [`StreamRunner`] until the
//! shared shutdown flag is raised, its frame limit is reached, or it fails. Threads
//! report their state over a channel; nothing else is shared between streams apart
//! from the event channel feeding the sink dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::SlotError;
use crate::runner::{RunnerSettings, StreamRunner};
use crate::sink::{DispatchStats, Dispatcher, EventSink};
use crate::streams::StreamFactory;
use crate::OccupancyEvent;

pub const DEFAULT_STAGGER: Duration = Duration::from_secs(2);

const REPORT_POLL: Duration = Duration::from_millis(100);
const STAGGER_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub runner: RunnerSettings,
    /// Stream `i` starts `i * stagger` after launch.
    pub stagger: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            runner: RunnerSettings::default(),
            stagger: DEFAULT_STAGGER,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Failed(_))
    }
}

struct StreamReport {
    stream_id: String,
    state: StreamState,
}

pub struct StreamHandle {
    pub stream_id: String,
    state: StreamState,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn state(&self) -> &StreamState {
        &self.state
    }
}

/// What is left after shutdown.
pub struct OrchestratorReport<S> {
    pub sink: S,
    pub streams: Vec<(String, StreamState)>,
    pub dispatch: DispatchStats,
}

pub struct Orchestrator;

impl Orchestrator {
    /// Start every stream and the sink dispatcher. Returns immediately; stagger
    /// delays happen inside the stream threads.
    pub fn launch<S: EventSink + 'static>(
        stream_ids: &[String],
        factory: Arc<dyn StreamFactory>,
        sink: S,
        settings: OrchestratorSettings,
    ) -> Result<RunningOrchestrator<S>> {
        let (events_tx, events_rx) = mpsc::channel::<OccupancyEvent>();
        let (reports_tx, reports_rx) = mpsc::channel::<StreamReport>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::spawn(sink, events_rx)?;

        let mut handles = Vec::with_capacity(stream_ids.len());
        for (i, stream_id) in stream_ids.iter().enumerate() {
            let delay = settings.stagger.saturating_mul(i as u32);
            let join = spawn_stream(
                stream_id.clone(),
                delay,
                factory.clone(),
                settings.runner.clone(),
                events_tx.clone(),
                reports_tx.clone(),
                shutdown.clone(),
            );
            let (state, join) = match join {
                Ok(join) => (StreamState::Starting, Some(join)),
                Err(e) => {
                    log::error!("[{}] failed to spawn stream thread: {}", stream_id, e);
                    (StreamState::Failed(format!("spawn failed: {}", e)), None)
                }
            };
            handles.push(StreamHandle {
                stream_id: stream_id.clone(),
                state,
                join,
            });
        }
        log::info!(
            "orchestrator launched {} streams (stagger {:?})",
            handles.len(),
            settings.stagger
        );

        Ok(RunningOrchestrator {
            handles,
            reports: reports_rx,
            shutdown,
            dispatcher,
        })
    }
}

fn spawn_stream(
    stream_id: String,
    delay: Duration,
    factory: Arc<dyn StreamFactory>,
    settings: RunnerSettings,
    events: Sender<OccupancyEvent>,
    reports: Sender<StreamReport>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("stream-{}", stream_id))
        .spawn(move || {
            let report = |state: StreamState| {
                let _ = reports.send(StreamReport {
                    stream_id: stream_id.clone(),
                    state,
                });
            };

            if !sleep_unless_shutdown(delay, &shutdown) {
                log::info!("[{}] shutdown before start", stream_id);
                report(StreamState::Stopped);
                return;
            }

            let outcome = factory
                .build(&stream_id)
                .and_then(|parts| {
                    StreamRunner::build(
                        &stream_id,
                        parts.polygons,
                        parts.source,
                        parts.detector,
                        &settings,
                    )
                })
                .and_then(|runner| {
                    report(StreamState::Running);
                    runner.run(&events, &shutdown)
                });

            match outcome {
                Ok(_) => report(StreamState::Stopped),
                Err(e) => {
                    match &e {
                        SlotError::Config { .. } => {
                            log::error!("[{}] not started: {}", stream_id, e)
                        }
                        _ => log::error!("[{}] {}", stream_id, e),
                    }
                    report(StreamState::Failed(e.to_string()));
                }
            }
        })
}

/// Sleep for `total` in short slices. Returns false if shutdown was raised first.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(STAGGER_SLICE.min(deadline - now));
    }
}

pub struct RunningOrchestrator<S: EventSink + 'static> {
    handles: Vec<StreamHandle>,
    reports: Receiver<StreamReport>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Dispatcher<S>,
}

impl<S: EventSink + 'static> RunningOrchestrator<S> {
    pub fn handles(&self) -> &[StreamHandle] {
        &self.handles
    }

    /// Current state of every stream, in launch order.
    pub fn statuses(&mut self) -> Vec<(String, StreamState)> {
        while let Ok(report) = self.reports.try_recv() {
            self.apply(report);
        }
        self.reap_silent_exits();
        self.handles
            .iter()
            .map(|h| (h.stream_id.clone(), h.state.clone()))
            .collect()
    }

    pub fn all_terminal(&mut self) -> bool {
        self.statuses().iter().all(|(_, state)| state.is_terminal())
    }

    /// Block until every stream has stopped or failed.
    pub fn wait(&mut self) {
        while !self.all_terminal() {
            match self.reports.recv_timeout(REPORT_POLL) {
                Ok(report) => self.apply(report),
                Err(RecvTimeoutError::Timeout) => {}
                // Every stream thread is gone; only silent exits remain to reap.
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(REPORT_POLL),
            }
        }
    }

    /// Ask every stream to stop, wait up to `grace`, then stop the dispatcher.
    ///
    /// Streams still running after `grace` are abandoned: their threads are
    /// detached and they are reported with their last known state.
    pub fn shutdown(mut self, grace: Duration) -> Result<OrchestratorReport<S>> {
        self.shutdown.store(true, Ordering::SeqCst);
        let running = self.statuses().iter().filter(|(_, s)| !s.is_terminal()).count();
        log::info!(
            "shutting down: waiting up to {:?} for {} streams",
            grace,
            running
        );

        let deadline = Instant::now() + grace;
        while !self.all_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.reports.recv_timeout(REPORT_POLL.min(deadline - now)) {
                Ok(report) => self.apply(report),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(REPORT_POLL.min(deadline - now))
                }
            }
        }

        for handle in &mut self.handles {
            if handle.state.is_terminal() {
                if let Some(join) = handle.join.take() {
                    let _ = join.join();
                }
            } else {
                log::warn!(
                    "[{}] did not stop within {:?}, abandoning ({:?})",
                    handle.stream_id,
                    grace,
                    handle.state
                );
                drop(handle.join.take());
            }
        }

        let streams = self
            .handles
            .iter()
            .map(|h| (h.stream_id.clone(), h.state.clone()))
            .collect();
        let (sink, dispatch) = self.dispatcher.stop()?;
        log::info!(
            "shutdown complete: {} events delivered, {} dropped",
            dispatch.delivered,
            dispatch.dropped
        );
        Ok(OrchestratorReport {
            sink,
            streams,
            dispatch,
        })
    }

    fn apply(&mut self, report: StreamReport) {
        if let Some(handle) = self
            .handles
            .iter_mut()
            .find(|h| h.stream_id == report.stream_id)
        {
            handle.state = report.state;
        }
    }

    /// A thread that ended without a terminal report panicked.
    fn reap_silent_exits(&mut self) {
        let finished: Vec<usize> = self
            .handles
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.state.is_terminal())
            .filter(|(_, h)| h.join.as_ref().map_or(false, |join| join.is_finished()))
            .map(|(i, _)| i)
            .collect();
        if finished.is_empty() {
            return;
        }
        // Reports are sent before a thread ends; pick up any that raced the check.
        while let Ok(report) = self.reports.try_recv() {
            self.apply(report);
        }
        for i in finished {
            let handle = &mut self.handles[i];
            if !handle.state.is_terminal() {
                log::error!("[{}] stream thread exited unexpectedly", handle.stream_id);
                handle.state = StreamState::Failed("stream thread panicked".to_string());
            }
        }
    }
}
