use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use slot_occupancy::ingest::SourceStats;
use slot_occupancy::orchestrator::{OrchestratorSettings, StreamState};
use slot_occupancy::runner::RunnerSettings;
use slot_occupancy::{
    Detection, FileConfig, FileSource, Frame, FrameSampler, FrameSource, HysteresisConfig,
    InMemorySlotStore, Orchestrator, Pull, SlotError, SlotStatus, StreamParts, StubBackend,
};

fn square(x: f32) -> Vec<(f32, f32)> {
    vec![(x, 0.0), (x + 10.0, 0.0), (x + 10.0, 10.0), (x, 10.0)]
}

fn stub_source(stream_id: &str) -> Result<Box<dyn FrameSource>, SlotError> {
    let source = FileSource::new(FileConfig {
        path: format!("stub://{}", stream_id),
        width: 8,
        height: 4,
    })
    .map_err(|e| SlotError::config(stream_id, e.to_string()))?;
    Ok(Box::new(source))
}

/// Four cycles with a car in slot 1, then four without.
fn parking_script() -> StubBackend {
    let car = Detection::new(4.0, 4.0, 6.0, 6.0, 0.9, 2);
    let mut script = vec![Some(vec![car]); 4];
    script.extend(vec![Some(Vec::new()); 4]);
    StubBackend::scripted(script)
}

fn settings(frame_limit: Option<u64>) -> OrchestratorSettings {
    OrchestratorSettings {
        runner: RunnerSettings {
            hysteresis: HysteresisConfig {
                frames_to_occupy: 2,
                frames_to_vacate: 2,
            },
            sampler: FrameSampler::new(1).unwrap(),
            frame_limit,
            ..RunnerSettings::default()
        },
        stagger: Duration::from_millis(10),
    }
}

struct Unplugged {
    frames_left: u64,
}

impl FrameSource for Unplugged {
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn pull(&mut self) -> anyhow::Result<Pull> {
        if self.frames_left == 0 {
            return Err(anyhow!("device disconnected"));
        }
        self.frames_left -= 1;
        Ok(Pull::Frame(Frame::filled(8, 4, 0)?))
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Blocks in `pull` until its sender is dropped, ignoring shutdown.
struct Stalled {
    release: Receiver<()>,
}

impl FrameSource for Stalled {
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn pull(&mut self) -> anyhow::Result<Pull> {
        self.release.recv().ok();
        Err(anyhow!("capture device released"))
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Panics on its third pull.
struct Crashing {
    pulls: u64,
}

impl FrameSource for Crashing {
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn pull(&mut self) -> anyhow::Result<Pull> {
        self.pulls += 1;
        if self.pulls == 3 {
            panic!("driver assertion failed");
        }
        Ok(Pull::Frame(Frame::filled(8, 4, 0)?))
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

#[test]
fn failed_stream_does_not_affect_healthy_stream() {
    let factory = |stream_id: &str| -> Result<StreamParts, SlotError> {
        let polygons = match stream_id {
            "W1" => vec![square(0.0), square(20.0)],
            _ => Vec::new(),
        };
        Ok(StreamParts {
            polygons,
            source: stub_source(stream_id)?,
            detector: Box::new(parking_script()),
        })
    };

    let streams = vec!["W5".to_string(), "W1".to_string()];
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings(Some(24)),
    )
    .unwrap();
    orchestrator.wait();

    let statuses = orchestrator.statuses();
    assert!(matches!(&statuses[0], (id, StreamState::Failed(reason))
        if id == "W5" && reason.contains("no slots")));
    assert_eq!(statuses[1], ("W1".to_string(), StreamState::Stopped));

    let report = orchestrator.shutdown(Duration::from_secs(2)).unwrap();
    let store = report.sink;
    assert!(store.events_for("W5").is_empty());

    let w1: Vec<_> = store
        .events_for("W1")
        .into_iter()
        .map(|e| (e.slot_label.as_str(), e.new_status))
        .collect();
    assert_eq!(
        w1,
        vec![
            ("W1-01", SlotStatus::Occupied),
            ("W1-01", SlotStatus::Vacant),
            ("W1-01", SlotStatus::Occupied),
            ("W1-01", SlotStatus::Vacant),
            ("W1-01", SlotStatus::Occupied),
            ("W1-01", SlotStatus::Vacant),
        ]
    );
    assert_eq!(report.dispatch.delivered, 6);
}

#[test]
fn source_failure_mid_run_is_isolated() {
    let factory = |stream_id: &str| -> Result<StreamParts, SlotError> {
        let source: Box<dyn FrameSource> = match stream_id {
            "W7" => Box::new(Unplugged { frames_left: 3 }),
            _ => stub_source(stream_id)?,
        };
        Ok(StreamParts {
            polygons: vec![square(0.0)],
            source,
            detector: Box::new(parking_script()),
        })
    };

    let streams = vec!["W7".to_string(), "W8".to_string()];
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings(Some(8)),
    )
    .unwrap();
    orchestrator.wait();

    let statuses = orchestrator.statuses();
    assert!(matches!(&statuses[0].1, StreamState::Failed(reason) if reason.contains("device disconnected")));
    assert_eq!(statuses[1].1, StreamState::Stopped);

    let report = orchestrator.shutdown(Duration::from_secs(2)).unwrap();
    let w8: Vec<_> = report
        .sink
        .events_for("W8")
        .into_iter()
        .map(|e| e.new_status)
        .collect();
    assert_eq!(w8, vec![SlotStatus::Occupied, SlotStatus::Vacant]);
    // W7 confirmed Occupied on its second frame before the source died.
    let w7: Vec<_> = report
        .sink
        .events_for("W7")
        .into_iter()
        .map(|e| e.new_status)
        .collect();
    assert_eq!(w7, vec![SlotStatus::Occupied]);
}

#[test]
fn shutdown_stops_unbounded_streams_within_grace() {
    let factory = |stream_id: &str| -> Result<StreamParts, SlotError> {
        Ok(StreamParts {
            polygons: vec![square(0.0)],
            source: stub_source(stream_id)?,
            detector: Box::new(StubBackend::new()),
        })
    };

    let streams = vec!["W1".to_string(), "W3A".to_string()];
    let mut settings = settings(None);
    // Second stream is still waiting out its stagger when shutdown arrives.
    settings.stagger = Duration::from_secs(30);
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings,
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.statuses()[0].1 != StreamState::Running {
        assert!(Instant::now() < deadline, "stream never started");
        std::thread::sleep(Duration::from_millis(10));
    }

    let started = Instant::now();
    let report = orchestrator.shutdown(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        report.streams,
        vec![
            ("W1".to_string(), StreamState::Stopped),
            ("W3A".to_string(), StreamState::Stopped),
        ]
    );
}

#[test]
fn stream_stuck_in_pull_is_abandoned_after_grace() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(Some(release_rx));
    let factory = move |stream_id: &str| -> Result<StreamParts, SlotError> {
        let source: Box<dyn FrameSource> = match stream_id {
            "W9" => {
                let release = release_rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| SlotError::config(stream_id, "built twice"))?;
                Box::new(Stalled { release })
            }
            _ => stub_source(stream_id)?,
        };
        Ok(StreamParts {
            polygons: vec![square(0.0)],
            source,
            detector: Box::new(StubBackend::new()),
        })
    };

    let streams = vec!["W9".to_string(), "W1".to_string()];
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings(None),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator
        .statuses()
        .iter()
        .any(|(_, state)| *state != StreamState::Running)
    {
        assert!(Instant::now() < deadline, "streams never started");
        std::thread::sleep(Duration::from_millis(10));
    }

    let started = Instant::now();
    let report = orchestrator.shutdown(Duration::from_millis(300)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(
        report.streams,
        vec![
            ("W9".to_string(), StreamState::Running),
            ("W1".to_string(), StreamState::Stopped),
        ]
    );

    drop(release_tx);
}

#[test]
fn panicking_stream_is_reported_failed_and_neighbour_keeps_delivering() {
    let factory = |stream_id: &str| -> Result<StreamParts, SlotError> {
        let source: Box<dyn FrameSource> = match stream_id {
            "W4" => Box::new(Crashing { pulls: 0 }),
            _ => stub_source(stream_id)?,
        };
        Ok(StreamParts {
            polygons: vec![square(0.0)],
            source,
            detector: Box::new(parking_script()),
        })
    };

    let streams = vec!["W4".to_string(), "W1".to_string()];
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings(Some(24)),
    )
    .unwrap();
    orchestrator.wait();

    let statuses = orchestrator.statuses();
    assert_eq!(
        statuses,
        vec![
            (
                "W4".to_string(),
                StreamState::Failed("stream thread panicked".to_string())
            ),
            ("W1".to_string(), StreamState::Stopped),
        ]
    );

    let report = orchestrator.shutdown(Duration::from_secs(2)).unwrap();
    assert_eq!(
        report.streams[0].1,
        StreamState::Failed("stream thread panicked".to_string())
    );
    // W4 confirmed Occupied on its second frame, then died.
    assert_eq!(
        report
            .sink
            .events_for("W4")
            .into_iter()
            .map(|e| e.new_status)
            .collect::<Vec<_>>(),
        vec![SlotStatus::Occupied]
    );
    assert_eq!(report.sink.events_for("W1").len(), 6);
}

#[test]
fn wait_returns_once_the_only_stream_has_panicked() {
    let factory = |_: &str| -> Result<StreamParts, SlotError> {
        Ok(StreamParts {
            polygons: vec![square(0.0)],
            source: Box::new(Crashing { pulls: 0 }),
            detector: Box::new(StubBackend::new()),
        })
    };

    let streams = vec!["W4".to_string()];
    let mut orchestrator = Orchestrator::launch(
        &streams,
        Arc::new(factory),
        InMemorySlotStore::default(),
        settings(None),
    )
    .unwrap();
    let started = Instant::now();
    orchestrator.wait();
    assert!(started.elapsed() < Duration::from_secs(5));

    let report = orchestrator.shutdown(Duration::from_secs(1)).unwrap();
    assert_eq!(
        report.streams,
        vec![(
            "W4".to_string(),
            StreamState::Failed("stream thread panicked".to_string())
        )]
    );
}
