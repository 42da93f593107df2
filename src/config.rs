use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{DetectorPolicy, DEFAULT_CONFIDENCE_FLOOR, DEFAULT_MAX_CONSECUTIVE_FAILURES};
use crate::orchestrator::OrchestratorSettings;
use crate::runner::{RunnerSettings, DEFAULT_HEALTH_INTERVAL};
use crate::sampler::{FrameSampler, DEFAULT_SAMPLE_EVERY};
use crate::slot::{HysteresisConfig, DEFAULT_FRAMES_TO_OCCUPY, DEFAULT_FRAMES_TO_VACATE};

const DEFAULT_DB_PATH: &str = "parking.db";
const DEFAULT_STREAMS: [&str; 5] = ["W3A", "W5", "W1", "W7", "W8"];
const DEFAULT_VIDEO_SOURCE: &str = "stub://{stream}";
const DEFAULT_WIDTH: u32 = 240;
const DEFAULT_HEIGHT: u32 = 386;
const DEFAULT_REGIONS: &str = "config/{stream}.json";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_STAGGER_MS: u64 = 2_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
struct SlotdConfigFile {
    db_path: Option<String>,
    streams: Option<Vec<String>>,
    video: Option<VideoConfigFile>,
    regions: Option<RegionsConfigFile>,
    detector: Option<DetectorConfigFile>,
    hysteresis: Option<HysteresisConfigFile>,
    sampling: Option<SamplingConfigFile>,
    orchestrator: Option<OrchestratorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RegionsConfigFile {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_floor: Option<f32>,
    classes: Option<Vec<u32>>,
    timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HysteresisConfigFile {
    frames_to_occupy: Option<u32>,
    frames_to_vacate: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OrchestratorConfigFile {
    stagger_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    frame_limit: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Tract,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend {:?} (expected stub or tract)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotdConfig {
    pub db_path: String,
    pub streams: Vec<String>,
    pub video: VideoSettings,
    /// Region file template; `{stream}` is replaced by the stream id.
    pub regions_path: String,
    pub detector: DetectorSettings,
    pub hysteresis: HysteresisConfig,
    pub sample_every: u64,
    pub stagger: Duration,
    pub shutdown_grace: Duration,
    pub frame_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// Source template; `{stream}` is replaced by the stream id.
    pub source: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub confidence_floor: f32,
    pub classes: Option<Vec<u32>>,
    pub timeout: Option<Duration>,
    pub max_consecutive_failures: u32,
}

impl SlotdConfig {
    /// Load from `SLOTD_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SLOTD_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SlotdConfigFile) -> Result<Self> {
        let video = file.video.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let hysteresis = file.hysteresis.unwrap_or_default();
        let orchestrator = file.orchestrator.unwrap_or_default();

        let backend = match detector.backend.as_deref() {
            Some(raw) => BackendKind::parse(raw)?,
            None => BackendKind::parse(DEFAULT_BACKEND)?,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            streams: file
                .streams
                .unwrap_or_else(|| DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect()),
            video: VideoSettings {
                source: video
                    .source
                    .unwrap_or_else(|| DEFAULT_VIDEO_SOURCE.to_string()),
                width: video.width.unwrap_or(DEFAULT_WIDTH),
                height: video.height.unwrap_or(DEFAULT_HEIGHT),
            },
            regions_path: file
                .regions
                .and_then(|regions| regions.path)
                .unwrap_or_else(|| DEFAULT_REGIONS.to_string()),
            detector: DetectorSettings {
                backend,
                model_path: detector.model_path,
                confidence_floor: detector
                    .confidence_floor
                    .unwrap_or(DEFAULT_CONFIDENCE_FLOOR),
                classes: detector.classes,
                timeout: detector.timeout_ms.map(Duration::from_millis),
                max_consecutive_failures: detector
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            },
            hysteresis: HysteresisConfig {
                frames_to_occupy: hysteresis
                    .frames_to_occupy
                    .unwrap_or(DEFAULT_FRAMES_TO_OCCUPY),
                frames_to_vacate: hysteresis
                    .frames_to_vacate
                    .unwrap_or(DEFAULT_FRAMES_TO_VACATE),
            },
            sample_every: file
                .sampling
                .and_then(|sampling| sampling.every)
                .unwrap_or(DEFAULT_SAMPLE_EVERY),
            stagger: Duration::from_millis(orchestrator.stagger_ms.unwrap_or(DEFAULT_STAGGER_MS)),
            shutdown_grace: Duration::from_millis(
                orchestrator
                    .shutdown_grace_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            frame_limit: orchestrator.frame_limit,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("SLOTD_DB_PATH") {
            self.db_path = path;
        }
        if let Ok(streams) = std::env::var("SLOTD_STREAMS") {
            let parsed = split_csv(&streams);
            if !parsed.is_empty() {
                self.streams = parsed;
            }
        }
        if let Some(source) = env_string("SLOTD_VIDEO_SOURCE") {
            self.video.source = source;
        }
        if let Some(regions) = env_string("SLOTD_REGIONS") {
            self.regions_path = regions;
        }
        if let Some(model) = env_string("SLOTD_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(model));
        }
        if let Some(backend) = env_string("SLOTD_DETECTOR_BACKEND") {
            self.detector.backend = BackendKind::parse(&backend)?;
        }
        if let Some(floor) = env_parse::<f32>("SLOTD_CONFIDENCE_FLOOR")? {
            self.detector.confidence_floor = floor;
        }
        if let Some(every) = env_parse::<u64>("SLOTD_SAMPLE_EVERY")? {
            self.sample_every = every;
        }
        if let Some(frames) = env_parse::<u32>("SLOTD_FRAMES_TO_OCCUPY")? {
            self.hysteresis.frames_to_occupy = frames;
        }
        if let Some(frames) = env_parse::<u32>("SLOTD_FRAMES_TO_VACATE")? {
            self.hysteresis.frames_to_vacate = frames;
        }
        if let Some(ms) = env_parse::<u64>("SLOTD_STAGGER_MS")? {
            self.stagger = Duration::from_millis(ms);
        }
        if let Some(limit) = env_parse::<u64>("SLOTD_FRAME_LIMIT")? {
            self.frame_limit = Some(limit);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(anyhow!("at least one stream must be configured"));
        }
        for (i, stream_id) in self.streams.iter().enumerate() {
            crate::validate_stream_id(stream_id)?;
            if self.streams[..i].contains(stream_id) {
                return Err(anyhow!("stream {} is configured twice", stream_id));
            }
        }
        self.hysteresis.validate()?;
        FrameSampler::new(self.sample_every)?;
        self.detector_policy().validate()?;
        if self.video.width == 0 || self.video.height == 0 {
            return Err(anyhow!("working resolution must be non-zero"));
        }
        if self.detector.backend == BackendKind::Tract {
            if !cfg!(feature = "backend-tract") {
                return Err(anyhow!(
                    "detector backend tract requires the backend-tract feature"
                ));
            }
            if self.detector.model_path.is_none() {
                return Err(anyhow!("detector backend tract requires model_path"));
            }
        }
        Ok(())
    }

    pub fn detector_policy(&self) -> DetectorPolicy {
        DetectorPolicy {
            confidence_floor: self.detector.confidence_floor,
            classes: self.detector.classes.clone(),
            timeout: self.detector.timeout,
            max_consecutive_failures: self.detector.max_consecutive_failures,
        }
    }

    pub fn runner_settings(&self) -> Result<RunnerSettings> {
        Ok(RunnerSettings {
            hysteresis: self.hysteresis,
            sampler: FrameSampler::new(self.sample_every)?,
            detector: self.detector_policy(),
            frame_limit: self.frame_limit,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        })
    }

    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings> {
        Ok(OrchestratorSettings {
            runner: self.runner_settings()?,
            stagger: self.stagger,
        })
    }
}

fn read_config_file(path: &Path) -> Result<SlotdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg: SlotdConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(None),
    }
}

pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
