//! Building the per-stream collaborators.
//!
//! The orchestrator only knows stream ids. For each one it asks a `StreamFactory`
//! for the region polygons, the frame source and the detector backend, from inside
//! the stream's own thread, so slow work (model loading) never blocks launch.

use std::sync::Arc;

use crate::config::{BackendKind, SlotdConfig};
use crate::detect::{DetectorBackend, StubBackend};
use crate::error::SlotError;
use crate::ingest::{FileConfig, FileSource, FrameSource};
use crate::regions::{JsonRegionProvider, RawPolygon, RegionProvider};

pub struct StreamParts {
    pub polygons: Vec<RawPolygon>,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn DetectorBackend>,
}

pub trait StreamFactory: Send + Sync {
    fn build(&self, stream_id: &str) -> Result<StreamParts, SlotError>;
}

impl<F> StreamFactory for F
where
    F: Fn(&str) -> Result<StreamParts, SlotError> + Send + Sync,
{
    fn build(&self, stream_id: &str) -> Result<StreamParts, SlotError> {
        self(stream_id)
    }
}

/// Factory driven by [`SlotdConfig`]: JSON region files, file sources and the
/// configured detector backend, each located by substituting the stream id.
pub struct ConfiguredStreams {
    config: SlotdConfig,
    regions: Arc<dyn RegionProvider>,
}

impl ConfiguredStreams {
    pub fn new(config: SlotdConfig) -> Self {
        let regions = Arc::new(JsonRegionProvider::new(config.regions_path.clone()));
        Self { config, regions }
    }

    /// Swap the region provider, e.g. for regions kept somewhere other than files.
    pub fn with_regions(mut self, regions: Arc<dyn RegionProvider>) -> Self {
        self.regions = regions;
        self
    }

    fn source(&self, stream_id: &str) -> Result<Box<dyn FrameSource>, SlotError> {
        let file = FileConfig {
            path: crate::expand_template(&self.config.video.source, stream_id),
            width: self.config.video.width,
            height: self.config.video.height,
        };
        let source = FileSource::new(file)
            .map_err(|e| SlotError::config(stream_id, format!("video source: {:#}", e)))?;
        Ok(Box::new(source))
    }

    fn detector(&self, stream_id: &str) -> Result<Box<dyn DetectorBackend>, SlotError> {
        match self.config.detector.backend {
            BackendKind::Stub => Ok(Box::new(StubBackend::new())),
            BackendKind::Tract => self.tract(stream_id),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn tract(&self, stream_id: &str) -> Result<Box<dyn DetectorBackend>, SlotError> {
        let model_path = self
            .config
            .detector
            .model_path
            .as_ref()
            .ok_or_else(|| SlotError::config(stream_id, "tract backend needs model_path"))?;
        let backend = crate::detect::TractBackend::new(
            model_path,
            self.config.video.width,
            self.config.video.height,
        )
        .map_err(|e| SlotError::fatal(stream_id, format!("{:#}", e)))?;
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn tract(&self, stream_id: &str) -> Result<Box<dyn DetectorBackend>, SlotError> {
        Err(SlotError::config(
            stream_id,
            "tract backend requires the backend-tract feature",
        ))
    }
}

impl StreamFactory for ConfiguredStreams {
    fn build(&self, stream_id: &str) -> Result<StreamParts, SlotError> {
        let polygons = self.regions.polygons(stream_id)?;
        let source = self.source(stream_id)?;
        let detector = self.detector(stream_id)?;
        Ok(StreamParts {
            polygons,
            source,
            detector,
        })
    }
}
