//! Region config: where slot polygons come from.
//!
//! A provider returns, per stream, an ordered list of polygons. Order is significant:
//! the position in the list is the slot index and therefore the slot label, so it must
//! be stable across restarts.

use std::path::PathBuf;

use crate::error::SlotError;
use crate::geometry::{Point, Polygon};
use crate::slot::Slot;

/// Raw polygon as stored: `[x, y]` pairs in working-resolution pixels.
pub type RawPolygon = Vec<(f32, f32)>;

pub trait RegionProvider: Send + Sync {
    fn polygons(&self, stream_id: &str) -> Result<Vec<RawPolygon>, SlotError>;
}

/// Reads one JSON file per stream, e.g. `config/W1.json`:
///
/// ```json
/// [[[10, 10], [60, 10], [60, 90], [10, 90]], [[70, 10], [120, 10], [120, 90]]]
/// ```
#[derive(Clone, Debug)]
pub struct JsonRegionProvider {
    template: String,
}

impl JsonRegionProvider {
    /// `template` may contain `{stream}`, replaced by the stream id.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn path_for(&self, stream_id: &str) -> PathBuf {
        PathBuf::from(crate::expand_template(&self.template, stream_id))
    }
}

impl RegionProvider for JsonRegionProvider {
    fn polygons(&self, stream_id: &str) -> Result<Vec<RawPolygon>, SlotError> {
        let path = self.path_for(stream_id);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            SlotError::config(
                stream_id,
                format!("failed to read region file {}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SlotError::config(
                stream_id,
                format!("invalid region file {}: {}", path.display(), e),
            )
        })
    }
}

/// Validate raw polygons and turn them into labelled slots.
///
/// An empty list is an error: a stream with no slots has nothing to report.
pub fn build_slots(stream_id: &str, polygons: Vec<RawPolygon>) -> Result<Vec<Slot>, SlotError> {
    if polygons.is_empty() {
        return Err(SlotError::config(stream_id, "region config has no slots"));
    }
    polygons
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let vertices = raw.into_iter().map(Point::from).collect();
            let polygon = Polygon::new(vertices).map_err(|e| {
                SlotError::config(stream_id, format!("slot {}: {}", index + 1, e))
            })?;
            Ok(Slot::new(stream_id, index, polygon))
        })
        .collect()
}
