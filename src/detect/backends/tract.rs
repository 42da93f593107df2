#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Values per candidate before class scores: cx, cy, w, h, objectness.
const YOLO_BOX_FIELDS: usize = 5;

/// Tract-based backend for YOLOv5-style ONNX models.
///
/// The model must take a `[1, 3, H, W]` float input at the stream's working
/// resolution and produce `[1, N, 5 + C]` candidates. Boxes are returned in
/// working-resolution pixels. Candidates below `min_score` are skipped early to
/// keep the output small; the configured confidence floor is still applied by
/// the guard.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    min_score: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            min_score: 0.05,
        })
    }

    /// Override the pre-filter score.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }

        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;

        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let width = width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        let fields = *shape
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        if fields <= YOLO_BOX_FIELDS {
            return Err(anyhow!(
                "model output rows have {} values, expected more than {}",
                fields,
                YOLO_BOX_FIELDS
            ));
        }
        let values = view
            .as_slice()
            .ok_or_else(|| anyhow!("model output is not contiguous"))?;

        Ok(decode_yolo_rows(values, fields, self.min_score))
    }
}

fn decode_yolo_rows(values: &[f32], fields: usize, min_score: f32) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in values.chunks_exact(fields) {
        let objectness = row[4];
        if objectness < min_score {
            continue;
        }
        let Some((class_id, class_score)) = row[YOLO_BOX_FIELDS..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        let confidence = objectness * class_score;
        if confidence < min_score {
            continue;
        }
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        detections.push(Detection::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            confidence,
            class_id as u32,
        ));
    }
    detections
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_centre_size_rows_into_corners() {
        // Two classes; second row is below the score cut.
        let rows = [
            50.0, 40.0, 20.0, 10.0, 0.9, 0.1, 0.8, //
            10.0, 10.0, 4.0, 4.0, 0.01, 0.9, 0.1,
        ];
        let dets = decode_yolo_rows(&rows, 7, 0.05);
        assert_eq!(dets.len(), 1);
        let det = dets[0];
        assert_eq!((det.xmin, det.ymin, det.xmax, det.ymax), (40.0, 35.0, 60.0, 45.0));
        assert_eq!(det.class_id, 1);
        assert!((det.confidence - 0.72).abs() < 1e-6);
    }
}
