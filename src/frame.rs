//! Frame buffers handed from sources to detectors.
//!
//! A `Frame` holds packed RGB24 pixels at the stream's working resolution.
//! Frames are consumed within one cycle: the runner moves each frame into the
//! detector (or drops it on pass-through cycles) and keeps nothing.

use anyhow::{anyhow, Result};
use std::time::Instant;

pub const BYTES_PER_PIXEL: usize = 3;

pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Wrap packed RGB24 pixels. The buffer length must match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}x{} expects {} RGB bytes, received {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Uniform frame, mostly for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, value: u8) -> Result<Self> {
        let len = expected_len(width, height)?;
        Self::new(vec![value; len], width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
