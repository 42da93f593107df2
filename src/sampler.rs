use anyhow::{anyhow, Result};

pub const DEFAULT_SAMPLE_EVERY: u64 = 3;

/// Temporal subsampling of detector invocations.
///
/// The decision depends only on the per-stream frame index (1-based, monotonic,
/// never reset when the source loops), never on wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSampler {
    every: u64,
}

impl FrameSampler {
    pub fn new(every: u64) -> Result<Self> {
        if every == 0 {
            return Err(anyhow!("sample interval must be >= 1"));
        }
        Ok(Self { every })
    }

    pub fn every(&self) -> u64 {
        self.every
    }

    /// True when frame `index` is submitted to the detector.
    pub fn selects(&self, index: u64) -> bool {
        index != 0 && index % self.every == 0
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self {
            every: DEFAULT_SAMPLE_EVERY,
        }
    }
}
