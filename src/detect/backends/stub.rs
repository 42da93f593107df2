use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend for tests and dry runs.
///
/// With no script it never detects anything. A script is a list of detection
/// sets returned in turn, one per call, cycling back to the start. A `None`
/// entry makes that call fail, which exercises the fail-soft path.
#[derive(Default)]
pub struct StubBackend {
    script: Vec<Option<Vec<Detection>>>,
    cursor: usize,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: Vec<Option<Vec<Detection>>>) -> Self {
        Self {
            script,
            cursor: 0,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let entry = self.script[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.script.len();
        entry.ok_or_else(|| anyhow!("scripted detector failure"))
    }
}
