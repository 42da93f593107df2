use anyhow::Result;

use crate::detect::result::Detection;

/// Object detector backend.
///
/// One call per sampled frame. Input is packed RGB24 at the stream's working
/// resolution; output is zero or more boxes in arbitrary order. Backends may
/// return low-confidence boxes; the confidence floor is applied by
/// [`crate::detect::GuardedDetector`], not here.
///
/// Each stream owns its own backend instance, so implementations need `Send`
/// but not `Sync`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        (**self).detect(pixels, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
