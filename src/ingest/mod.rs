//! Frame ingestion sources.
//!
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` clips (testing and dry runs)
//!
//! Sources are finite: they report `Pull::EndOfStream` when a clip ends and can be
//! rewound. The stream runner never talks to a source directly; it consumes a
//! [`LoopingFrames`], which turns a finite rewindable source into an endless
//! sequence and keeps "end of clip" distinct from "source is broken".

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use file::{FileConfig, FileSource};

/// Result of one pull from a finite source.
#[derive(Debug)]
pub enum Pull {
    Frame(Frame),
    EndOfStream,
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub rewinds: u64,
    pub location: String,
}

/// A finite, rewindable frame source.
///
/// Errors from `connect`, `pull` or `rewind` are unrecoverable for the stream.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    fn pull(&mut self) -> Result<Pull>;

    /// Restart from the first frame.
    fn rewind(&mut self) -> Result<()>;

    fn stats(&self) -> SourceStats;

    fn is_healthy(&self) -> bool {
        true
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn pull(&mut self) -> Result<Pull> {
        (**self).pull()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

/// Endless frame sequence over a rewindable source.
///
/// End-of-stream rewinds and continues. Any source error is yielded as `Err` and
/// callers treat the first one as fatal. A source that hits end-of-stream right
/// after a rewind has no frames at all and is reported as an error instead of
/// spinning.
pub struct LoopingFrames<S: FrameSource> {
    source: S,
    frames_since_rewind: u64,
}

impl<S: FrameSource> LoopingFrames<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            frames_since_rewind: 0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.frames_since_rewind = 0;
        self.source.connect()
    }

    pub fn stats(&self) -> SourceStats {
        self.source.stats()
    }

    pub fn is_healthy(&self) -> bool {
        self.source.is_healthy()
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match self.source.pull()? {
            Pull::Frame(frame) => {
                self.frames_since_rewind += 1;
                Ok(frame)
            }
            Pull::EndOfStream => {
                if self.frames_since_rewind == 0 {
                    return Err(anyhow!("source ended without producing any frames"));
                }
                log::debug!(
                    "end of stream after {} frames, rewinding {}",
                    self.frames_since_rewind,
                    self.source.stats().location
                );
                self.source.rewind()?;
                self.frames_since_rewind = 0;
                match self.source.pull()? {
                    Pull::Frame(frame) => {
                        self.frames_since_rewind = 1;
                        Ok(frame)
                    }
                    Pull::EndOfStream => Err(anyhow!("source is empty after rewind")),
                }
            }
        }
    }
}

impl<S: FrameSource> Iterator for LoopingFrames<S> {
    type Item = Result<Frame>;

    /// Never returns `None`: the sequence is infinite unless the source fails.
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_frame())
    }
}
