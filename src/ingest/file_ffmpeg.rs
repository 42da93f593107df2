//! Local file frame source using FFmpeg.
//!
//! Decodes the best video track of a local file and scales every frame to the
//! stream's working resolution as packed RGB24. At end of file the decoder is
//! drained before `Pull::EndOfStream` is reported; `rewind` seeks back to the
//! start and flushes the decoder.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::FileConfig;
use super::{Pull, SourceStats};
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    draining: bool,
    frames_captured: u64,
    rewinds: u64,
    last_error: Option<String>,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            config.width,
            config.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            config,
            input,
            stream_index,
            decoder,
            scaler,
            draining: false,
            frames_captured: 0,
            rewinds: 0,
            last_error: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!(
            "FileSource: opened {} (ffmpeg, scaled to {}x{})",
            self.config.path,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    pub(crate) fn pull(&mut self) -> Result<Pull> {
        loop {
            if let Some(frame) = self.receive_decoded()? {
                self.frames_captured += 1;
                return Ok(Pull::Frame(frame));
            }
            if self.draining {
                return Ok(Pull::EndOfStream);
            }

            let stream_index = self.stream_index;
            let packet = self
                .input
                .packets()
                .find(|(stream, _)| stream.index() == stream_index)
                .map(|(_, packet)| packet);

            match packet {
                Some(packet) => {
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        self.last_error = Some(e.to_string());
                        return Err(anyhow!("send packet to ffmpeg decoder: {}", e));
                    }
                }
                None => {
                    self.decoder
                        .send_eof()
                        .context("signal end of file to ffmpeg decoder")?;
                    self.draining = true;
                }
            }
        }
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.input
            .seek(0, ..)
            .with_context(|| format!("failed to seek to start of '{}'", self.config.path))?;
        self.decoder.flush();
        self.draining = false;
        self.rewinds += 1;
        Ok(())
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            rewinds: self.rewinds,
            location: self.config.path.clone(),
        }
    }

    fn receive_decoded(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let pixels = frame_to_pixels(&rgb_frame)?;
        Frame::new(pixels, rgb_frame.width(), rgb_frame.height()).map(Some)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let row_bytes = width * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return data
            .get(..row_bytes * height)
            .map(|pixels| pixels.to_vec())
            .context("ffmpeg frame is shorter than its dimensions");
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok(pixels)
}
