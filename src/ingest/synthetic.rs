//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a moving test pattern, JPEG-encoded, at the configured frame rate.
//! Used by tests and dry runs where no camera is attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};

use super::{FrameSource, PixelFormat, Resolution, SourceSettings};
use crate::codec::encode_jpeg;
use crate::frame::FrameHandoff;

const SYNTHETIC_JPEG_QUALITY: u8 = 75;

pub struct SyntheticSource {
    settings: SourceSettings,
    running: Option<Producer>,
}

struct Producer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }

    pub fn is_encoding(&self) -> bool {
        self.running.is_some()
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.settings.url
    }

    fn configure(&mut self, resolution: Resolution, format: PixelFormat) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("{}: cannot reconfigure while encoding", self.name()));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(anyhow!("{}: invalid resolution {}", self.name(), resolution));
        }
        self.settings.resolution = resolution;
        self.settings.pixel_format = format;
        Ok(())
    }

    fn start_encoding(&mut self, sink: Arc<FrameHandoff>) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("{}: already encoding", self.name()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let resolution = self.settings.resolution;
        let interval = frame_interval(self.settings.target_fps);
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("synthetic-source".to_string())
                .spawn(move || produce(resolution, interval, &sink, &stop))
                .context("spawn synthetic producer")?
        };

        log::info!(
            "SyntheticSource: encoding {} {} @ {:?}",
            self.settings.url,
            resolution,
            interval
        );
        self.running = Some(Producer { stop, handle });
        Ok(())
    }

    fn stop_encoding(&mut self) -> Result<()> {
        let Some(producer) = self.running.take() else {
            return Ok(());
        };
        producer.stop.store(true, Ordering::SeqCst);
        let frames = producer
            .handle
            .join()
            .map_err(|_| anyhow!("synthetic producer panicked"))?;
        log::info!(
            "SyntheticSource: released {} after {} frames",
            self.settings.url,
            frames
        );
        Ok(())
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop_encoding() {
            log::warn!("SyntheticSource: {}", err);
        }
    }
}

fn frame_interval(target_fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / target_fps.max(1) as f64)
}

fn produce(
    resolution: Resolution,
    interval: Duration,
    sink: &FrameHandoff,
    stop: &AtomicBool,
) -> u64 {
    let mut frame_count = 0u64;
    let mut next_tick = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        let pixels = synthetic_pattern(resolution, frame_count);
        match encode_jpeg(&pixels, SYNTHETIC_JPEG_QUALITY) {
            Ok(jpeg) => {
                sink.put(jpeg);
                frame_count += 1;
            }
            Err(err) => log::warn!("SyntheticSource: {}", err),
        }

        next_tick += interval;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            // Encoder fell behind; drop the backlog instead of bursting.
            next_tick = now;
        }
    }
    frame_count
}

/// Diagonal gradient with a bright block sweeping left to right.
fn synthetic_pattern(resolution: Resolution, frame_count: u64) -> RgbImage {
    let Resolution { width, height } = resolution;
    let block = (width.min(height) / 4).max(1);
    let travel = width.saturating_sub(block).max(1);
    let block_x = ((frame_count * 8) % travel as u64) as u32;
    let block_y = (height - block.min(height)) / 2;
    let shift = (frame_count % 256) as u32;

    RgbImage::from_fn(width, height, |x, y| {
        let inside = x >= block_x && x < block_x + block && y >= block_y && y < block_y + block;
        if inside {
            Rgb([230, 230, 230])
        } else {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) / 4 % 256) as u8,
            ])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Take;

    fn small_settings() -> SourceSettings {
        SourceSettings {
            url: "stub://test".to_string(),
            resolution: Resolution::new(64, 48),
            pixel_format: PixelFormat::Mjpeg,
            target_fps: 50,
        }
    }

    #[test]
    fn produces_decodable_frames_until_stopped() -> Result<()> {
        let handoff = Arc::new(FrameHandoff::new());
        let mut source = SyntheticSource::new(small_settings());
        source.start_encoding(handoff.clone())?;

        let frame = match handoff.take_timeout(Duration::from_secs(2)) {
            Some(Take::Frame(frame)) => frame,
            other => panic!("expected a frame, got {:?}", other),
        };
        let decoded = crate::codec::decode_jpeg(&frame.data)?;
        assert_eq!(decoded.dimensions(), (64, 48));

        source.stop_encoding()?;
        assert!(!source.is_encoding());
        let written = handoff.written_sequence();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(handoff.written_sequence(), written);
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let mut source = SyntheticSource::new(small_settings());
        source.stop_encoding()?;
        source.start_encoding(Arc::new(FrameHandoff::new()))?;
        source.stop_encoding()?;
        source.stop_encoding()?;
        Ok(())
    }

    #[test]
    fn configure_rejects_zero_resolution() {
        let mut source = SyntheticSource::new(small_settings());
        assert!(source
            .configure(Resolution::new(0, 10), PixelFormat::Mjpeg)
            .is_err());
        assert!(source
            .configure(Resolution::new(32, 32), PixelFormat::Rgb888)
            .is_ok());
    }

    #[test]
    fn pattern_moves_between_frames() {
        let resolution = Resolution::new(40, 20);
        assert_ne!(
            synthetic_pattern(resolution, 0).into_raw(),
            synthetic_pattern(resolution, 3).into_raw()
        );
    }
}
