//! Frame sources.
//!
//! This module provides the capture side of the pipeline:
//! - Synthetic source (`stub://` URLs, always available)
//! - USB/V4L2 devices producing MJPEG (feature: source-v4l2)
//!
//! Every source owns its producer thread and pushes encoded frames into a
//! `FrameHandoff`. The source holds the capture hardware between
//! `start_encoding` and `stop_encoding`; the lifecycle controller guarantees
//! that window matches the `Running` state exactly.

pub mod synthetic;
#[cfg(feature = "source-v4l2")]
pub mod v4l2;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::FrameHandoff;

pub use synthetic::SyntheticSource;
#[cfg(feature = "source-v4l2")]
pub use v4l2::V4l2Source;

/// Capture resolution in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel format requested from the capture hardware.
///
/// Sources always hand JPEG-encoded frames to the pipeline; the format only
/// selects what the sensor produces before the encoder stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Mjpeg,
    Rgb888,
    Yuv420,
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" | "jpeg" => Ok(Self::Mjpeg),
            "rgb888" | "rgb" => Ok(Self::Rgb888),
            "yuv420" | "i420" => Ok(Self::Yuv420),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

/// Capture-side settings shared by every source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSettings {
    /// `stub://name` for the synthetic source, a device path otherwise.
    pub url: String,
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            resolution: Resolution::new(1920, 1080),
            pixel_format: PixelFormat::Mjpeg,
            target_fps: 30,
        }
    }
}

/// Hardware frame source boundary.
///
/// Implementations must be safe to `stop_encoding` more than once and must
/// release the device by the time `stop_encoding` returns.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    /// Select resolution and pixel format. Called before `start_encoding`.
    fn configure(&mut self, resolution: Resolution, format: PixelFormat) -> Result<()>;

    /// Acquire the device and start pushing encoded frames into `sink`.
    fn start_encoding(&mut self, sink: Arc<FrameHandoff>) -> Result<()>;

    /// Stop the producer and release the device.
    fn stop_encoding(&mut self) -> Result<()>;
}

/// Open the source named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if settings.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    #[cfg(feature = "source-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(settings.clone())?))
    }
    #[cfg(not(feature = "source-v4l2"))]
    {
        Err(anyhow!(
            "capture from '{}' requires the source-v4l2 feature",
            settings.url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_parses_aliases() {
        assert_eq!("MJPG".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert_eq!("rgb".parse::<PixelFormat>().unwrap(), PixelFormat::Rgb888);
        assert!("bayer".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn stub_urls_open_synthetic_source() -> Result<()> {
        let source = open_source(&SourceSettings::default())?;
        assert_eq!(source.name(), "stub://camera");
        Ok(())
    }
}
