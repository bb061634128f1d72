//! V4L2 frame source.
//!
//! Captures MJPEG from a local device node (e.g. /dev/video0) and pushes each
//! compressed buffer into the handoff unchanged. The device is opened and
//! formatted on the caller's thread so configuration errors surface from
//! `start_encoding`; the mmap stream lives entirely inside the producer thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::{FrameSource, PixelFormat, Resolution, SourceSettings};
use crate::frame::FrameHandoff;

const MMAP_BUFFERS: u32 = 4;
const CAPTURE_POLL: Duration = Duration::from_millis(250);

pub struct V4l2Source {
    settings: SourceSettings,
    running: Option<Capturer>,
}

struct Capturer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<u64>>,
}

impl V4l2Source {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        if settings.url.is_empty() {
            return Err(anyhow!("v4l2 device path is empty"));
        }
        Ok(Self {
            settings,
            running: None,
        })
    }

    fn open_device(&self) -> Result<(v4l::Device, Resolution)> {
        let path = &self.settings.url;
        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.resolution.width;
        format.height = self.settings.resolution.height;
        format.fourcc = fourcc(self.settings.pixel_format)?;
        let format = device
            .set_format(&format)
            .with_context(|| format!("set v4l2 format on {}", path))?;
        if format.fourcc != v4l::FourCC::new(b"MJPG") {
            return Err(anyhow!(
                "{} does not deliver MJPEG (got {})",
                path,
                format.fourcc
            ));
        }

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", path, err);
            }
        }

        Ok((device, Resolution::new(format.width, format.height)))
    }
}

fn fourcc(format: PixelFormat) -> Result<v4l::FourCC> {
    match format {
        PixelFormat::Mjpeg => Ok(v4l::FourCC::new(b"MJPG")),
        other => Err(anyhow!(
            "v4l2 source only supports MJPEG capture, requested {:?}",
            other
        )),
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.settings.url
    }

    fn configure(&mut self, resolution: Resolution, format: PixelFormat) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("{}: cannot reconfigure while encoding", self.name()));
        }
        fourcc(format)?;
        self.settings.resolution = resolution;
        self.settings.pixel_format = format;
        Ok(())
    }

    fn start_encoding(&mut self, sink: Arc<FrameHandoff>) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("{}: already encoding", self.name()));
        }
        let (device, active) = self.open_device()?;
        let stop = Arc::new(AtomicBool::new(false));
        let path = self.settings.url.clone();
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("v4l2-capture".to_string())
                .spawn(move || capture(&path, device, &sink, &stop))
                .context("spawn v4l2 capture thread")?
        };

        log::info!("V4l2Source: encoding {} ({})", self.settings.url, active);
        self.running = Some(Capturer { stop, handle });
        Ok(())
    }

    fn stop_encoding(&mut self) -> Result<()> {
        let Some(capturer) = self.running.take() else {
            return Ok(());
        };
        capturer.stop.store(true, Ordering::SeqCst);
        let frames = capturer
            .handle
            .join()
            .map_err(|_| anyhow!("v4l2 capture thread panicked"))??;
        log::info!(
            "V4l2Source: released {} after {} frames",
            self.settings.url,
            frames
        );
        Ok(())
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if let Err(err) = self.stop_encoding() {
            log::warn!("V4l2Source: {}", err);
        }
    }
}

fn capture(path: &str, device: v4l::Device, sink: &FrameHandoff, stop: &AtomicBool) -> Result<u64> {
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, MMAP_BUFFERS)
        .with_context(|| format!("create v4l2 buffer stream on {}", path))?;
    stream.set_timeout(CAPTURE_POLL);

    let mut frames = 0u64;
    while !stop.load(Ordering::SeqCst) {
        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                if used == 0 {
                    continue;
                }
                sink.put(buf[..used].to_vec());
                frames += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("capture frame on {}", path)))
            }
        }
    }
    Ok(frames)
}
