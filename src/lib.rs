//! Inference Stream
//!
//! Captures frames from a camera, runs object detection on the newest frame,
//! draws the detections, and fans the annotated JPEG out to every connected
//! subscriber.
//!
//! # Architecture
//!
//! The stream is built around a few rules:
//!
//! 1. **Newest frame wins**: the handoff between capture and inference holds
//!    one frame; a slow pipeline skips frames instead of queueing them.
//! 2. **Hardware follows the run**: the camera is acquired on `start` and
//!    released on `stop`, never held while idle.
//! 3. **A subscriber cannot stall the stream**: a failing or slow subscriber
//!    is dropped from the registry, the others keep receiving.
//! 4. **Every run ends with metrics**: however a run stops, its latency and
//!    FPS samples are flushed to disk.
//!
//! # Module Structure
//!
//! - `frame`: single-slot latest-wins handoff
//! - `ingest`: frame sources (synthetic, V4L2)
//! - `detect`: detector backends, label maps, output decoding
//! - `pipeline`: decode, preprocess, detect, annotate, re-encode
//! - `broadcast`: subscriber registry and fan-out
//! - `lifecycle`: start/stop controller and idle policy
//! - `metrics`: per-run CSV and chart output
//! - `api`: HTTP control endpoints and WebSocket subscribers
//! - `config`: daemon configuration

pub mod api;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;

pub use broadcast::{BroadcastReport, Subscriber, SubscriberId, SubscriberRegistry};
pub use detect::{BackendRegistry, BackendSettings, Detection, DetectorBackend, Prediction};
pub use frame::{Frame, FrameHandoff, Take};
pub use ingest::{FrameSource, PixelFormat, Resolution, SourceSettings};
pub use lifecycle::{
    ControllerSettings, ControllerStatus, IdlePolicy, PipelineState, RunSummary, StartOutcome,
    StopOutcome, StreamController,
};
pub use metrics::{MetricsRecorder, MetricSample, FpsSample};
pub use pipeline::{AnnotatedFrame, ExitReason, PipelineSettings, StageTimings};
