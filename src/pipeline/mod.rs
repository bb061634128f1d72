//! Inference pipeline.
//!
//! One iteration: take the newest frame, decode, preprocess, detect,
//! threshold, annotate, re-encode, record timings, broadcast. The loop runs
//! on a dedicated thread and exits when the handoff is closed, when it is
//! cancelled, or when the backend fails.

pub mod annotate;
pub mod preprocess;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;

use crate::broadcast::{SubscriberId, SubscriberRegistry};
use crate::codec::{decode_jpeg, encode_jpeg};
use crate::detect::{Detection, DetectorBackend};
use crate::frame::{Frame, FrameHandoff, Take};
use crate::metrics::MetricsRecorder;

/// Called on the pipeline thread with the ids a broadcast just dropped.
pub type DropHook = Box<dyn Fn(&[SubscriberId]) + Send>;

/// One broadcast payload.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    /// Position among frames processed in this run (starts at 0).
    pub frame_index: u64,
    /// Handoff sequence of the source frame.
    pub source_sequence: u64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
    pub detections: Vec<Detection>,
}

/// Wall-clock cost of each stage for one frame, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
    /// From the moment the frame was taken until it was re-encoded.
    pub total_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Predictions must score strictly above this to be kept.
    pub score_threshold: f32,
    pub jpeg_quality: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            jpeg_quality: 80,
        }
    }
}

/// Cooperative cancellation flag, checked between stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the loop ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ExitReason {
    /// The handoff was closed.
    Closed,
    /// The cancellation token fired.
    Cancelled,
    /// The backend returned an error.
    Failed(String),
}

/// What the pipeline thread hands back on join.
#[derive(Debug)]
pub struct PipelineExit {
    pub recorder: MetricsRecorder,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub reason: ExitReason,
}

enum Step {
    Continue,
    Exit(ExitReason),
}

pub struct InferencePipeline {
    backend: Box<dyn DetectorBackend>,
    handoff: Arc<FrameHandoff>,
    registry: Arc<SubscriberRegistry>,
    recorder: MetricsRecorder,
    settings: PipelineSettings,
    cancel: CancelToken,
    processed: Arc<AtomicU64>,
    frames_skipped: u64,
    on_drop: Option<DropHook>,
}

impl InferencePipeline {
    pub fn new(
        backend: Box<dyn DetectorBackend>,
        handoff: Arc<FrameHandoff>,
        registry: Arc<SubscriberRegistry>,
        settings: PipelineSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            backend,
            handoff,
            registry,
            recorder: MetricsRecorder::new(),
            settings,
            cancel,
            processed: Arc::new(AtomicU64::new(0)),
            frames_skipped: 0,
            on_drop: None,
        }
    }

    /// Share a live processed-frame counter with the caller.
    pub fn with_counter(mut self, processed: Arc<AtomicU64>) -> Self {
        self.processed = processed;
        self
    }

    /// Run `hook` after any broadcast that unregistered a subscriber.
    /// It must not block on this pipeline.
    pub fn on_subscribers_dropped(
        mut self,
        hook: impl Fn(&[SubscriberId]) + Send + 'static,
    ) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    /// Run until closed, cancelled or failed.
    pub fn run(mut self) -> PipelineExit {
        self.recorder.reset();
        let reason = loop {
            let frame = match self.handoff.take() {
                Take::Frame(frame) => frame,
                Take::Closed => break ExitReason::Closed,
            };
            match self.step(&frame) {
                Step::Continue => {}
                Step::Exit(reason) => break reason,
            }
        };

        let frames_processed = self.processed.load(Ordering::SeqCst);
        match &reason {
            ExitReason::Failed(message) => log::error!(
                "pipeline: backend {} failed after {} frames: {}",
                self.backend.name(),
                frames_processed,
                message
            ),
            other => log::info!(
                "pipeline: exited ({:?}) after {} frames, {} skipped",
                other,
                frames_processed,
                self.frames_skipped
            ),
        }

        PipelineExit {
            recorder: self.recorder,
            frames_processed,
            frames_skipped: self.frames_skipped,
            reason,
        }
    }

    fn step(&mut self, frame: &Frame) -> Step {
        let taken_at = Instant::now();
        if self.cancel.is_cancelled() {
            return Step::Exit(ExitReason::Cancelled);
        }

        let image = match decode_jpeg(&frame.data) {
            Ok(image) => image,
            Err(err) => {
                self.frames_skipped += 1;
                log::warn!("pipeline: skipping frame {}: {:#}", frame.sequence, err);
                return Step::Continue;
            }
        };

        let pre_start = Instant::now();
        let spec = self.backend.input_spec();
        let input = preprocess::preprocess(&image, &spec);
        let preprocess_ms = ms_since(pre_start);
        if self.cancel.is_cancelled() {
            return Step::Exit(ExitReason::Cancelled);
        }

        let infer_start = Instant::now();
        let predictions = match self.backend.detect(&input) {
            Ok(predictions) => predictions,
            Err(err) => return Step::Exit(ExitReason::Failed(format!("{:#}", err))),
        };
        let inference_ms = ms_since(infer_start);
        if self.cancel.is_cancelled() {
            return Step::Exit(ExitReason::Cancelled);
        }

        let post_start = Instant::now();
        let (width, height) = image.dimensions();
        let detections: Vec<Detection> = predictions
            .into_iter()
            .filter(|p| p.score > self.settings.score_threshold)
            .map(|p| Detection::from_prediction(p, width, height))
            .collect();
        let mut annotated = image;
        annotate::annotate(&mut annotated, &detections);
        let jpeg = match encode_jpeg(&annotated, self.settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.frames_skipped += 1;
                log::warn!("pipeline: dropping frame {}: {:#}", frame.sequence, err);
                return Step::Continue;
            }
        };
        let postprocess_ms = ms_since(post_start);
        if self.cancel.is_cancelled() {
            return Step::Exit(ExitReason::Cancelled);
        }

        let timings = StageTimings {
            preprocess_ms,
            inference_ms,
            postprocess_ms,
            total_ms: ms_since(taken_at),
        };
        self.recorder.record(&timings);
        let frame_index = self.processed.fetch_add(1, Ordering::SeqCst);

        log::debug!(
            "{}: {}x{} {}, {:.1}ms",
            frame_index,
            width,
            height,
            summarize(&detections),
            timings.total_ms
        );
        log::debug!(
            "Speed: {:.1}ms preprocess, {:.1}ms inference, {:.1}ms postprocess per image at shape {:?}",
            timings.preprocess_ms,
            timings.inference_ms,
            timings.postprocess_ms,
            spec.shape()
        );

        let payload = AnnotatedFrame {
            frame_index,
            source_sequence: frame.sequence,
            width,
            height,
            jpeg: Bytes::from(jpeg),
            detections,
        };
        let report = self.registry.broadcast(&payload);
        if !report.removed.is_empty() {
            log::warn!(
                "pipeline: {} subscriber(s) dropped during broadcast",
                report.removed.len()
            );
            if let Some(hook) = &self.on_drop {
                hook(&report.removed);
            }
        }
        Step::Continue
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// `"2 person, 1 dog"` in order of first appearance.
pub fn summarize(detections: &[Detection]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for detection in detections {
        match counts
            .iter_mut()
            .find(|(label, _)| *label == detection.label.as_str())
        {
            Some((_, count)) => *count += 1,
            None => counts.push((detection.label.as_str(), 1)),
        }
    }
    if counts.is_empty() {
        return "No objects detected".to_string();
    }
    let mut out = String::new();
    for (i, (label, count)) in counts.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} {}", count, label);
    }
    out
}

/// Run `backend` once on a zeroed input. Used by start-up and `check-backend`.
pub fn warm_up(backend: &mut dyn DetectorBackend) -> Result<()> {
    let started = Instant::now();
    backend.warm_up()?;
    log::info!(
        "backend {} warmed up in {:.1}ms",
        backend.name(),
        ms_since(started)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Subscriber, SubscriberId};
    use crate::detect::{
        BoundingBox, InputSpec, ModelInput, NormalizedBox, Prediction, StubBackend,
    };
    use anyhow::anyhow;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Capture {
        frames: Mutex<Vec<AnnotatedFrame>>,
    }

    impl Subscriber for Capture {
        fn id(&self) -> SubscriberId {
            1
        }

        fn send(&self, frame: &AnnotatedFrame) -> Result<()> {
            self.frames.lock().expect("capture lock").push(frame.clone());
            Ok(())
        }
    }

    struct Dead;

    impl Subscriber for Dead {
        fn id(&self) -> SubscriberId {
            7
        }

        fn send(&self, _frame: &AnnotatedFrame) -> Result<()> {
            Err(anyhow!("peer reset"))
        }
    }

    /// Fires the token from inside inference, as `stop` would mid-frame.
    struct CancelsDuringDetect(CancelToken);

    impl DetectorBackend for CancelsDuringDetect {
        fn name(&self) -> &'static str {
            "cancelling"
        }

        fn input_spec(&self) -> InputSpec {
            StubBackend::new().input_spec()
        }

        fn detect(&mut self, _input: &ModelInput) -> Result<Vec<Prediction>> {
            self.0.cancel();
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn detection(label: &str) -> Detection {
        Detection {
            class_id: 0,
            label: label.to_string(),
            score: 0.9,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                w: 1,
                h: 1,
            },
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([90, 90, 90])), 80)
            .expect("encode test frame")
    }

    fn prediction(score: f32) -> Prediction {
        Prediction {
            class_id: 1,
            label: "dog".to_string(),
            score,
            bbox: NormalizedBox::new(0.1, 0.1, 0.5, 0.5),
        }
    }

    #[test]
    fn summary_counts_labels_in_first_seen_order() {
        let detections = [
            detection("person"),
            detection("dog"),
            detection("person"),
        ];
        assert_eq!(summarize(&detections), "2 person, 1 dog");
        assert_eq!(summarize(&[]), "No objects detected");
    }

    #[test]
    fn threshold_is_strict_and_closed_handoff_ends_the_run() {
        let handoff = Arc::new(FrameHandoff::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let capture = Arc::new(Capture::default());
        registry.register(capture.clone());
        let backend = StubBackend::new()
            .with_fixed_predictions(vec![prediction(0.5), prediction(0.51), prediction(0.2)]);
        let pipeline = InferencePipeline::new(
            Box::new(backend),
            handoff.clone(),
            registry,
            PipelineSettings::default(),
            CancelToken::new(),
        );

        let worker = thread::spawn(move || pipeline.run());
        handoff.put(jpeg(64, 48));
        while handoff.taken_sequence() < 1 {
            thread::sleep(Duration::from_millis(5));
        }
        handoff.put(b"corrupt".to_vec());
        while handoff.taken_sequence() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        handoff.close();

        let exit = worker.join().expect("pipeline thread");
        assert_eq!(exit.reason, ExitReason::Closed);
        assert_eq!(exit.frames_processed, 1);
        assert_eq!(exit.frames_skipped, 1);
        assert_eq!(exit.recorder.samples().len(), 1);

        let frames = capture.frames.lock().expect("capture lock");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].source_sequence, 1);
        assert_eq!(frames[0].detections.len(), 1);
        assert_eq!(frames[0].detections[0].score, 0.51);
        assert_eq!(&frames[0].jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn cancelled_pipeline_exits_before_processing() {
        let handoff = Arc::new(FrameHandoff::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let pipeline = InferencePipeline::new(
            Box::new(StubBackend::new()),
            handoff.clone(),
            Arc::new(SubscriberRegistry::new()),
            PipelineSettings::default(),
            cancel,
        );
        handoff.put(jpeg(32, 32));

        let exit = pipeline.run();
        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(exit.frames_processed, 0);
    }

    #[test]
    fn frame_cancelled_mid_flight_is_not_counted_or_recorded() {
        let handoff = Arc::new(FrameHandoff::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let capture = Arc::new(Capture::default());
        registry.register(capture.clone());
        let cancel = CancelToken::new();
        let pipeline = InferencePipeline::new(
            Box::new(CancelsDuringDetect(cancel.clone())),
            handoff.clone(),
            registry,
            PipelineSettings::default(),
            cancel,
        );
        handoff.put(jpeg(32, 32));

        let exit = pipeline.run();
        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(exit.frames_processed, 0);
        assert!(exit.recorder.samples().is_empty());
        assert!(capture.frames.lock().expect("capture lock").is_empty());
    }

    #[test]
    fn drop_hook_sees_subscribers_removed_by_a_broadcast() {
        let handoff = Arc::new(FrameHandoff::new());
        let registry = Arc::new(SubscriberRegistry::new());
        registry.register(Arc::new(Dead));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let seen = dropped.clone();
        let pipeline = InferencePipeline::new(
            Box::new(StubBackend::new()),
            handoff.clone(),
            registry.clone(),
            PipelineSettings::default(),
            CancelToken::new(),
        )
        .on_subscribers_dropped(move |ids| {
            seen.lock().expect("hook lock").extend_from_slice(ids);
        });

        let worker = thread::spawn(move || pipeline.run());
        for sequence in 1..=2 {
            handoff.put(jpeg(32, 32));
            while handoff.taken_sequence() < sequence {
                thread::sleep(Duration::from_millis(5));
            }
        }
        handoff.close();
        let exit = worker.join().expect("pipeline thread");

        assert_eq!(exit.frames_processed, 2);
        assert!(registry.is_empty());
        assert_eq!(*dropped.lock().expect("hook lock"), vec![7]);
    }
}
