//! Per-run performance metrics.
//!
//! - `MetricsRecorder`: per-frame latency samples plus a rolling one-second
//!   FPS window. Owned by the pipeline thread during a run.
//! - `flush`: writes two CSV files and a chart into a run-scoped directory.

pub mod chart;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

pub use chart::{ChartRenderer, ChartSeries, NullRenderer, PlottersRenderer};

use crate::pipeline::StageTimings;

pub const INFERENCE_CSV: &str = "inference_metrics.csv";
pub const FPS_CSV: &str = "fps_metrics.csv";
pub const CHART_PNG: &str = "performance_metrics.png";

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MetricSample {
    pub frame_index: u64,
    pub inference_latency_ms: f64,
    pub total_latency_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FpsSample {
    pub second_index: u64,
    pub fps: f64,
}

/// Files produced by `MetricsRecorder::flush`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlushReport {
    pub dir: PathBuf,
    pub inference_rows: usize,
    pub fps_rows: usize,
    /// `None` when the chart was skipped or failed.
    pub chart: Option<PathBuf>,
}

#[derive(Debug)]
pub struct MetricsRecorder {
    samples: Vec<MetricSample>,
    fps: Vec<FpsSample>,
    window_start: Instant,
    window_frames: u32,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Recorder whose first FPS window opens at `start`.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            samples: Vec::new(),
            fps: Vec::new(),
            window_start: start,
            window_frames: 0,
        }
    }

    /// Clear all samples and restart the FPS window now.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record(&mut self, timings: &StageTimings) {
        self.record_at(timings, Instant::now());
    }

    /// Record one processed frame observed at `now`.
    pub fn record_at(&mut self, timings: &StageTimings, now: Instant) {
        self.samples.push(MetricSample {
            frame_index: self.samples.len() as u64,
            inference_latency_ms: timings.inference_ms,
            total_latency_ms: timings.total_ms,
        });

        self.window_frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= FPS_WINDOW {
            self.fps.push(FpsSample {
                second_index: self.fps.len() as u64,
                fps: self.window_frames as f64 / elapsed.as_secs_f64(),
            });
            self.window_frames = 0;
            self.window_start = now;
        }
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn fps_samples(&self) -> &[FpsSample] {
        &self.fps
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Write CSVs and the chart into `dir` (created if missing), then clear.
    ///
    /// A chart failure is logged and reported as `chart: None`; CSV failures
    /// are errors.
    pub fn flush(
        &mut self,
        dir: &Path,
        renderer: &dyn ChartRenderer,
        title: &str,
    ) -> Result<FlushReport> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create metrics dir {}", dir.display()))?;

        let inference_path = dir.join(INFERENCE_CSV);
        self.write_inference_csv(&inference_path)?;
        let fps_path = dir.join(FPS_CSV);
        self.write_fps_csv(&fps_path)?;

        let chart_path = dir.join(CHART_PNG);
        let chart = match renderer.render_line_chart(&self.chart_series(title), &chart_path) {
            Ok(()) if chart_path.exists() => Some(chart_path),
            Ok(()) => None,
            Err(err) => {
                log::warn!("metrics chart skipped: {:#}", err);
                None
            }
        };

        let report = FlushReport {
            dir: dir.to_path_buf(),
            inference_rows: self.samples.len(),
            fps_rows: self.fps.len(),
            chart,
        };
        log::info!(
            "metrics flushed to {} ({} frames, {} fps samples)",
            dir.display(),
            report.inference_rows,
            report.fps_rows
        );
        self.samples.clear();
        self.fps.clear();
        Ok(report)
    }

    fn write_inference_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("create {}", path.display()))?;
        wtr.write_record(["frame_index", "inference_latency_ms", "total_latency_ms"])?;
        for sample in &self.samples {
            wtr.write_record(&[
                sample.frame_index.to_string(),
                format!("{:.3}", sample.inference_latency_ms),
                format!("{:.3}", sample.total_latency_ms),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_fps_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("create {}", path.display()))?;
        wtr.write_record(["second_index", "fps"])?;
        for sample in &self.fps {
            wtr.write_record(&[sample.second_index.to_string(), format!("{:.3}", sample.fps)])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn chart_series(&self, title: &str) -> Vec<ChartSeries> {
        vec![
            ChartSeries {
                title: format!("Inference Latency per Frame ({title})"),
                x_label: "Frame Number".to_string(),
                y_label: "Latency (ms)".to_string(),
                points: self
                    .samples
                    .iter()
                    .map(|s| (s.frame_index as f64, s.inference_latency_ms))
                    .collect(),
            },
            ChartSeries {
                title: format!("FPS Over Time ({title})"),
                x_label: "Time (seconds)".to_string(),
                y_label: "Frames per Second".to_string(),
                points: self
                    .fps
                    .iter()
                    .map(|s| (s.second_index as f64, s.fps))
                    .collect(),
            },
        ]
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// `{metrics_dir}/{backend}/{timestamp}-run{run_id}`
pub fn run_dir(metrics_dir: &Path, backend: &str, run_id: u64) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
    metrics_dir
        .join(backend)
        .join(format!("{}-run{}", stamp, run_id))
}
