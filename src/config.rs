use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::detect::BackendSettings;
use crate::ingest::{PixelFormat, Resolution, SourceSettings};
use crate::lifecycle::{ControllerSettings, IdlePolicy};
use crate::pipeline::PipelineSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_SEND_TIMEOUT_MS: u64 = 1000;
const DEFAULT_QUEUE_DEPTH: usize = 4;
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_GRACE_MS: u64 = 100;
const DEFAULT_METRICS_DIR: &str = "metrics";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamdConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    backend: Option<BackendConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    lifecycle: Option<LifecycleConfigFile>,
    metrics: Option<MetricsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    send_timeout_ms: Option<u64>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<String>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BackendConfigFile {
    name: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    quantized: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    score_threshold: Option<f32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LifecycleConfigFile {
    grace_ms: Option<u64>,
    idle_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MetricsConfigFile {
    dir: Option<PathBuf>,
    enabled: Option<bool>,
    chart: Option<bool>,
}

/// Daemon configuration: file, then `STREAMD_*` environment, then checks.
#[derive(Debug, Clone)]
pub struct StreamdConfig {
    pub api_addr: String,
    pub send_timeout: Duration,
    pub queue_depth: usize,
    pub source: SourceSettings,
    pub backend: BackendSettings,
    pub pipeline: PipelineSettings,
    pub grace_period: Duration,
    pub idle_policy: IdlePolicy,
    /// `None` when metrics are disabled.
    pub metrics_dir: Option<PathBuf>,
    pub chart: bool,
}

impl StreamdConfig {
    /// Load from `STREAMD_CONFIG` when set, defaults otherwise.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit file (e.g. `--config`), falling back to
    /// `STREAMD_CONFIG` when `path` is `None`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => env_value("STREAMD_CONFIG").map(PathBuf::from),
        };
        let file_cfg = match path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => StreamdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamdConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let backend = file.backend.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let lifecycle = file.lifecycle.unwrap_or_default();
        let metrics = file.metrics.unwrap_or_default();

        let pixel_format = match source.pixel_format.as_deref() {
            Some(format) => format.parse::<PixelFormat>()?,
            None => PixelFormat::default(),
        };
        let idle_policy = match lifecycle.idle_policy.as_deref() {
            Some(policy) => policy.parse::<IdlePolicy>()?,
            None => IdlePolicy::default(),
        };
        let metrics_dir = if metrics.enabled.unwrap_or(true) {
            Some(
                metrics
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_METRICS_DIR)),
            )
        } else {
            None
        };

        Ok(Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            send_timeout: Duration::from_millis(
                api.send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
            ),
            queue_depth: api.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            source: SourceSettings {
                url: source
                    .url
                    .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                resolution: Resolution::new(
                    source.width.unwrap_or(DEFAULT_WIDTH),
                    source.height.unwrap_or(DEFAULT_HEIGHT),
                ),
                pixel_format,
                target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            },
            backend: BackendSettings {
                name: backend.name.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: backend.model_path,
                labels_path: backend.labels_path,
                input_size: backend.input_size,
                quantized: backend.quantized.unwrap_or(true),
            },
            pipeline: PipelineSettings {
                score_threshold: pipeline.score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
                jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            grace_period: Duration::from_millis(lifecycle.grace_ms.unwrap_or(DEFAULT_GRACE_MS)),
            idle_policy,
            metrics_dir,
            chart: metrics.chart.unwrap_or(true),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("STREAMD_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_value("STREAMD_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(name) = env_value("STREAMD_BACKEND") {
            self.backend.name = name;
        }
        if let Some(path) = env_value("STREAMD_MODEL_PATH") {
            self.backend.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("STREAMD_LABELS_PATH") {
            self.backend.labels_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = env_value("STREAMD_METRICS_DIR") {
            self.metrics_dir = Some(PathBuf::from(dir));
        }
        if let Some(policy) = env_value("STREAMD_IDLE_POLICY") {
            self.idle_policy = policy
                .parse::<IdlePolicy>()
                .context("STREAMD_IDLE_POLICY must be stop-when-empty or keep-running")?;
        }
        if let Some(grace) = env_value("STREAMD_GRACE_MS") {
            let millis: u64 = grace.parse().map_err(|_| {
                anyhow!("STREAMD_GRACE_MS must be an integer number of milliseconds")
            })?;
            self.grace_period = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.backend.name = self.backend.name.trim().to_ascii_lowercase();
        if self.backend.name.is_empty() {
            return Err(anyhow!("backend name must not be empty"));
        }
        let threshold = self.pipeline.score_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "score threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        let Resolution { width, height } = self.source.resolution;
        if width == 0 || height == 0 {
            return Err(anyhow!("source resolution must be non-zero"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        if self.queue_depth == 0 {
            return Err(anyhow!("subscriber queue depth must be greater than zero"));
        }
        if self.send_timeout.is_zero() {
            return Err(anyhow!("subscriber send timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            source: self.source.clone(),
            backend: self.backend.clone(),
            pipeline: self.pipeline,
            grace_period: self.grace_period,
            idle_policy: self.idle_policy,
            metrics_dir: self.metrics_dir.clone(),
            chart: self.chart,
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            send_timeout: self.send_timeout,
            queue_depth: self.queue_depth,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<StreamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
