//! Stream lifecycle controller.
//!
//! `Idle --start--> Running --stop--> Idle`. The controller owns the frame
//! source for exactly the duration of `Running`, runs the inference pipeline
//! on a dedicated thread, and flushes run metrics on every transition back
//! to `Idle`, whatever caused it (explicit stop, last subscriber leaving,
//! backend failure, process shutdown).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::broadcast::{Subscriber, SubscriberId, SubscriberRegistry};
use crate::detect::{BackendRegistry, BackendSettings};
use crate::frame::FrameHandoff;
use crate::ingest::{open_source, FrameSource, SourceSettings};
use crate::metrics::{self, ChartRenderer, MetricsRecorder, NullRenderer, PlottersRenderer};
use crate::pipeline::{
    self, CancelToken, ExitReason, InferencePipeline, PipelineExit, PipelineSettings,
};

/// Opens the frame source for a run.
pub type SourceFactory = Arc<dyn Fn(&SourceSettings) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// What happens when the last subscriber disconnects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicy {
    #[default]
    StopWhenEmpty,
    KeepRunning,
}

impl FromStr for IdlePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stop-when-empty" | "stop_when_empty" | "stop" => Ok(Self::StopWhenEmpty),
            "keep-running" | "keep_running" | "keep" => Ok(Self::KeepRunning),
            other => Err(anyhow!("unknown idle policy '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerSettings {
    pub source: SourceSettings,
    pub backend: BackendSettings,
    pub pipeline: PipelineSettings,
    /// How long `stop` waits for the pipeline before cancelling it.
    pub grace_period: Duration,
    pub idle_policy: IdlePolicy,
    /// Root for run metrics; `None` discards them.
    pub metrics_dir: Option<PathBuf>,
    pub chart: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            backend: BackendSettings::default(),
            pipeline: PipelineSettings::default(),
            grace_period: Duration::from_millis(100),
            idle_policy: IdlePolicy::StopWhenEmpty,
            metrics_dir: Some(PathBuf::from("metrics")),
            chart: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { run_id: u64 },
    AlreadyRunning,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StopOutcome {
    Stopped(RunSummary),
    AlreadyIdle,
}

/// Result of one completed run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: u64,
    pub backend: String,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub fps_samples: usize,
    pub exit: ExitReason,
    pub duration_ms: u64,
    /// Metrics directory, when metrics were written.
    pub output_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub state: PipelineState,
    pub run_id: Option<u64>,
    pub subscribers: usize,
    pub frames_processed: u64,
    pub idle_policy: IdlePolicy,
    pub last_run: Option<RunSummary>,
}

struct ActiveRun {
    run_id: u64,
    backend: &'static str,
    source: Box<dyn FrameSource>,
    handoff: Arc<FrameHandoff>,
    cancel: CancelToken,
    processed: Arc<AtomicU64>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<PipelineExit>,
    started_at: Instant,
}

struct Inner {
    active: Option<ActiveRun>,
    /// Run being torn down; still holds the source.
    stopping: Option<(u64, Arc<AtomicU64>)>,
    next_run_id: u64,
    last_run: Option<RunSummary>,
}

/// Why a reaper thread was spawned for a run.
#[derive(Clone, Copy, Debug)]
enum Reap {
    BackendFailed,
    LastSubscriberDropped,
}

pub struct StreamController {
    settings: ControllerSettings,
    backends: BackendRegistry,
    sources: SourceFactory,
    renderer: Arc<dyn ChartRenderer>,
    registry: Arc<SubscriberRegistry>,
    /// Serializes start and stop. `inner` is only held briefly.
    transition: Mutex<()>,
    inner: Mutex<Inner>,
    this: Weak<StreamController>,
}

impl StreamController {
    /// Controller with the built-in backends and sources.
    pub fn new(settings: ControllerSettings) -> Arc<Self> {
        let renderer: Arc<dyn ChartRenderer> = if settings.chart {
            Arc::new(PlottersRenderer::default())
        } else {
            Arc::new(NullRenderer)
        };
        Self::with_parts(
            settings,
            BackendRegistry::with_builtin(),
            Arc::new(|settings: &SourceSettings| open_source(settings)),
            renderer,
        )
    }

    pub fn with_parts(
        settings: ControllerSettings,
        backends: BackendRegistry,
        sources: SourceFactory,
        renderer: Arc<dyn ChartRenderer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            backends,
            sources,
            renderer,
            registry: Arc::new(SubscriberRegistry::new()),
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                active: None,
                stopping: None,
                next_run_id: 1,
                last_run: None,
            }),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// True while a run holds the source, including one being stopped.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.active.is_some() || inner.stopping.is_some()
    }

    /// Start a run. Idempotent: a running controller reports `AlreadyRunning`.
    ///
    /// On error nothing is left acquired and the controller stays idle.
    pub fn start(&self) -> Result<StartOutcome> {
        let _transition = lock_unpoisoned(&self.transition);
        let run_id = {
            let mut inner = self.lock();
            if inner.active.is_some() {
                log::info!("start: already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            let run_id = inner.next_run_id;
            inner.next_run_id += 1;
            run_id
        };

        match self.launch(run_id) {
            Ok(run) => {
                log::info!(
                    "start: run {} running ({} -> {})",
                    run_id,
                    run.source.name(),
                    run.backend
                );
                self.lock().active = Some(run);
                Ok(StartOutcome::Started { run_id })
            }
            Err(err) => {
                log::error!("start: run {} failed: {:#}", run_id, err);
                Err(err)
            }
        }
    }

    fn launch(&self, run_id: u64) -> Result<ActiveRun> {
        let mut backend = self
            .backends
            .build(&self.settings.backend)
            .context("build detector backend")?;
        pipeline::warm_up(backend.as_mut()).context("warm up detector backend")?;
        let backend_name = backend.name();

        let source_settings = &self.settings.source;
        let mut source = (self.sources)(source_settings).context("open frame source")?;
        source
            .configure(source_settings.resolution, source_settings.pixel_format)
            .with_context(|| format!("configure {}", source.name()))?;

        let handoff = Arc::new(FrameHandoff::new());
        source
            .start_encoding(handoff.clone())
            .with_context(|| format!("start encoding on {}", source.name()))?;

        let cancel = CancelToken::new();
        let processed = Arc::new(AtomicU64::new(0));
        let mut pipeline = InferencePipeline::new(
            backend,
            handoff.clone(),
            self.registry.clone(),
            self.settings.pipeline,
            cancel.clone(),
        )
        .with_counter(processed.clone());
        if self.settings.idle_policy == IdlePolicy::StopWhenEmpty {
            let this = self.this.clone();
            let registry = self.registry.clone();
            pipeline = pipeline.on_subscribers_dropped(move |_removed| {
                if registry.is_empty() {
                    spawn_reaper(this.clone(), run_id, Reap::LastSubscriberDropped);
                }
            });
        }

        let (done_tx, done) = mpsc::channel();
        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name(format!("pipeline-run{}", run_id))
            .spawn(move || {
                let exit = pipeline.run();
                let _ = done_tx.send(());
                if let ExitReason::Failed(_) = exit.reason {
                    spawn_reaper(this, run_id, Reap::BackendFailed);
                }
                exit
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                handoff.close();
                if let Err(stop_err) = source.stop_encoding() {
                    log::warn!("start: releasing {} failed: {:#}", source.name(), stop_err);
                }
                return Err(anyhow!("spawn pipeline thread: {}", err));
            }
        };

        Ok(ActiveRun {
            run_id,
            backend: backend_name,
            source,
            handoff,
            cancel,
            processed,
            done,
            handle,
            started_at: Instant::now(),
        })
    }

    /// Stop the current run. Idempotent: an idle controller reports
    /// `AlreadyIdle`.
    pub fn stop(&self) -> StopOutcome {
        self.stop_if(|_| true)
    }

    /// Stop only if `run_id` is still the active run.
    pub fn stop_run(&self, run_id: u64) -> StopOutcome {
        self.stop_if(|run| {
            let current = run.run_id == run_id;
            if !current {
                log::debug!("stop_run: run {} is no longer active", run_id);
            }
            current
        })
    }

    /// Apply the idle policy: stop when the registry is empty, checked
    /// under the transition lock. `run_id` pins the stop to one run.
    fn stop_when_empty(&self, run_id: Option<u64>) -> StopOutcome {
        if self.settings.idle_policy != IdlePolicy::StopWhenEmpty {
            return StopOutcome::AlreadyIdle;
        }
        let outcome = self.stop_if(|run| {
            run_id.map_or(true, |id| id == run.run_id) && self.registry.is_empty()
        });
        if let StopOutcome::Stopped(summary) = &outcome {
            log::info!("last subscriber left, run {} stopped", summary.run_id);
        }
        outcome
    }

    /// Take the active run if `accept` agrees, then tear it down without
    /// holding `inner`, so `status` keeps answering during the grace period.
    fn stop_if(&self, accept: impl FnOnce(&ActiveRun) -> bool) -> StopOutcome {
        let _transition = lock_unpoisoned(&self.transition);
        let run = {
            let mut inner = self.lock();
            if !inner.active.as_ref().map_or(false, accept) {
                return StopOutcome::AlreadyIdle;
            }
            let Some(run) = inner.active.take() else {
                return StopOutcome::AlreadyIdle;
            };
            inner.stopping = Some((run.run_id, run.processed.clone()));
            run
        };
        let summary = self.finish(run);
        let mut inner = self.lock();
        inner.stopping = None;
        inner.last_run = Some(summary.clone());
        StopOutcome::Stopped(summary)
    }

    fn finish(&self, run: ActiveRun) -> RunSummary {
        let ActiveRun {
            run_id,
            backend,
            mut source,
            handoff,
            cancel,
            processed,
            done,
            handle,
            started_at,
        } = run;

        handoff.close();
        match done.recv_timeout(self.settings.grace_period) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::info!(
                    "stop: run {} still busy after {:?}, cancelling",
                    run_id,
                    self.settings.grace_period
                );
                cancel.cancel();
            }
        }

        let exit = handle.join().unwrap_or_else(|_| PipelineExit {
            recorder: MetricsRecorder::new(),
            frames_processed: processed.load(Ordering::SeqCst),
            frames_skipped: 0,
            reason: ExitReason::Failed("pipeline thread panicked".to_string()),
        });

        if let Err(err) = source.stop_encoding() {
            log::error!("stop: releasing {} failed: {:#}", source.name(), err);
        }

        let PipelineExit {
            mut recorder,
            frames_processed,
            frames_skipped,
            reason,
        } = exit;
        let fps_samples = recorder.fps_samples().len();
        let output_dir = self.settings.metrics_dir.as_ref().and_then(|root| {
            let dir = metrics::run_dir(root, backend, run_id);
            match recorder.flush(&dir, self.renderer.as_ref(), backend) {
                Ok(report) => Some(report.dir),
                Err(err) => {
                    log::error!("stop: metrics flush for run {} failed: {:#}", run_id, err);
                    None
                }
            }
        });

        let summary = RunSummary {
            run_id,
            backend: backend.to_string(),
            frames_processed,
            frames_skipped,
            fps_samples,
            exit: reason,
            duration_ms: started_at.elapsed().as_millis() as u64,
            output_dir,
        };
        log::info!(
            "stop: run {} idle ({:?}, {} frames, {} skipped)",
            run_id,
            summary.exit,
            summary.frames_processed,
            summary.frames_skipped
        );
        summary
    }

    /// Register a subscriber.
    pub fn connect(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        self.registry.register(subscriber)
    }

    /// Unregister a subscriber and apply the idle policy. Unknown ids are
    /// a no-op.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let removed = self.registry.unregister(id);
        if removed {
            self.stop_when_empty(None);
        }
        removed
    }

    pub fn status(&self) -> ControllerStatus {
        let inner = self.lock();
        let live = inner
            .active
            .as_ref()
            .map(|run| (run.run_id, &run.processed))
            .or_else(|| inner.stopping.as_ref().map(|(id, processed)| (*id, processed)));
        let (state, run_id, frames_processed) = match live {
            Some((run_id, processed)) => (
                PipelineState::Running,
                Some(run_id),
                processed.load(Ordering::SeqCst),
            ),
            None => (
                PipelineState::Idle,
                None,
                inner.last_run.as_ref().map_or(0, |run| run.frames_processed),
            ),
        };
        ControllerStatus {
            state,
            run_id,
            subscribers: self.registry.len(),
            frames_processed,
            idle_policy: self.settings.idle_policy,
            last_run: inner.last_run.clone(),
        }
    }

    pub fn last_run(&self) -> Option<RunSummary> {
        self.lock().last_run.clone()
    }

    /// Stop any run and drop every subscriber.
    pub fn shutdown(&self) {
        self.stop();
        let dropped = self.registry.clear();
        if dropped > 0 {
            log::info!("shutdown: dropped {} subscriber(s)", dropped);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_unpoisoned(&self.inner)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(run) = inner.active.take() {
            let summary = self.finish(run);
            log::info!("controller dropped, run {} stopped", summary.run_id);
        }
    }
}

/// Stop `run_id` from a fresh thread. The pipeline thread cannot stop its
/// own run because `stop` joins it.
fn spawn_reaper(controller: Weak<StreamController>, run_id: u64, cause: Reap) {
    let Some(controller) = controller.upgrade() else {
        return;
    };
    let spawned = thread::Builder::new()
        .name(format!("reaper-run{}", run_id))
        .spawn(move || {
            log::debug!("reaper: run {} ({:?})", run_id, cause);
            match cause {
                Reap::BackendFailed => controller.stop_run(run_id),
                Reap::LastSubscriberDropped => controller.stop_when_empty(Some(run_id)),
            };
        });
    if let Err(err) = spawned {
        log::error!("could not spawn reaper for run {}: {}", run_id, err);
    }
}
