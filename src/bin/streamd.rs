//! streamd - live detection stream daemon
//!
//! This daemon:
//! 1. Loads configuration (file, then STREAMD_* environment)
//! 2. Serves the control API and WebSocket subscribers
//! 3. Starts a run on POST /start, stops it on POST /stop or when the last
//!    subscriber leaves
//! 4. On Ctrl-C stops any run, flushes its metrics, and exits

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Instant;

use inference_stream::api::ApiServer;
use inference_stream::config::StreamdConfig;
use inference_stream::detect::BackendRegistry;
use inference_stream::pipeline::{preprocess::blank_input, warm_up};
use inference_stream::StreamController;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "STREAMD_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stream daemon (default).
    Serve,
    /// Load the configured backend, print its input, and run one inference.
    CheckBackend,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = StreamdConfig::load_from(args.config.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg),
        Command::CheckBackend => check_backend(cfg),
    }
}

fn serve(cfg: StreamdConfig) -> Result<()> {
    let controller = StreamController::new(cfg.controller_settings());
    let api_handle = ApiServer::new(cfg.api_config(), controller.clone()).spawn()?;
    log::info!(
        "streamd running: source {} ({} @ {} fps), backend {}, idle policy {:?}",
        cfg.source.url,
        cfg.source.resolution,
        cfg.source.target_fps,
        cfg.backend.name,
        cfg.idle_policy
    );
    log::info!("subscribe at ws://{}/ws", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("streamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping stream...");
    api_handle.stop()?;
    if let Some(run) = controller.last_run() {
        log::info!(
            "last run {}: {} frames, {:?}",
            run.run_id,
            run.frames_processed,
            run.exit
        );
    }
    Ok(())
}

fn check_backend(cfg: StreamdConfig) -> Result<()> {
    let registry = BackendRegistry::with_builtin();
    if !registry.contains(&cfg.backend.name) {
        return Err(anyhow!(
            "unknown backend '{}' (available: {})",
            cfg.backend.name,
            registry.list().join(", ")
        ));
    }
    let mut backend = registry.build(&cfg.backend)?;
    let spec = backend.input_spec();
    println!("backend: {}", backend.name());
    println!(
        "input: {}x{} {:?} {:?} {:?}",
        spec.width, spec.height, spec.layout, spec.channel_order, spec.normalization
    );

    let started = Instant::now();
    warm_up(backend.as_mut())?;
    println!("warm-up: {:.1} ms", started.elapsed().as_secs_f64() * 1000.0);

    let input = blank_input(&spec);
    let started = Instant::now();
    let predictions = backend.detect(&input)?;
    println!(
        "inference: {:.1} ms, {} prediction(s) on a blank frame",
        started.elapsed().as_secs_f64() * 1000.0,
        predictions.len()
    );
    Ok(())
}
