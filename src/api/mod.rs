//! HTTP and WebSocket surface for the stream controller.
//!
//! The server runs on its own tokio runtime inside a std thread so the rest
//! of the crate stays synchronous. Every controller call that may block
//! (start, stop, disconnect) is pushed onto the blocking pool.

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::oneshot;

use crate::lifecycle::{StartOutcome, StopOutcome, StreamController};
use ws::SessionConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct ApiConfig {
    pub addr: String,
    /// Longest a broadcast waits on one slow WebSocket before dropping it.
    pub send_timeout: Duration,
    /// Frames buffered per connection.
    pub queue_depth: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            send_timeout: Duration::from_millis(1000),
            queue_depth: 4,
        }
    }
}

pub struct ApiHandle {
    pub addr: SocketAddr,
    controller: Arc<StreamController>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop any run, drop all subscribers, then shut the server down.
    pub fn stop(mut self) -> Result<()> {
        self.controller.shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    controller: Arc<StreamController>,
    send_timeout: Duration,
    queue_depth: usize,
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<StreamController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<StreamController>) -> Self {
        Self { cfg, controller }
    }

    /// Bind and serve in the background.
    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("streamd-api")
            .build()
            .context("build api runtime")?;
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(configured_addr))
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }

        let state = AppState {
            controller: self.controller.clone(),
            send_timeout: self.cfg.send_timeout,
            queue_depth: self.cfg.queue_depth,
        };
        let app = router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = std::thread::Builder::new()
            .name("streamd-api".to_string())
            .spawn(move || {
                let served = runtime.block_on(async move {
                    axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.await;
                    })
                    .await
                });
                if let Err(err) = served {
                    log::error!("stream api stopped: {}", err);
                }
                runtime.shutdown_timeout(Duration::from_secs(1));
            })
            .context("spawn api thread")?;

        log::info!("stream api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            controller: self.controller,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_endpoint))
        .route("/start", post(start_endpoint))
        .route("/stop", post(stop_endpoint))
        .route("/status", get(status_endpoint))
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .with_state(state)
}

async fn ws_endpoint(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let config = SessionConfig {
        send_timeout: state.send_timeout,
        queue_depth: state.queue_depth,
    };
    log::info!("ws {} connected", peer);
    upgrade.on_upgrade(move |socket| {
        ws::session(socket, peer.to_string(), state.controller, config)
    })
}

async fn start_endpoint(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.start()).await {
        Ok(Ok(StartOutcome::Started { run_id })) => {
            Json(json!({ "status": "started", "run_id": run_id })).into_response()
        }
        Ok(Ok(StartOutcome::AlreadyRunning)) => {
            let run_id = state.controller.status().run_id;
            Json(json!({ "status": "already_running", "run_id": run_id })).into_response()
        }
        Ok(Err(err)) => error_response(format!("{:#}", err)),
        Err(err) => error_response(format!("start task failed: {}", err)),
    }
}

async fn stop_endpoint(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.stop()).await {
        Ok(StopOutcome::Stopped(summary)) => {
            Json(json!({ "status": "stopped", "run": summary })).into_response()
        }
        Ok(StopOutcome::AlreadyIdle) => Json(json!({ "status": "already_idle" })).into_response(),
        Err(err) => error_response(format!("stop task failed: {}", err)),
    }
}

async fn status_endpoint(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.status()).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(format!("status task failed: {}", err)),
    }
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}
