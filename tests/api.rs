use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{anyhow, Result};

use inference_stream::api::{ApiConfig, ApiServer};
use inference_stream::{ControllerSettings, Resolution, SourceSettings, StreamController};

fn request(addr: SocketAddr, method: &str, path: &str) -> Result<(u16, serde_json::Value)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("malformed response: {raw}"))?;
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .ok_or_else(|| anyhow!("missing body: {raw}"))?;
    Ok((status, serde_json::from_str(body)?))
}

fn small_stub_controller() -> std::sync::Arc<StreamController> {
    StreamController::new(ControllerSettings {
        source: SourceSettings {
            resolution: Resolution::new(160, 120),
            target_fps: 10,
            ..SourceSettings::default()
        },
        metrics_dir: None,
        chart: false,
        ..ControllerSettings::default()
    })
}

#[test]
fn control_endpoints_drive_the_lifecycle() -> Result<()> {
    let controller = small_stub_controller();
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        controller.clone(),
    )
    .spawn()?;
    let addr = handle.addr;

    let (status, body) = request(addr, "GET", "/health")?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(addr, "POST", "/start")?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "started");
    assert_eq!(body["run_id"], 1);

    let (_, body) = request(addr, "POST", "/start")?;
    assert_eq!(body["status"], "already_running");

    let (_, body) = request(addr, "GET", "/status")?;
    assert_eq!(body["state"], "running");
    assert_eq!(body["idle_policy"], "stop-when-empty");

    let (_, body) = request(addr, "POST", "/stop")?;
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["run"]["run_id"], 1);
    assert_eq!(body["run"]["exit"]["kind"], "closed");

    let (_, body) = request(addr, "POST", "/stop")?;
    assert_eq!(body["status"], "already_idle");
    assert!(!controller.is_running());

    handle.stop()
}

#[test]
fn failed_start_is_reported_as_a_server_error() -> Result<()> {
    let controller = StreamController::new(ControllerSettings {
        source: SourceSettings {
            url: "/dev/does-not-exist".to_string(),
            ..SourceSettings::default()
        },
        metrics_dir: None,
        ..ControllerSettings::default()
    });
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        controller.clone(),
    )
    .spawn()?;

    let (status, body) = request(handle.addr, "POST", "/start")?;
    assert_eq!(status, 500);
    assert!(body["error"].as_str().is_some_and(|msg| !msg.is_empty()));
    assert!(!controller.is_running());

    handle.stop()
}
