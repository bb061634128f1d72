use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use inference_stream::config::StreamdConfig;
use inference_stream::{IdlePolicy, PixelFormat, Resolution};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STREAMD_CONFIG",
        "STREAMD_API_ADDR",
        "STREAMD_SOURCE_URL",
        "STREAMD_BACKEND",
        "STREAMD_MODEL_PATH",
        "STREAMD_LABELS_PATH",
        "STREAMD_METRICS_DIR",
        "STREAMD_IDLE_POLICY",
        "STREAMD_GRACE_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamdConfig::load().expect("load defaults");

    assert_eq!(cfg.api_addr, "127.0.0.1:8000");
    assert_eq!(cfg.source.url, "stub://camera");
    assert_eq!(cfg.source.resolution, Resolution::new(1920, 1080));
    assert_eq!(cfg.source.pixel_format, PixelFormat::Mjpeg);
    assert_eq!(cfg.source.target_fps, 30);
    assert_eq!(cfg.backend.name, "stub");
    assert_eq!(cfg.pipeline.score_threshold, 0.5);
    assert_eq!(cfg.pipeline.jpeg_quality, 80);
    assert_eq!(cfg.grace_period, Duration::from_millis(100));
    assert_eq!(cfg.idle_policy, IdlePolicy::StopWhenEmpty);
    assert_eq!(cfg.send_timeout, Duration::from_millis(1000));
    assert_eq!(cfg.queue_depth, 4);
    assert_eq!(cfg.metrics_dir, Some(PathBuf::from("metrics")));
    assert!(cfg.chart);
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
[api]
addr = "127.0.0.1:9100"
queue_depth = 8

[source]
url = "/dev/video2"
width = 1280
height = 720
pixel_format = "yuv420"
target_fps = 15

[backend]
name = "ssd"
model_path = "models/ssd.onnx"
input_size = 300

[pipeline]
score_threshold = 0.6

[lifecycle]
idle_policy = "keep-running"

[metrics]
dir = "/tmp/streamd-metrics"
chart = false
"#,
    );

    std::env::set_var("STREAMD_CONFIG", file.path());
    std::env::set_var("STREAMD_BACKEND", "YOLO");
    std::env::set_var("STREAMD_GRACE_MS", "250");

    let cfg = StreamdConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.queue_depth, 8);
    assert_eq!(cfg.source.url, "/dev/video2");
    assert_eq!(cfg.source.resolution, Resolution::new(1280, 720));
    assert_eq!(cfg.source.pixel_format, PixelFormat::Yuv420);
    assert_eq!(cfg.source.target_fps, 15);
    assert_eq!(cfg.backend.name, "yolo");
    assert_eq!(cfg.backend.model_path, Some(PathBuf::from("models/ssd.onnx")));
    assert_eq!(cfg.backend.input_size, Some(300));
    assert_eq!(cfg.pipeline.score_threshold, 0.6);
    assert_eq!(cfg.pipeline.jpeg_quality, 80);
    assert_eq!(cfg.idle_policy, IdlePolicy::KeepRunning);
    assert_eq!(cfg.grace_period, Duration::from_millis(250));
    assert_eq!(cfg.metrics_dir, Some(PathBuf::from("/tmp/streamd-metrics")));
    assert!(!cfg.chart);

    let settings = cfg.controller_settings();
    assert_eq!(settings.backend.name, "yolo");
    assert_eq!(settings.grace_period, Duration::from_millis(250));
    assert_eq!(cfg.api_config().addr, "127.0.0.1:9100");

    clear_env();
}

#[test]
fn explicit_json_path_wins_over_env_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let from_env = temp_config(".toml", "[source]\nurl = \"stub://env\"\n");
    let explicit = temp_config(
        ".json",
        r#"{ "source": { "url": "stub://explicit" }, "metrics": { "enabled": false } }"#,
    );
    std::env::set_var("STREAMD_CONFIG", from_env.path());

    let cfg = StreamdConfig::load_from(Some(explicit.path())).expect("load json");
    assert_eq!(cfg.source.url, "stub://explicit");
    assert_eq!(cfg.metrics_dir, None);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("STREAMD_GRACE_MS", "soon");
    let err = StreamdConfig::load().unwrap_err();
    assert!(err.to_string().contains("STREAMD_GRACE_MS"));
    clear_env();

    std::env::set_var("STREAMD_IDLE_POLICY", "sometimes");
    assert!(StreamdConfig::load().is_err());
    clear_env();

    let file = temp_config(".toml", "[pipeline]\nscore_threshold = 1.5\n");
    let err = StreamdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("score threshold"));

    let file = temp_config(".toml", "[source]\ntarget_fps = 0\n");
    assert!(StreamdConfig::load_from(Some(file.path())).is_err());

    let file = temp_config(".toml", "[camera]\nurl = \"x\"\n");
    let err = StreamdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
