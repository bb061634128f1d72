use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use inference_stream::api::{ApiConfig, ApiServer};
use inference_stream::{
    ControllerSettings, PipelineState, Resolution, SourceSettings, StreamController,
};

fn stub_controller() -> Arc<StreamController> {
    StreamController::new(ControllerSettings {
        source: SourceSettings {
            resolution: Resolution::new(160, 120),
            target_fps: 15,
            ..SourceSettings::default()
        },
        metrics_dir: None,
        chart: false,
        ..ControllerSettings::default()
    })
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            bail!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[test]
fn websocket_client_receives_jpeg_frames_and_its_close_idles_the_run() -> Result<()> {
    let controller = stub_controller();
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        controller.clone(),
    )
    .spawn()?;
    let url = format!("ws://{}/ws", handle.addr);

    let client = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    client.block_on(async {
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        wait_for(|| controller.status().subscribers == 1).await?;
        controller.start()?;

        let mut received = 0;
        while received < 2 {
            let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .map_err(|_| anyhow!("no frame within 5s"))?;
            match next {
                Some(Ok(Message::Binary(jpeg))) => {
                    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
                    received += 1;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => bail!("websocket error: {}", err),
                None => bail!("server closed the socket"),
            }
        }

        socket.close(None).await?;
        wait_for(|| controller.status().state == PipelineState::Idle).await?;
        Ok::<_, anyhow::Error>(())
    })?;

    let status = controller.status();
    assert_eq!(status.subscribers, 0);
    assert!(status
        .last_run
        .is_some_and(|run| run.frames_processed >= 2));

    handle.stop()
}

#[test]
fn server_shutdown_ends_open_sessions() -> Result<()> {
    let controller = stub_controller();
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        controller.clone(),
    )
    .spawn()?;
    let url = format!("ws://{}/ws", handle.addr);

    let client = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut socket = client.block_on(async {
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        wait_for(|| controller.status().subscribers == 1).await?;
        Ok::<_, anyhow::Error>(socket)
    })?;

    controller.start()?;
    handle.stop()?;
    assert!(!controller.is_running());
    assert_eq!(controller.registry().len(), 0);

    client.block_on(async {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .map_err(|_| anyhow!("socket still open after shutdown"))?;
            match next {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}
