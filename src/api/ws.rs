//! WebSocket subscribers.
//!
//! Each connection gets a bounded channel. The pipeline side (`send`, called
//! from a broadcast thread) pushes into it with a timeout; the connection
//! task drains it into binary frames. Inbound messages only prove liveness.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::broadcast::{Subscriber, SubscriberId};
use crate::lifecycle::StreamController;
use crate::pipeline::AnnotatedFrame;

pub struct WsSubscriber {
    id: SubscriberId,
    peer: String,
    tx: mpsc::Sender<Bytes>,
    runtime: Handle,
    send_timeout: Duration,
}

impl WsSubscriber {
    pub fn new(
        id: SubscriberId,
        peer: String,
        tx: mpsc::Sender<Bytes>,
        runtime: Handle,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            tx,
            runtime,
            send_timeout,
        }
    }
}

impl Subscriber for WsSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    /// Must not be called from a runtime worker thread.
    fn send(&self, frame: &AnnotatedFrame) -> Result<()> {
        let payload = frame.jpeg.clone();
        let outcome = self
            .runtime
            .block_on(tokio::time::timeout(self.send_timeout, self.tx.send(payload)));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(anyhow!("connection closed")),
            Err(_) => Err(anyhow!("send timed out after {:?}", self.send_timeout)),
        }
    }

    fn describe(&self) -> String {
        format!("ws subscriber {} ({})", self.id, self.peer)
    }
}

pub(crate) struct SessionConfig {
    pub send_timeout: Duration,
    pub queue_depth: usize,
}

/// Drive one WebSocket connection until either side goes away.
pub(crate) async fn session(
    socket: WebSocket,
    peer: String,
    controller: Arc<StreamController>,
    config: SessionConfig,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(config.queue_depth.max(1));
    let id = controller.registry().next_id();
    let subscriber = WsSubscriber::new(
        id,
        peer.clone(),
        tx,
        Handle::current(),
        config.send_timeout,
    );
    controller.connect(Arc::new(subscriber));

    let mut liveness = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    log::debug!("ws receive error: {}", err);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(jpeg) => {
                    if let Err(err) = sender.send(Message::Binary(jpeg.to_vec())).await {
                        log::debug!("ws {} send error: {}", peer, err);
                        break;
                    }
                }
                // Registry dropped us (send failure or shutdown).
                None => break,
            },
            _ = &mut liveness => break,
        }
    }
    liveness.abort();
    drop(rx);
    let _ = sender.close().await;

    let disconnected = tokio::task::spawn_blocking(move || controller.disconnect(id)).await;
    if let Err(err) = disconnected {
        log::warn!("ws {} disconnect task failed: {}", peer, err);
    }
    log::info!("ws {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> AnnotatedFrame {
        AnnotatedFrame {
            frame_index: 0,
            source_sequence: 1,
            width: 2,
            height: 2,
            jpeg: Bytes::from_static(b"\xFF\xD8jpeg"),
            detections: Vec::new(),
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("test runtime")
    }

    #[test]
    fn send_delivers_into_the_connection_queue() -> Result<()> {
        let rt = runtime();
        let (tx, mut rx) = mpsc::channel(2);
        let sub = WsSubscriber::new(
            1,
            "test".into(),
            tx,
            rt.handle().clone(),
            Duration::from_millis(100),
        );

        sub.send(&frame())?;
        let received = rx.try_recv().map_err(|err| anyhow!("{err}"))?;
        assert_eq!(&received[..], b"\xFF\xD8jpeg");
        Ok(())
    }

    #[test]
    fn full_queue_times_out() {
        let rt = runtime();
        let (tx, _rx) = mpsc::channel(1);
        let sub = WsSubscriber::new(
            2,
            "slow".into(),
            tx,
            rt.handle().clone(),
            Duration::from_millis(30),
        );

        assert!(sub.send(&frame()).is_ok());
        let err = sub
            .send(&frame())
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("timed out"));
    }

    #[test]
    fn closed_connection_fails_the_send() {
        let rt = runtime();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sub = WsSubscriber::new(
            3,
            "gone".into(),
            tx,
            rt.handle().clone(),
            Duration::from_millis(30),
        );
        assert!(sub.send(&frame()).is_err());
    }
}
