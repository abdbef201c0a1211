/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities: in-process mock gateway and fast client config
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for hyperfeed-adapter tests

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyperfeed_adapter::{GatewayConfig, ReconnectPolicy};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::MockServer;

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

enum Control {
    Send(String),
    Drop,
}

/// One-connection-at-a-time WebSocket gateway running on localhost.
///
/// Every text frame received is recorded together with the 1-based index of the
/// connection it arrived on.
pub struct MockGateway {
    pub url: String,
    received: mpsc::UnboundedReceiver<(usize, serde_json::Value)>,
    control: mpsc::UnboundedSender<Control>,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
        let url = format!("ws://{}", listener.local_addr().expect("local addr"));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel::<Control>();

        tokio::spawn(async move {
            let mut connection = 0usize;
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(tcp).await else {
                    continue;
                };
                connection += 1;

                loop {
                    tokio::select! {
                        control = control_rx.recv() => match control {
                            Some(Control::Send(text)) => {
                                if ws.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Control::Drop) => break,
                            None => return,
                        },
                        incoming = ws.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str(text.as_str()) {
                                    let _ = received_tx.send((connection, value));
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
        });

        Self {
            url,
            received,
            control,
        }
    }

    /// Next non-ping frame, or `None` after `wait`.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<(usize, serde_json::Value)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.received.recv())
                .await
                .ok()??;
            if frame.1["method"] != "ping" {
                return Some(frame);
            }
        }
    }

    /// Next frame including heartbeat pings.
    pub async fn next_raw_frame(&mut self, wait: Duration) -> Option<(usize, serde_json::Value)> {
        tokio::time::timeout(wait, self.received.recv()).await.ok()?
    }

    pub async fn expect_frames(&mut self, count: usize) -> Vec<(usize, serde_json::Value)> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self
                .next_frame(Duration::from_secs(5))
                .await
                .expect("expected frame from client");
            frames.push(frame);
        }
        frames
    }

    pub fn send(&self, frame: serde_json::Value) {
        let _ = self.control.send(Control::Send(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.control.send(Control::Send(text.to_string()));
    }

    /// Drop the current TCP connection without a close handshake.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }
}

/// Gateway config with millisecond-scale timings for tests.
pub fn fast_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        url: url.to_string(),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_consecutive_failures: 3,
        },
        heartbeat_interval: Duration::from_secs(15),
        heartbeat_timeout: Duration::from_secs(45),
        connect_timeout: Duration::from_secs(2),
    }
}

/// A ws:// URL nothing is listening on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

pub fn subscription_of(frame: &serde_json::Value) -> (String, String, String) {
    (
        frame["method"].as_str().unwrap_or_default().to_string(),
        frame["subscription"]["type"].as_str().unwrap_or_default().to_string(),
        frame["subscription"]["coin"].as_str().unwrap_or_default().to_string(),
    )
}
