//! Byte transport seam.
//!
//! A [`Transport`] moves opaque frames to and from the relay. Connection
//! outcomes and inbound frames come back as [`TransportEvent`]s on the
//! receiver handed out at construction, so the session never blocks on I/O.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectError(String),
    Disconnected,
    Frame(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
}

pub trait Transport: Send {
    /// Start connecting. The outcome arrives as `Connected` or `ConnectError`.
    fn open(&mut self);

    /// Queue a frame for delivery.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Drop the connection. No further events are reported for it.
    fn close(&mut self);
}

/// WebSocket client transport, binary frames only.
pub struct WebSocketTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every open/close; stale connection tasks go quiet.
    epoch: Arc<AtomicU64>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            url: url.into(),
            events,
            outgoing: None,
            task: None,
            epoch: Arc::new(AtomicU64::new(0)),
        };
        (transport, rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn teardown(&mut self) -> u64 {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self) {
        let epoch = self.teardown();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.outgoing = Some(out_tx);

        let url = self.url.clone();
        let events = self.events.clone();
        let current = self.epoch.clone();
        let emit = move |event: TransportEvent| {
            if current.load(Ordering::SeqCst) == epoch {
                let _ = events.send(event);
            }
        };

        self.task = Some(tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    log::error!("Failed to connect to {url}: {e}");
                    emit(TransportEvent::ConnectError(e.to_string()));
                    return;
                }
            };
            log::debug!("WebSocket connected to {url}");
            emit(TransportEvent::Connected);

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(data) = outgoing else { break };
                        if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                            log::error!("WebSocket send to {url} failed: {e}");
                            break;
                        }
                    }
                    incoming = ws_reader.next() => {
                        match incoming {
                            Some(Ok(Message::Binary(data))) => {
                                emit(TransportEvent::Frame(data.into()));
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = ws_writer.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {url}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            let _ = ws_writer.close().await;
            emit(TransportEvent::Disconnected);
        }));
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        outgoing.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.teardown();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_send_before_open_fails() {
        let (mut transport, _rx) = WebSocketTransport::new("ws://127.0.0.1:1");
        assert_eq!(transport.send(vec![1]), Err(TransportError::NotConnected));
        assert_eq!(transport.url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_connect_error_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut transport, mut rx) = WebSocketTransport::new(format!("ws://127.0.0.1:{port}"));
        transport.open();
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(matches!(event, Some(TransportEvent::ConnectError(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_goes_quiet() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut transport, mut rx) = WebSocketTransport::new(format!("ws://127.0.0.1:{port}"));
        transport.open();
        transport.close();
        let event = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(event.is_err(), "No event expected after close, got {event:?}");
    }
}
