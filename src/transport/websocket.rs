//! # WebSocket Transport
//!
//! [`Transport`] over tokio-tungstenite. Each transport runs one background
//! task that owns the socket: it relays queued outbound frames to the sink
//! and reports inbound frames and socket loss as [`TransportEvent`]s.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::{Transport, TransportEvent, TransportEventSender, TransportFactory, TransportParams};
use crate::errors::{codes, ErrorInfo, RealtimeError, RealtimeResult};

/// Outbound command for the socket task
#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Factory for WebSocket transports
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        binary: bool,
        events: TransportEventSender,
    ) -> RealtimeResult<Box<dyn Transport>> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let url = params.url()?.to_string();
        tracing::debug!(host = %params.host, "opening websocket transport");

        tokio::spawn(run_socket(url, binary, out_rx, events));

        Ok(Box::new(WebSocketTransport {
            out_tx,
            closed: false,
        }))
    }
}

/// Handle to a socket task
pub struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, payload: Vec<u8>) -> RealtimeResult<()> {
        if self.closed {
            return Err(RealtimeError::Transport("Transport already closed".into()));
        }
        self.out_tx
            .send(Outbound::Frame(payload))
            .map_err(|_| RealtimeError::Transport("Socket task has exited".into()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn socket_error(message: String) -> ErrorInfo {
    ErrorInfo::new(codes::DISCONNECTED, message)
}

async fn run_socket(
    url: String,
    binary: bool,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEventSender,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "websocket connect failed");
            let _ = events.send(TransportEvent::Closed(Some(socket_error(format!(
                "WebSocket connect failed: {}",
                e
            )))));
            return;
        }
    };

    let _ = events.send(TransportEvent::Opened);
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(payload)) => {
                        let frame = if binary {
                            WsMessage::Binary(payload)
                        } else {
                            match String::from_utf8(payload) {
                                Ok(text) => WsMessage::Text(text),
                                Err(e) => {
                                    tracing::error!(error = %e, "dropping non-UTF-8 text frame");
                                    continue;
                                }
                            }
                        };
                        if let Err(e) = ws_sender.send(frame).await {
                            tracing::warn!(error = %e, "websocket send failed");
                            let _ = events.send(TransportEvent::Closed(Some(socket_error(format!(
                                "WebSocket send failed: {}",
                                e
                            )))));
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.close().await;
                        let _ = events.send(TransportEvent::Closed(None));
                        break;
                    }
                }
            }

            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = events.send(TransportEvent::Data(text.into_bytes()));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let _ = events.send(TransportEvent::Data(bytes));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                            tracing::warn!(error = %e, "failed to send pong");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::debug!("websocket closed by peer");
                        let _ = events.send(TransportEvent::Closed(Some(socket_error(
                            "WebSocket closed by peer".into(),
                        ))));
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket receive error");
                        let _ = events.send(TransportEvent::Closed(Some(socket_error(format!(
                            "WebSocket receive error: {}",
                            e
                        )))));
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
