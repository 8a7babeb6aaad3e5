use crate::backoff::Backoff;
use crate::config::{BackoffConfig, CaptureDepth};
use crate::error::{RecorderError, Result};
use crate::types::{DiffEvent, RestDepthSnapshot, Snapshot, SubscribeRequest};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the stream hands to the pipeline
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Diff(DiffEvent),
    PartialDepth(Snapshot),
    /// The connection dropped; anything buffered across it is unverifiable.
    Discontinuity { reason: String },
}

/// A parsed text frame
#[derive(Debug, Clone)]
pub enum Frame {
    Diff(DiffEvent),
    PartialDepth(RestDepthSnapshot),
    Ack { id: u64 },
    Rejected { id: Option<u64>, message: String },
}

/// Classify and parse a text frame.
pub fn parse_frame(text: &str) -> Result<Frame> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if value.get("e").is_some() {
        return Ok(Frame::Diff(serde_json::from_value(value)?));
    }
    if value.get("lastUpdateId").is_some() {
        return Ok(Frame::PartialDepth(serde_json::from_value(value)?));
    }
    if let Some(err) = value.get("error") {
        return Ok(Frame::Rejected {
            id: value.get("id").and_then(|v| v.as_u64()),
            message: err.to_string(),
        });
    }
    if let (Some(id), Some(_)) = (value.get("id").and_then(|v| v.as_u64()), value.get("result")) {
        return Ok(Frame::Ack { id });
    }

    Err(RecorderError::Protocol(format!("unrecognized frame: {}", text)))
}

/// How a single connection ended
enum SessionEnd {
    Cancelled,
    ReceiverDropped,
    Disconnected(String),
}

/// Diff-feed consumer for one symbol.
///
/// Keeps one connection open, reconnecting with backoff, and forwards parsed
/// events into a bounded channel. Every reconnect is preceded by a
/// `StreamEvent::Discontinuity`.
pub struct DepthStreamClient {
    base_url: String,
    symbol: String,
    depth: CaptureDepth,
    reconnect: BackoffConfig,
}

impl DepthStreamClient {
    pub fn new(base_url: &str, symbol: &str, depth: CaptureDepth, reconnect: BackoffConfig) -> Self {
        Self {
            base_url: base_url.to_string(),
            symbol: symbol.to_uppercase(),
            depth,
            reconnect,
        }
    }

    pub fn channel(&self) -> String {
        self.depth.channel(&self.symbol)
    }

    /// Run until cancelled, the receiver is dropped, or reconnects are exhausted.
    pub async fn run(&self, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.reconnect.clone());
        let mut request_id = 0u64;

        loop {
            request_id += 1;

            let reason = match self.stream_session(&tx, &cancel, request_id, &mut backoff).await {
                Ok(SessionEnd::Cancelled) => {
                    info!(symbol = %self.symbol, "Depth stream cancelled");
                    return Ok(());
                }
                Ok(SessionEnd::ReceiverDropped) => {
                    warn!(symbol = %self.symbol, "Receiver dropped, closing depth stream");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected(reason)) => reason,
                Err(RecorderError::Protocol(msg)) => {
                    error!(symbol = %self.symbol, error = %msg, "Subscription rejected");
                    return Err(RecorderError::Protocol(msg));
                }
                Err(e) => e.to_string(),
            };

            warn!(symbol = %self.symbol, %reason, "Depth stream discontinuity");
            if !deliver(&tx, &cancel, StreamEvent::Discontinuity { reason }).await {
                return Ok(());
            }

            match backoff.next_delay() {
                Some(delay) => {
                    info!(
                        symbol = %self.symbol,
                        attempt = backoff.attempt(),
                        max_attempts = backoff.max_attempts(),
                        ?delay,
                        "Reconnecting depth stream"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                }
                None => {
                    error!(symbol = %self.symbol, attempts = backoff.attempt(), "Reconnect attempts exhausted");
                    return Err(RecorderError::RetriesExhausted {
                        what: format!("{} depth stream reconnect", self.symbol),
                        attempts: backoff.attempt(),
                    });
                }
            }
        }
    }

    /// One connection: connect, subscribe, forward frames until it ends.
    async fn stream_session(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        request_id: u64,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        info!("Connecting to WebSocket: {}", self.base_url);

        let url = url::Url::parse(&self.base_url)?;
        let mut request = url.as_str().into_client_request()?;
        if let Ok(agent) = "depth-recorder/0.1.0".parse() {
            request.headers_mut().insert("User-Agent", agent);
        }

        let mut ws_stream: WsStream = tokio::select! {
            connected = connect_async(request) => connected?.0,
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        };

        let subscribe = SubscribeRequest::subscribe(self.channel(), request_id);
        ws_stream
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;
        info!(symbol = %self.symbol, channel = %self.channel(), id = request_id, "WebSocket connected, subscription sent");

        let mut received_data = false;

        loop {
            let msg = tokio::select! {
                msg = ws_stream.next() => msg,
                _ = cancel.cancelled() => {
                    let _ = ws_stream.close(None).await;
                    return Ok(SessionEnd::Cancelled);
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    let event = match parse_frame(&text) {
                        Ok(Frame::Diff(event)) => {
                            if event.symbol != self.symbol {
                                warn!(symbol = %self.symbol, got = %event.symbol, "Dropping frame for another symbol");
                                continue;
                            }
                            debug!(
                                symbol = %self.symbol,
                                first_update_id = event.first_update_id,
                                final_update_id = event.final_update_id,
                                "Depth update"
                            );
                            StreamEvent::Diff(event)
                        }
                        Ok(Frame::PartialDepth(body)) => {
                            StreamEvent::PartialDepth(Snapshot::from_rest(&self.symbol, body, chrono::Utc::now()))
                        }
                        Ok(Frame::Ack { id }) => {
                            info!(symbol = %self.symbol, id, "Subscription acknowledged");
                            continue;
                        }
                        Ok(Frame::Rejected { id, message }) => {
                            let _ = ws_stream.close(None).await;
                            return Err(RecorderError::Protocol(format!(
                                "subscription {:?} rejected: {}",
                                id, message
                            )));
                        }
                        Err(e) => {
                            warn!(symbol = %self.symbol, error = %e, "Dropping malformed frame");
                            continue;
                        }
                    };

                    if !received_data {
                        received_data = true;
                        backoff.reset();
                    }
                    if !deliver(tx, cancel, event).await {
                        let _ = ws_stream.close(None).await;
                        return Ok(if cancel.is_cancelled() {
                            SessionEnd::Cancelled
                        } else {
                            SessionEnd::ReceiverDropped
                        });
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    debug!("Received ping, sending pong");
                    ws_stream.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(symbol = %self.symbol, ?frame, "WebSocket closed by server");
                    return Ok(SessionEnd::Disconnected("closed by server".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol = %self.symbol, error = %e, "WebSocket error");
                    return Err(RecorderError::WebSocket(e));
                }
                None => {
                    return Ok(SessionEnd::Disconnected(RecorderError::ConnectionClosed.to_string()));
                }
            }
        }
    }
}

/// Send into the bounded channel, giving up on cancellation. Returns false if
/// the event could not be delivered.
async fn deliver(tx: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken, event: StreamEvent) -> bool {
    tokio::select! {
        sent = tx.send(event) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    }
}
