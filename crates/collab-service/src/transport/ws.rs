//! WebSocket adapter between browser clients and the hub.
//!
//! One upgraded socket becomes one [`Connection`]. After registration two
//! flows serve it:
//!
//! - the **reader** (this task) applies the read deadline, the rate limiter
//!   and the size bound, then stamps and broadcasts client frames;
//! - the **writer** (spawned) drains the connection's outbound queue with a
//!   write deadline and sends the close frame once the hub closes the
//!   connection.
//!
//! The reader unregisters the connection when the client goes away; the hub
//! closes it for every other reason (staleness, slow consumer, shutdown).

use super::auth::{extract_token, Authorizer};
use crate::errors::CollabError;
use crate::hub::{
    CloseReason, Connection, ConnectionId, ConnectionLink, ConnectionReceiver, HubHandle,
    OutboundFrame, Participant,
};
use crate::observability::metrics;
use crate::protocol::{AuthRequest, Empty, Envelope, ErrorPayload, InboundFrame, MessageType};
use crate::rate_limit::{RateLimiter, DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_REFILL};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default per-frame write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time allowed for an in-band `auth` frame.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound queue bound per connection.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default inbound frame size bound.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Replies the reader sends straight to the writer (in-band `pong`).
const DIRECT_CHANNEL_BUFFER: usize = 8;

/// Per-connection transport limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub auth_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            rate_limit_capacity: DEFAULT_RATE_LIMIT_CAPACITY,
            rate_limit_refill: DEFAULT_RATE_LIMIT_REFILL,
        }
    }
}

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct TransportState {
    pub hub: HubHandle,
    pub authorizer: Arc<dyn Authorizer>,
    pub settings: TransportSettings,
}

/// `GET /ws/projects/{project_id}`
///
/// A token found in the request is checked before upgrading, so a bad one
/// gets a plain HTTP 401/403. Without a token the socket is upgraded and
/// must authenticate in-band.
pub async fn ws_handler(
    Path(project_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<TransportState>,
    ws: WebSocketUpgrade,
) -> Response {
    let participant = match extract_token(&headers, params.get("token").map(String::as_str)) {
        Some(token) => match state.authorizer.authorize(&token, project_id).await {
            Ok(participant) => Some(participant),
            Err(e) => return rejection(&e),
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, participant))
}

fn rejection(err: &CollabError) -> Response {
    let status = match err {
        CollabError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CollabError::Forbidden(_) => StatusCode::FORBIDDEN,
        CollabError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorPayload {
        code: status.as_u16(),
        message: err.client_message(),
    };
    (status, Json(body)).into_response()
}

#[instrument(skip_all, name = "collab.transport.socket", fields(project_id = %project_id))]
async fn handle_socket(
    socket: WebSocket,
    state: TransportState,
    project_id: Uuid,
    participant: Option<Participant>,
) {
    let settings = state.settings;
    let (mut sink, mut stream) = socket.split();

    let participant = match participant {
        Some(participant) => participant,
        None => match authenticate_in_band(&mut stream, &state, project_id).await {
            Ok(participant) => participant,
            Err(e) => {
                debug!(target: "collab.transport", error = %e, "In-band authentication failed");
                let _ = timeout(settings.write_timeout, sink.send(close_message(e.close_reason()))).await;
                return;
            }
        },
    };
    let user_id = participant.user_id;

    let limiter = RateLimiter::new(settings.rate_limit_capacity, settings.rate_limit_refill);
    let (connection, receiver) = Connection::new(
        participant,
        project_id,
        settings.outbound_queue_capacity,
        limiter,
    );
    let connection_id = connection.id();
    let link = receiver.link();

    if let Err(e) = state.hub.register(connection).await {
        warn!(target: "collab.transport", error = %e, "Registration rejected");
        let _ = timeout(settings.write_timeout, sink.send(close_message(e.close_reason()))).await;
        return;
    }

    info!(
        target: "collab.transport",
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connected"
    );

    let (direct_tx, direct_rx) = mpsc::channel(DIRECT_CHANNEL_BUFFER);
    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(run_writer(
        sink,
        receiver,
        direct_rx,
        settings.write_timeout,
        writer_done.clone(),
    ));

    let reader = Reader {
        hub: &state.hub,
        link: &link,
        direct_tx,
        writer_done: &writer_done,
        settings,
        connection_id,
        user_id,
        project_id,
    };
    let reason = reader.run(&mut stream).await;

    state.hub.unregister(connection_id, reason).await;
    let _ = writer.await;

    info!(
        target: "collab.transport",
        connection_id = %connection_id,
        reason = link.close_reason().unwrap_or(reason).as_str(),
        "WebSocket disconnected"
    );
}

/// Wait for the first data frame and authorize its token.
async fn authenticate_in_band(
    stream: &mut SplitStream<WebSocket>,
    state: &TransportState,
    project_id: Uuid,
) -> Result<Participant, CollabError> {
    let frame = timeout(state.settings.auth_timeout, next_data_frame(stream))
        .await
        .map_err(|_| CollabError::Unauthorized("no auth frame before deadline".to_string()))?
        .ok_or_else(|| CollabError::Unauthorized("socket closed before auth".to_string()))?;

    let inbound = InboundFrame::parse(&frame, state.settings.max_frame_bytes)?;
    if inbound.kind != MessageType::Auth {
        return Err(CollabError::Unauthorized(format!(
            "expected auth frame, got {}",
            inbound.kind
        )));
    }
    let request: AuthRequest = serde_json::from_value(inbound.data)?;

    state.authorizer.authorize(&request.token, project_id).await
}

/// Next text or binary frame; `None` once the socket closes.
async fn next_data_frame(stream: &mut SplitStream<WebSocket>) -> Option<Vec<u8>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Binary(bytes)) => return Some(bytes),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }))
}

struct Reader<'a> {
    hub: &'a HubHandle,
    link: &'a Arc<ConnectionLink>,
    direct_tx: mpsc::Sender<Message>,
    writer_done: &'a CancellationToken,
    settings: TransportSettings,
    connection_id: ConnectionId,
    user_id: Uuid,
    project_id: Uuid,
}

impl Reader<'_> {
    /// Read until the client leaves, the hub closes the connection, or the
    /// writer fails. Returns the reason to unregister with.
    async fn run(&self, stream: &mut SplitStream<WebSocket>) -> CloseReason {
        loop {
            let next = tokio::select! {
                () = self.link.closed() => {
                    return self.link.close_reason().unwrap_or(CloseReason::Normal);
                }
                () = self.writer_done.cancelled() => return CloseReason::Normal,
                next = timeout(self.settings.read_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    debug!(
                        target: "collab.transport",
                        connection_id = %self.connection_id,
                        "Read deadline exceeded"
                    );
                    return CloseReason::Stale;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return CloseReason::Normal,
                Ok(Some(Err(e))) => {
                    debug!(
                        target: "collab.transport",
                        connection_id = %self.connection_id,
                        error = %e,
                        "Socket read failed"
                    );
                    return CloseReason::Normal;
                }
                Ok(Some(Ok(message))) => message,
            };

            self.link.touch();

            match message {
                Message::Text(text) => self.handle_frame(text.as_bytes()).await,
                Message::Binary(bytes) => self.handle_frame(&bytes).await,
                // Pings are answered by the socket itself.
                Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
            }
        }
    }

    /// Rate limit, size bound and envelope shape, in that order.
    fn admit(&self, frame: &[u8]) -> Result<InboundFrame, CollabError> {
        if !self.link.limiter().allow() {
            return Err(CollabError::RateLimited);
        }
        InboundFrame::parse(frame, self.settings.max_frame_bytes)
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let inbound = match self.admit(frame) {
            Ok(inbound) => inbound,
            Err(e) if e.is_admission_error() => {
                metrics::record_frame_rejected(e.metric_label());
                debug!(
                    target: "collab.transport",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Frame rejected"
                );
                return;
            }
            Err(e) => {
                warn!(
                    target: "collab.transport",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Frame admission failed"
                );
                return;
            }
        };

        match inbound.kind {
            MessageType::Ping => {
                self.reply_pong();
                return;
            }
            MessageType::Pong => return,
            MessageType::Auth => {
                debug!(
                    target: "collab.transport",
                    connection_id = %self.connection_id,
                    "Ignoring auth frame after admission"
                );
                return;
            }
            _ => {}
        }
        if !inbound.kind.is_client_broadcastable() {
            metrics::record_frame_rejected("forbidden_type");
            return;
        }

        let envelope = inbound.into_envelope(self.user_id, self.project_id);
        if let Err(e) = self
            .hub
            .broadcast(self.project_id, envelope, Some(self.connection_id))
            .await
        {
            warn!(target: "collab.transport", error = %e, "Broadcast failed");
        }
    }

    fn reply_pong(&self) {
        let frame = Envelope::encode(MessageType::Pong, &Empty {}, None, self.project_id)
            .and_then(|envelope| envelope.to_frame());
        match frame {
            Ok(frame) => match String::from_utf8(frame.to_vec()) {
                Ok(text) => {
                    let _ = self.direct_tx.try_send(Message::Text(text));
                }
                Err(e) => warn!(target: "collab.transport", error = %e, "Pong frame not UTF-8"),
            },
            Err(e) => warn!(target: "collab.transport", error = %e, "Failed to encode pong"),
        }
    }
}

/// Drain the outbound queue into the socket.
///
/// Once the hub closes the connection, frames it queued before the close
/// are flushed ahead of the close frame, all within one write deadline.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: ConnectionReceiver,
    mut direct: mpsc::Receiver<Message>,
    write_timeout: Duration,
    done: CancellationToken,
) {
    let _done = done.drop_guard();
    let link = receiver.link();

    loop {
        let message = tokio::select! {
            biased;
            () = link.closed() => break,
            Some(message) = direct.recv() => message,
            frame = receiver.recv() => match frame {
                Some(frame) => match outbound_message(frame) {
                    Some(message) => message,
                    None => continue,
                },
                None => break,
            },
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(target: "collab.transport", error = %e, "Socket write failed");
                return;
            }
            Err(_) => {
                warn!(
                    target: "collab.transport",
                    connection_id = %receiver.id(),
                    "Write deadline exceeded"
                );
                return;
            }
        }
    }

    let flushed = timeout(write_timeout, async {
        while let Ok(message) = direct.try_recv() {
            sink.send(message).await?;
        }
        while let Ok(frame) = receiver.try_recv() {
            // A closing peer gets no more heartbeats.
            if matches!(frame, OutboundFrame::Ping) {
                continue;
            }
            if let Some(message) = outbound_message(frame) {
                sink.send(message).await?;
            }
        }
        Ok::<(), axum::Error>(())
    })
    .await;
    match flushed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(target: "collab.transport", error = %e, "Socket write failed while flushing");
            return;
        }
        Err(_) => {
            warn!(
                target: "collab.transport",
                connection_id = %receiver.id(),
                "Write deadline exceeded while flushing"
            );
            return;
        }
    }

    let reason = link.close_reason().unwrap_or(CloseReason::Normal);
    let _ = timeout(write_timeout, sink.send(close_message(reason))).await;
    let _ = sink.close().await;
}

fn outbound_message(frame: OutboundFrame) -> Option<Message> {
    match frame {
        OutboundFrame::Text(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                warn!(target: "collab.transport", error = %e, "Dropping non-UTF-8 frame");
                None
            }
        },
        OutboundFrame::Ping => Some(Message::Ping(Vec::new())),
    }
}
