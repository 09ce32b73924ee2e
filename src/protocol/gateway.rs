//! WebSocket connection handling.
//!
//! One task per connection reads client messages; a dedicated sender task
//! owns the write half and drains a [`MessageRoute`] channel, so the session
//! runner and the connection loop can both emit without contending for the
//! socket. Protocol limits (message size, audio rate, idle timeout) are
//! enforced here, before anything reaches the session layer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{
    ClientMessage, IDLE_TIMEOUT_SECS, MAX_AUDIO_CHUNKS_PER_SEC, MAX_MESSAGE_BYTES, MessageRoute,
    ServerMessage,
};
use crate::errors::{ErrorCode, GatewayError};
use crate::session::{SessionCommand, SessionHandle, SessionManager, SessionRequest};
use crate::session::types::epoch_millis;

/// Outgoing message channel depth per connection.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How often the idle check fires.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to the WebSocket route.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

/// Connection query parameters. The platform layer in front of the gateway
/// authenticates; by the time a socket reaches us the user id is trusted.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Falls back to an anonymous per-connection id
    pub user_id: Option<String>,
}

/// Sliding one-second window over audio-chunk arrivals.
struct ChunkRateLimiter {
    window: VecDeque<Instant>,
    limit: usize,
}

impl ChunkRateLimiter {
    fn new(limit: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= Duration::from_secs(1) {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() >= self.limit {
            return false;
        }
        self.window.push_back(now);
        true
    }
}

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = params
        .user_id
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
    info!(user_id, "WebSocket connection upgrade requested");
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    // traffic in either direction resets the idle clock
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let sender_activity = Arc::clone(&last_activity);
    let sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            *sender_activity.lock() = Instant::now();
            let result = match route {
                MessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("failed to serialize outgoing message: {e}");
                        continue;
                    }
                },
                MessageRoute::Close => {
                    debug!("closing WebSocket connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!("WebSocket send failed: {e}");
                break;
            }
        }
    });

    let _ = message_tx
        .send(MessageRoute::Outgoing(ServerMessage::ConnectionReady {
            server_time: epoch_millis(),
        }))
        .await;

    let mut connection = Connection {
        state,
        user_id,
        message_tx,
        handle: None,
        rate_limiter: ChunkRateLimiter::new(MAX_AUDIO_CHUNKS_PER_SEC),
    };

    let idle_timeout = Duration::from_secs(IDLE_TIMEOUT_SECS);
    loop {
        select! {
            incoming = receiver.next() => {
                *last_activity.lock() = Instant::now();
                match incoming {
                    Some(Ok(message)) => {
                        if !connection.process(message).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket closed by client");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                if last_activity.lock().elapsed() >= idle_timeout {
                    info!(user_id = connection.user_id, "closing idle connection");
                    connection.close_idle().await;
                    break;
                }
            }
        }
    }

    connection.teardown().await;
    sender_task.abort();
}

struct Connection {
    state: Arc<AppState>,
    user_id: String,
    message_tx: mpsc::Sender<MessageRoute>,
    handle: Option<Arc<SessionHandle>>,
    rate_limiter: ChunkRateLimiter,
}

impl Connection {
    /// Handle one raw frame. Returns false when the connection should close.
    async fn process(&mut self, message: Message) -> bool {
        match message {
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_BYTES {
                    self.send_error(&GatewayError::InvalidMessage(format!(
                        "message exceeds {MAX_MESSAGE_BYTES} bytes"
                    )))
                    .await;
                    return true;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.dispatch(message).await,
                    Err(e) => {
                        self.send_error(&GatewayError::InvalidMessage(format!(
                            "unparseable message: {e}"
                        )))
                        .await;
                        true
                    }
                }
            }
            // audio rides in JSON text frames; binary is not part of the protocol
            Message::Binary(_) => {
                self.send_error(&GatewayError::InvalidMessage(
                    "binary frames are not supported".to_string(),
                ))
                .await;
                true
            }
            Message::Close(_) => false,
            Message::Ping(_) | Message::Pong(_) => true,
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> bool {
        match message {
            ClientMessage::StartSession {
                mode,
                config,
                system_prompt,
                template_id,
                barge_in_enabled,
            } => {
                if let Some(handle) = &self.handle
                    && !handle.is_terminated()
                {
                    self.send_error(&GatewayError::SessionExists(handle.id.clone()))
                        .await;
                    return true;
                }
                if let Some(template_id) = template_id {
                    debug!(template_id, "scenario template reference (platform-resolved)");
                }
                let request = SessionRequest {
                    user_id: self.user_id.clone(),
                    mode,
                    config,
                    system_prompt,
                    barge_in_enabled: barge_in_enabled.unwrap_or(true),
                };
                match self
                    .state
                    .sessions
                    .start_session(request, self.message_tx.clone())
                    .await
                {
                    Ok(handle) => {
                        self.handle = Some(handle);
                        true
                    }
                    Err(error) => {
                        self.send_error(&error).await;
                        if !error.recoverable() {
                            let _ = self.message_tx.send(MessageRoute::Close).await;
                            return false;
                        }
                        true
                    }
                }
            }
            ClientMessage::AudioChunk { audio, .. } => {
                if !self.rate_limiter.allow(Instant::now()) {
                    self.send_error(&GatewayError::RateLimited(format!(
                        "more than {MAX_AUDIO_CHUNKS_PER_SEC} audio chunks per second"
                    )))
                    .await;
                    return true;
                }
                let frame = match BASE64_STANDARD.decode(&audio) {
                    Ok(frame) if !frame.is_empty() && frame.len() % 2 == 0 => Bytes::from(frame),
                    Ok(_) => {
                        self.send_error(&GatewayError::InvalidAudio(
                            "audio payload is empty or not PCM16-aligned".to_string(),
                        ))
                        .await;
                        return true;
                    }
                    Err(e) => {
                        self.send_error(&GatewayError::InvalidAudio(format!(
                            "base64 decode failed: {e}"
                        )))
                        .await;
                        return true;
                    }
                };
                self.forward(SessionCommand::Audio(frame)).await;
                true
            }
            ClientMessage::EndTurn {} => {
                self.forward(SessionCommand::EndTurn).await;
                true
            }
            ClientMessage::Interrupt {} => {
                self.forward(SessionCommand::Interrupt).await;
                true
            }
            ClientMessage::EndSession {} => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.command(SessionCommand::End).await;
                    self.state.sessions.remove(&handle);
                } else {
                    self.send_error(&GatewayError::InvalidMessage(
                        "no active session".to_string(),
                    ))
                    .await;
                }
                // the runner reports session_ended and closes the socket
                true
            }
            ClientMessage::Ping { timestamp } => {
                let _ = self
                    .message_tx
                    .send(MessageRoute::Outgoing(ServerMessage::Pong {
                        client_timestamp: timestamp,
                        server_timestamp: epoch_millis(),
                    }))
                    .await;
                true
            }
        }
    }

    /// Forward a command to the live session, or report that none exists.
    async fn forward(&mut self, command: SessionCommand) {
        let Some(handle) = self.handle.as_ref().filter(|h| !h.is_terminated()) else {
            self.send_error(&GatewayError::InvalidMessage(
                "no active session".to_string(),
            ))
            .await;
            return;
        };
        if !handle.command(command).await {
            debug!(session_id = handle.id, "session runner is gone");
            self.handle = None;
        }
    }

    async fn close_idle(&mut self) {
        self.send_error(&GatewayError::InvalidMessage(
            "connection idle for too long".to_string(),
        ))
        .await;
        let _ = self.message_tx.send(MessageRoute::Close).await;
    }

    /// Terminate any session this connection still owns.
    async fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_terminated() {
                info!(
                    session_id = handle.id,
                    "transport closed, disconnecting session"
                );
                handle.terminate(crate::session::SessionStatus::Disconnected);
            }
            self.state.sessions.remove(&handle);
        }
    }

    async fn send_error(&self, error: &GatewayError) {
        if error.code() == ErrorCode::RateLimited {
            warn!(user_id = self.user_id, "audio chunk rate limit exceeded");
        }
        let _ = self
            .message_tx
            .send(MessageRoute::Outgoing(ServerMessage::from_error(error)))
            .await;
    }
}
