//! Actor-per-connection: one task per live WebSocket, owning its read loop.
//!
//! The socket is split into reader and writer halves. The writer task owns
//! the sink and drains the connection's bounded outbound channel; everything
//! else in the system reaches this client by pushing into that channel
//! through its `ConnectionHandle`. The reader loop dispatches inbound
//! frames and exits on close, error, supersession, or buffer overflow;
//! unregistration runs exactly once on the way out.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::frame::{self, ClientFrame, DecodedClient};
use crate::registry::{ConnectionHandle, UserId, CLOSE_SUPERSEDED};
use crate::state::AppState;

/// Server ping cadence; prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// If no pong arrives this long after a ping, the connection is dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Malformed frames tolerated before the connection is torn down. One bad
/// frame must not kill a session; a stream of them is not a client we keep.
const MAX_PROTOCOL_VIOLATIONS: u32 = 8;

pub async fn run_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(state.outbound_capacity);
    let shutdown = CancellationToken::new();

    // Register, atomically superseding any prior connection for this user.
    let (handle, superseded) = state.registry.register(user_id, out_tx.clone(), shutdown.clone());
    if let Some(old) = superseded {
        tracing::info!(user_id, old_connection = old.id(), "superseding prior connection");
        old.close(CLOSE_SUPERSEDED, "superseded by newer connection");
    }

    tracing::info!(user_id, connection_id = handle.id(), "connection actor started");

    // Writer task: drains the outbound channel into the sink.
    let writer_handle = tokio::spawn(writer_task(ws_sender, out_rx));

    // Ping task: periodic pings, closes on missing pong.
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_out = out_tx.clone();
    let ping_shutdown = shutdown.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await; // skip the immediate first tick

        loop {
            ping_timer.tick().await;
            if ping_out.try_send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("pong timeout, closing connection");
                    let _ = ping_out.try_send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "pong timeout".into(),
                    })));
                    ping_shutdown.cancel();
                    break;
                }
            }
        }
    });

    let mut violations: u32 = 0;

    loop {
        tokio::select! {
            // Supersession or outbound overflow asked us to stop.
            _ = shutdown.cancelled() => {
                tracing::debug!(user_id, connection_id = handle.id(), "connection cancelled");
                break;
            }
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle.touch();
                    if !handle_client_frame(&state, &handle, text.as_str()).await {
                        violations += 1;
                        if violations >= MAX_PROTOCOL_VIOLATIONS {
                            tracing::warn!(
                                user_id,
                                violations,
                                "repeated protocol violations, closing connection"
                            );
                            let _ = out_tx.try_send(Message::Close(Some(CloseFrame {
                                code: 1002,
                                reason: "protocol violation".into(),
                            })));
                            break;
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    handle.touch();
                    let _ = pong_tx.send(());
                }
                Some(Ok(Message::Ping(data))) => {
                    handle.touch();
                    let _ = out_tx.try_send(Message::Pong(data));
                }
                Some(Ok(Message::Binary(_))) => {
                    // The protocol is JSON text; binary is a violation.
                    violations += 1;
                    if violations >= MAX_PROTOCOL_VIOLATIONS {
                        break;
                    }
                }
                Some(Ok(Message::Close(reason))) => {
                    tracing::info!(user_id, ?reason, "client initiated close");
                    break;
                }
                Some(Err(err)) => {
                    tracing::warn!(user_id, %err, "WebSocket receive error");
                    break;
                }
                None => {
                    tracing::info!(user_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    // A stale close racing a newer registration is a no-op inside.
    state.registry.unregister(user_id, handle.id());

    tracing::info!(user_id, connection_id = handle.id(), "connection actor stopped");
}

async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if ws_sender.send(message).await.is_err() {
            break;
        }
    }
}

/// Dispatch one inbound text frame. Returns false for a malformed frame
/// (counted toward the violation limit); unknown types are ignored.
async fn handle_client_frame(state: &AppState, handle: &ConnectionHandle, text: &str) -> bool {
    match frame::decode_client(text) {
        DecodedClient::Frame(ClientFrame::Ack { message_id }) => {
            state.dispatcher.acknowledge(&message_id, handle.user_id());
            true
        }
        DecodedClient::Frame(ClientFrame::Typing { conversation_id }) => {
            state.relay.relay_typing(conversation_id, handle.user_id()).await;
            true
        }
        DecodedClient::Frame(ClientFrame::Read { conversation_id }) => {
            state.relay.relay_read(conversation_id, handle.user_id()).await;
            true
        }
        DecodedClient::Unknown(frame_type) => {
            tracing::debug!(
                user_id = handle.user_id(),
                frame_type = %frame_type,
                "ignoring unknown frame type"
            );
            true
        }
        DecodedClient::Malformed => {
            tracing::warn!(user_id = handle.user_id(), "malformed frame discarded");
            false
        }
    }
}
