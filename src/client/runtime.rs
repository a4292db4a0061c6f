//! The connection runtime behind [`spawn`].
//!
//! One tokio task owns the WebSocket and the state machine
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED, entering
//! RECONNECTING automatically when the disconnect was not user-initiated.
//! Callers talk to it through a [`ClientHandle`] and observe it through the
//! event stream; sends issued while the link is down are queued FIFO and
//! flushed ahead of anything new once the link is back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::frame::{self, ClientFrame, DecodedServer, DeliveryFrame, ServerFrame};
use crate::registry::UserId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws`.
    pub url: String,
    pub user_id: UserId,
    /// Base delay between reconnect attempts; doubles per attempt.
    pub reconnect_delay: Duration,
    /// Cap on the doubled delay.
    pub max_reconnect_delay: Duration,
    /// Attempts before giving up and surfacing a persistent failure.
    pub max_reconnect_attempts: u32,
    /// How long a peer's typing flag stays set without a follow-up frame.
    pub typing_expiry: Duration,
    /// Outbound queue cap while disconnected; overflow drops the oldest.
    pub queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            user_id,
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            typing_expiry: Duration::from_secs(4),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// What the runtime surfaces to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { will_reconnect: bool },
    /// Reconnect attempts exhausted; the runtime has stopped.
    ReconnectsExhausted,
    /// A new message, deduplicated by message id: emitted at most once per id.
    Message(DeliveryFrame),
    /// The counterpart read the conversation; mark own outbound as read.
    MessagesRead { conversation_id: i64, reader_id: UserId },
    PeerTyping { conversation_id: i64, user_id: UserId },
    /// No follow-up typing frame arrived within the expiry window.
    PeerTypingExpired { conversation_id: i64, user_id: UserId },
    PeerStatus { user_id: UserId, online: bool },
}

enum Command {
    Frame(ClientFrame),
    Close,
}

/// Cheap handle to a running client runtime.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    presence: Arc<DashMap<UserId, bool>>,
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Last observed online/offline status of a peer, if any was received.
    pub fn peer_online(&self, user_id: UserId) -> Option<bool> {
        self.presence.get(&user_id).map(|entry| *entry)
    }

    pub fn send_typing(&self, conversation_id: i64) {
        let _ = self
            .commands
            .send(Command::Frame(ClientFrame::Typing { conversation_id }));
    }

    pub fn send_read(&self, conversation_id: i64) {
        let _ = self
            .commands
            .send(Command::Frame(ClientFrame::Read { conversation_id }));
    }

    /// User-initiated close: no reconnection follows.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Start the runtime task. Returns the handle and the event stream.
pub fn spawn(config: ClientConfig) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let presence = Arc::new(DashMap::new());

    let runtime = Runtime {
        config,
        events: event_tx,
        state: state_tx,
        presence: presence.clone(),
        queue: VecDeque::new(),
        seen: HashSet::new(),
    };
    tokio::spawn(runtime.run(command_rx));

    let handle = ClientHandle {
        commands: command_tx,
        state: state_rx,
        presence,
    };
    (handle, event_rx)
}

enum SessionEnd {
    /// User asked to close: terminal.
    Closed,
    /// Connection dropped out from under us: reconnect.
    Lost,
}

struct Runtime {
    config: ClientConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    presence: Arc<DashMap<UserId, bool>>,
    queue: VecDeque<ClientFrame>,
    seen: HashSet<String>,
}

impl Runtime {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let url = format!("{}?user_id={}", self.config.url, self.config.user_id);
        let mut attempts: u32 = 0;

        loop {
            self.set_state(if attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match connect_async(&url).await {
                Ok((stream, _response)) => {
                    attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    self.emit(ClientEvent::Connected);

                    match self.session(stream, &mut commands).await {
                        SessionEnd::Closed => {
                            self.set_state(ConnectionState::Disconnected);
                            self.emit(ClientEvent::Disconnected {
                                will_reconnect: false,
                            });
                            return;
                        }
                        SessionEnd::Lost => {
                            self.emit(ClientEvent::Disconnected {
                                will_reconnect: true,
                            });
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, attempt = attempts, "connect failed");
                }
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                tracing::warn!(
                    attempts,
                    "reconnect attempts exhausted, giving up"
                );
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::ReconnectsExhausted);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(&self.config, attempts);
            if !self.wait_before_retry(delay, &mut commands).await {
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::Disconnected {
                    will_reconnect: false,
                });
                return;
            }
        }
    }

    /// One connected session. Flushes the outbound queue first, then
    /// multiplexes commands, inbound frames, and typing expiry.
    async fn session(
        &mut self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut sink, mut inbound) = stream.split();

        // Queued frames go out strictly FIFO, ahead of any new sends.
        while let Some(queued) = self.queue.pop_front() {
            if self.send_frame(&mut sink, &queued).await.is_err() {
                self.queue.push_front(queued);
                return SessionEnd::Lost;
            }
        }

        // Peers currently flagged as typing, with their expiry deadlines.
        let mut typing: HashMap<(i64, UserId), Instant> = HashMap::new();

        loop {
            let next_expiry = typing.values().min().copied();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Frame(frame)) => {
                        if self.send_frame(&mut sink, &frame).await.is_err() {
                            self.queue_frame(frame);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.set_state(ConnectionState::Closing);
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                },
                message = inbound.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        if self.handle_server_frame(text.as_str(), &mut sink, &mut typing).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(%err, "WebSocket receive error");
                        return SessionEnd::Lost;
                    }
                },
                _ = expiry_tick(next_expiry) => {
                    let now = Instant::now();
                    let expired: Vec<(i64, UserId)> = typing
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(key, _)| *key)
                        .collect();
                    for (conversation_id, user_id) in expired {
                        typing.remove(&(conversation_id, user_id));
                        self.emit(ClientEvent::PeerTypingExpired {
                            conversation_id,
                            user_id,
                        });
                    }
                }
            }
        }
    }

    /// Decode and react to one server frame. `Err` means the link is gone
    /// (the ack write failed).
    async fn handle_server_frame(
        &mut self,
        text: &str,
        sink: &mut WsSink,
        typing: &mut HashMap<(i64, UserId), Instant>,
    ) -> Result<(), ()> {
        match frame::decode_server(text) {
            DecodedServer::Frame(ServerFrame::Message(delivery)) => {
                // Ack every copy: a resend means our previous ack was lost
                // or late. Render only the first.
                let ack = ClientFrame::Ack {
                    message_id: delivery.message_id.clone(),
                };
                let first_copy = self.seen.insert(delivery.message_id.clone());
                self.send_frame(sink, &ack).await?;
                if first_copy {
                    self.emit(ClientEvent::Message(delivery));
                }
                Ok(())
            }
            DecodedServer::Frame(ServerFrame::Typing {
                conversation_id,
                sender_id,
            }) => {
                let deadline = Instant::now() + self.config.typing_expiry;
                if typing.insert((conversation_id, sender_id), deadline).is_none() {
                    self.emit(ClientEvent::PeerTyping {
                        conversation_id,
                        user_id: sender_id,
                    });
                }
                Ok(())
            }
            DecodedServer::Frame(ServerFrame::Read {
                conversation_id,
                reader_id,
            }) => {
                self.emit(ClientEvent::MessagesRead {
                    conversation_id,
                    reader_id,
                });
                Ok(())
            }
            DecodedServer::Frame(ServerFrame::UserStatus { user_id, online }) => {
                self.presence.insert(user_id, online);
                self.emit(ClientEvent::PeerStatus { user_id, online });
                Ok(())
            }
            DecodedServer::Unknown(frame_type) => {
                tracing::debug!(frame_type = %frame_type, "ignoring unknown frame type");
                Ok(())
            }
            DecodedServer::Malformed => {
                tracing::warn!("malformed server frame discarded");
                Ok(())
            }
        }
    }

    async fn send_frame(&self, sink: &mut WsSink, frame: &ClientFrame) -> Result<(), ()> {
        let text = match frame.encode() {
            Some(text) => text,
            None => return Ok(()),
        };
        sink.send(WsMessage::Text(text.into())).await.map_err(|_| ())
    }

    /// Append to the outbound queue, dropping the oldest entry when full.
    fn queue_frame(&mut self, frame: ClientFrame) {
        if self.queue.len() >= self.config.queue_capacity {
            self.queue.pop_front();
            tracing::warn!(
                capacity = self.config.queue_capacity,
                "outbound queue full, dropped oldest frame"
            );
        }
        self.queue.push_back(frame);
    }

    /// Sleep out the backoff delay while still accepting commands: sends get
    /// queued, a close aborts the retry. Returns false on close.
    async fn wait_before_retry(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = commands.recv() => match command {
                    Some(Command::Frame(frame)) => self.queue_frame(frame),
                    Some(Command::Close) | None => return false,
                }
            }
        }
    }
}

/// Doubling backoff capped at `max_reconnect_delay`.
fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    config
        .reconnect_delay
        .saturating_mul(factor)
        .min(config.max_reconnect_delay)
}

/// Resolves at the next typing-expiry deadline, or never if none is set.
async fn expiry_tick(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ClientConfig::new("ws://localhost:0/ws", 1);
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(6));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(12));
        // Capped from here on.
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(24));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 12), Duration::from_secs(30));
    }
}
