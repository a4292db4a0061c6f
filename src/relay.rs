//! Ephemeral signal relay: typing indicators and read receipts.
//!
//! Both signals are fire-and-forget. They bypass the message store, are
//! never queued or retried, and live exactly as long as one forward attempt.
//! The store collaborator's own "mark as read" persistence is the durability
//! path for read state; this relay only pushes the live UI update.

use std::sync::Arc;

use crate::directory::ParticipantCache;
use crate::frame::ServerFrame;
use crate::registry::{ConnectionRegistry, UserId};

pub struct SignalRelay {
    registry: Arc<ConnectionRegistry>,
    participants: Arc<ParticipantCache>,
}

impl SignalRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, participants: Arc<ParticipantCache>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            participants,
        })
    }

    /// Forward a typing indicator to the conversation's other participant,
    /// or drop it silently.
    pub async fn relay_typing(&self, conversation_id: i64, sender_id: UserId) {
        let frame = ServerFrame::Typing {
            conversation_id,
            sender_id,
        };
        self.forward(conversation_id, sender_id, frame).await;
    }

    /// Forward a read receipt to the conversation's other participant, or
    /// drop it silently.
    pub async fn relay_read(&self, conversation_id: i64, reader_id: UserId) {
        let frame = ServerFrame::Read {
            conversation_id,
            reader_id,
        };
        self.forward(conversation_id, reader_id, frame).await;
    }

    async fn forward(&self, conversation_id: i64, from: UserId, frame: ServerFrame) {
        let counterpart = match self.participants.counterpart(conversation_id, from).await {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::debug!(conversation_id, from, %err, "signal dropped, unresolvable counterpart");
                return;
            }
        };

        match self.registry.lookup(counterpart) {
            Some(connection) => {
                let _ = connection.push(&frame);
            }
            None => {
                tracing::trace!(conversation_id, counterpart, "signal dropped, counterpart offline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::MemoryDirectory;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (Arc<ConnectionRegistry>, Arc<SignalRelay>) {
        let (registry, _events) = ConnectionRegistry::new();
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(5, 1, 2);
        let participants = Arc::new(ParticipantCache::new(directory));
        let relay = SignalRelay::new(registry.clone(), participants);
        (registry, relay)
    }

    fn connect(registry: &Arc<ConnectionRegistry>, user_id: UserId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(user_id, tx, CancellationToken::new());
        rx
    }

    #[tokio::test]
    async fn typing_reaches_the_counterpart() {
        let (registry, relay) = setup().await;
        let mut rx = connect(&registry, 2);

        relay.relay_typing(5, 1).await;

        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("\"type\":\"typing\""));
        assert!(text.contains("\"sender_id\":1"));
    }

    #[tokio::test]
    async fn read_receipt_reaches_the_counterpart() {
        let (registry, relay) = setup().await;
        let mut rx = connect(&registry, 1);

        relay.relay_read(5, 2).await;

        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("\"type\":\"read\""));
        assert!(text.contains("\"reader_id\":2"));
    }

    #[tokio::test]
    async fn offline_counterpart_drops_the_signal() {
        let (_registry, relay) = setup().await;
        // Neither participant connected: nothing should panic or queue.
        relay.relay_typing(5, 1).await;
        relay.relay_read(5, 1).await;
    }

    #[tokio::test]
    async fn unknown_conversation_drops_the_signal() {
        let (registry, relay) = setup().await;
        let mut rx = connect(&registry, 2);

        relay.relay_typing(99, 1).await;
        assert!(rx.try_recv().is_err());
    }
}
