//! Delivery dispatcher: turns publish-bridge events into `message` frames on
//! live connections and tracks unacknowledged deliveries.
//!
//! The dispatcher is a best-effort fast path. The message store remains the
//! durability authority: an offline recipient costs us nothing (the client
//! fetches unread state on its next login), and a delivery dropped after the
//! retry bound is not data loss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::bridge::NewMessageEvent;
use crate::directory::ParticipantCache;
use crate::frame::{DeliveryFrame, ServerFrame};
use crate::registry::{ConnectionRegistry, UserId};

/// Retry tuning. Defaults: resend after 5s unacknowledged, at most 3 sends
/// total.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// A delivery awaiting its ack. Exactly one entry per message id.
struct PendingDelivery {
    frame: DeliveryFrame,
    recipient_id: UserId,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
    retry: AbortHandle,
}

pub struct DeliveryDispatcher {
    registry: Arc<ConnectionRegistry>,
    participants: Arc<ParticipantCache>,
    pending: DashMap<String, PendingDelivery>,
    policy: RetryPolicy,
}

impl DeliveryDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        participants: Arc<ParticipantCache>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            participants,
            pending: DashMap::new(),
            policy,
        })
    }

    /// Consume publish-bridge events until the channel closes. Events are
    /// processed one at a time in arrival order, which preserves
    /// per-conversation delivery order (the bridge emits in creation order).
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NewMessageEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        tracing::debug!("publish bridge channel closed, dispatcher stopping");
    }

    /// Handle one new-message event: push to the recipient if connected,
    /// otherwise do nothing (delivered-when-read on next login).
    pub fn dispatch(self: &Arc<Self>, event: NewMessageEvent) {
        // The event carries both participants; seed the cache so the relay
        // and presence tracker never need a store round trip for this
        // conversation.
        self.participants
            .record(event.conversation_id, event.sender_id, event.recipient_id);

        let frame = event.into_frame();
        let recipient_id = frame.recipient_id;
        let message_id = frame.message_id.clone();

        // Exactly one PendingDelivery per message id: a duplicate publish of
        // a message already in flight is ignored.
        if self.pending.contains_key(&message_id) {
            tracing::debug!(message_id = %message_id, "duplicate publish event ignored");
            return;
        }

        let connection = match self.registry.lookup(recipient_id) {
            Some(connection) => connection,
            None => {
                tracing::debug!(
                    message_id = %message_id,
                    recipient_id,
                    "recipient offline, store remains authoritative"
                );
                return;
            }
        };

        if connection.push(&ServerFrame::Message(frame.clone())).is_err() {
            return;
        }
        tracing::debug!(message_id = %message_id, recipient_id, "delivery frame pushed");

        let dispatcher = self.clone();
        let retry_id = message_id.clone();
        let retry = tokio::spawn(async move {
            dispatcher.retry_loop(retry_id).await;
        })
        .abort_handle();

        self.pending.insert(
            message_id,
            PendingDelivery {
                frame,
                recipient_id,
                enqueued_at: Utc::now(),
                attempts: 1,
                retry,
            },
        );
    }

    /// Resend an unacknowledged delivery after each timeout, up to the
    /// attempt bound, then drop it.
    async fn retry_loop(self: Arc<Self>, message_id: String) {
        loop {
            tokio::time::sleep(self.policy.ack_timeout).await;

            let resend = {
                let mut entry = match self.pending.get_mut(&message_id) {
                    Some(entry) => entry,
                    None => return, // acked or cancelled meanwhile
                };

                if entry.attempts >= self.policy.max_attempts {
                    None
                } else {
                    match self.registry.lookup(entry.recipient_id) {
                        Some(connection) => {
                            entry.attempts += 1;
                            Some((connection, ServerFrame::Message(entry.frame.clone())))
                        }
                        None => None,
                    }
                }
            };

            match resend {
                Some((connection, frame)) => {
                    tracing::debug!(message_id = %message_id, "resending unacknowledged delivery");
                    if connection.push(&frame).is_err() {
                        self.drop_pending(&message_id);
                        return;
                    }
                }
                None => {
                    self.drop_pending(&message_id);
                    return;
                }
            }
        }
    }

    fn drop_pending(&self, message_id: &str) {
        if let Some((_, pending)) = self.pending.remove(message_id) {
            tracing::warn!(
                message_id,
                recipient_id = pending.recipient_id,
                attempts = pending.attempts,
                age_ms = (Utc::now() - pending.enqueued_at).num_milliseconds(),
                "dropping undelivered frame, store remains authoritative"
            );
            pending.retry.abort();
        }
    }

    /// An ack arrived from `user_id` for `message_id`. Only the recipient of
    /// the pending delivery can clear it.
    pub fn acknowledge(&self, message_id: &str, user_id: UserId) {
        let removed = self
            .pending
            .remove_if(message_id, |_, pending| pending.recipient_id == user_id);
        if let Some((_, pending)) = removed {
            pending.retry.abort();
            tracing::debug!(message_id, user_id, "delivery acknowledged");
        }
    }

    /// The recipient's connection closed: cancel every pending delivery
    /// addressed to it so no retry fires at a dead connection.
    pub fn connection_closed(&self, user_id: UserId) {
        self.pending.retain(|_, pending| {
            if pending.recipient_id == user_id {
                pending.retry.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::MemoryDirectory;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn event(message_id: &str, conversation_id: i64, sender: UserId, recipient: UserId) -> NewMessageEvent {
        NewMessageEvent {
            message_id: message_id.to_string(),
            conversation_id,
            sender_id: sender,
            recipient_id: recipient,
            content: "hola".to_string(),
            created_at: Utc::now(),
            sender_name: None,
            listing_id: None,
            listing_title: None,
        }
    }

    fn setup(policy: RetryPolicy) -> (Arc<ConnectionRegistry>, Arc<DeliveryDispatcher>) {
        let (registry, _events) = ConnectionRegistry::new();
        let participants = Arc::new(ParticipantCache::new(Arc::new(MemoryDirectory::new())));
        let dispatcher = DeliveryDispatcher::new(registry.clone(), participants, policy);
        (registry, dispatcher)
    }

    fn connect(registry: &Arc<ConnectionRegistry>, user_id: UserId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(user_id, tx, CancellationToken::new());
        rx
    }

    fn count_deliveries(rx: &mut mpsc::Receiver<Message>, message_id: &str) -> usize {
        let mut count = 0;
        while let Ok(Message::Text(text)) = rx.try_recv() {
            if text.contains(message_id) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn offline_recipient_leaves_no_state() {
        let (_registry, dispatcher) = setup(RetryPolicy::default());
        dispatcher.dispatch(event("msg_1", 1, 1, 2));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_clears_pending_before_any_retry() {
        let (registry, dispatcher) = setup(RetryPolicy::default());
        let mut rx = connect(&registry, 2);

        dispatcher.dispatch(event("msg_1", 1, 1, 2));
        assert_eq!(dispatcher.pending_count(), 1);
        dispatcher.acknowledge("msg_1", 2);
        assert_eq!(dispatcher.pending_count(), 0);

        // No resend ever fires.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(count_deliveries(&mut rx, "msg_1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_from_wrong_user_does_not_clear() {
        let (registry, dispatcher) = setup(RetryPolicy::default());
        let _rx = connect(&registry, 2);

        dispatcher.dispatch(event("msg_1", 1, 1, 2));
        dispatcher.acknowledge("msg_1", 9);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_then_dropped() {
        let policy = RetryPolicy {
            ack_timeout: Duration::from_secs(5),
            max_attempts: 3,
        };
        let (registry, dispatcher) = setup(policy);
        let mut rx = connect(&registry, 2);

        dispatcher.dispatch(event("msg_1", 1, 1, 2));

        // Never acked: two resends, then the pending entry is dropped.
        // Step the clock so each retry round gets to run.
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(6)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(count_deliveries(&mut rx, "msg_1"), 3);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retries() {
        let (registry, dispatcher) = setup(RetryPolicy::default());
        let mut rx = connect(&registry, 2);

        dispatcher.dispatch(event("msg_1", 1, 1, 2));
        assert_eq!(dispatcher.pending_count(), 1);

        let handle = registry.lookup(2).unwrap();
        registry.unregister(2, handle.id());
        dispatcher.connection_closed(2);
        assert_eq!(dispatcher.pending_count(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(count_deliveries(&mut rx, "msg_1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_conversation_preserves_order() {
        let (registry, dispatcher) = setup(RetryPolicy::default());
        let mut rx = connect(&registry, 2);

        for i in 1..=3 {
            dispatcher.dispatch(event(&format!("msg_{i}"), 1, 1, 2));
        }

        let mut order = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            for i in 1..=3 {
                if text.contains(&format!("msg_{i}")) {
                    order.push(i);
                }
            }
        }
        assert_eq!(order, vec![1, 2, 3]);
    }
}
