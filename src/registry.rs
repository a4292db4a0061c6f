//! Connection registry: at most one live WebSocket connection per user.
//!
//! The registry is the single shared-mutation point of the subsystem.
//! Everything else (presence tracker, dispatcher, relay) only reads it and
//! reacts to the events it emits. A new authenticated connection for a user
//! atomically supersedes any prior one; a stale unregister (old connection
//! closing after a new one registered) is a no-op.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frame::ServerFrame;

pub type UserId = i64;

/// Close code sent to a connection replaced by a newer one for the same user.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Emitted on every successful registry mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered { user_id: UserId, superseded: bool },
    Unregistered { user_id: UserId },
}

/// Why a push into a connection's outbound buffer failed.
#[derive(Debug, PartialEq)]
pub enum PushError {
    /// Buffer full: the connection has been told to shut down (fail-fast,
    /// a stalled client must not hold up delivery to anyone else).
    Overflow,
    /// The connection is already closing.
    Closed,
}

/// Handle to one live connection. Cheap to clone; the underlying channel and
/// cancellation token are shared with the connection's actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    last_activity: Arc<AtomicI64>,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    /// Record inbound activity on this connection.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Token cancelled when the connection must close (overflow, supersession).
    /// The connection actor selects on this alongside its read loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Push a frame without blocking. On a full buffer the connection is
    /// cancelled rather than back-pressuring the caller.
    pub fn push(&self, frame: &ServerFrame) -> Result<(), PushError> {
        let text = match frame.encode() {
            Some(t) => t,
            None => return Ok(()), // unserializable frame: drop silently
        };
        match self.outbound.try_send(Message::Text(text.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = self.user_id,
                    connection_id = self.id,
                    "outbound buffer overflow, closing connection"
                );
                self.shutdown.cancel();
                Err(PushError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Ask the connection to close: best-effort Close frame, then cancel.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.try_send(Message::Close(Some(frame)));
        self.shutdown.cancel();
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create the registry and the receiving end of its event stream.
    /// The caller routes events to the presence tracker and dispatcher.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
        });
        (registry, rx)
    }

    /// Register a connection for `user_id`, atomically replacing any prior
    /// one. Returns the new handle plus the superseded handle, if any, so the
    /// caller can close it.
    pub fn register(
        &self,
        user_id: UserId,
        outbound: mpsc::Sender<Message>,
        shutdown: CancellationToken,
    ) -> (ConnectionHandle, Option<ConnectionHandle>) {
        let now = Utc::now();
        let handle = ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id,
            connected_at: now,
            last_activity: Arc::new(AtomicI64::new(now.timestamp_millis())),
            outbound,
            shutdown,
        };

        let superseded = self.connections.insert(user_id, handle.clone());
        let _ = self.events.send(RegistryEvent::Registered {
            user_id,
            superseded: superseded.is_some(),
        });

        tracing::debug!(
            user_id,
            connection_id = handle.id,
            superseded = superseded.is_some(),
            "connection registered"
        );
        (handle, superseded)
    }

    /// Unregister `connection_id` for `user_id`. A no-op if a different
    /// connection is currently registered (a stale close racing a new
    /// connection must not evict the winner). Returns whether the entry was
    /// removed.
    pub fn unregister(&self, user_id: UserId, connection_id: u64) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, handle| handle.id == connection_id)
            .is_some();

        if removed {
            let _ = self.events.send(RegistryEvent::Unregistered { user_id });
            tracing::debug!(user_id, connection_id, "connection unregistered");
        } else {
            tracing::trace!(user_id, connection_id, "stale unregister ignored");
        }
        removed
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|entry| entry.clone())
    }

    pub fn is_registered(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    /// Number of live connections (== number of distinct connected users).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_pair() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn register_supersedes_prior_connection() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tx1, _rx1) = channel_pair();
        let (tx2, _rx2) = channel_pair();

        let (first, none) = registry.register(7, tx1, CancellationToken::new());
        assert!(none.is_none());
        let (second, superseded) = registry.register(7, tx2, CancellationToken::new());

        let superseded = superseded.expect("first connection should be superseded");
        assert_eq!(superseded.id(), first.id());
        assert_eq!(registry.lookup(7).unwrap().id(), second.id());
        assert_eq!(registry.connection_count(), 1);

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Registered {
                user_id: 7,
                superseded: false
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Registered {
                user_id: 7,
                superseded: true
            }
        );
    }

    #[tokio::test]
    async fn stale_unregister_is_a_noop() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tx1, _rx1) = channel_pair();
        let (tx2, _rx2) = channel_pair();

        let (old, _) = registry.register(3, tx1, CancellationToken::new());
        let (new, _) = registry.register(3, tx2, CancellationToken::new());

        // The old connection's close races in after the new one registered.
        assert!(!registry.unregister(3, old.id()));
        assert_eq!(registry.lookup(3).unwrap().id(), new.id());

        assert!(registry.unregister(3, new.id()));
        assert!(registry.lookup(3).is_none());

        // Two Registered events, then exactly one Unregistered.
        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, RegistryEvent::Unregistered { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_registrations_leave_one_winner() {
        let (registry, _events) = ConnectionRegistry::new();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let (_handle, superseded) = registry.register(1, tx, CancellationToken::new());
                superseded.is_some()
            }));
        }

        let mut supersessions = 0;
        for task in tasks {
            if task.await.unwrap() {
                supersessions += 1;
            }
        }

        // Exactly one winner remains; every loser was reported superseded.
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(supersessions, 31);
    }

    #[tokio::test]
    async fn overflow_cancels_the_connection() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let (handle, _) = registry.register(5, tx, token.clone());

        let frame = ServerFrame::UserStatus {
            user_id: 1,
            online: true,
        };
        assert_eq!(handle.push(&frame), Ok(()));
        // Buffer capacity 1 and nobody draining: second push overflows.
        assert_eq!(handle.push(&frame), Err(PushError::Overflow));
        assert!(token.is_cancelled());
    }
}
