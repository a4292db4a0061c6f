//! Presence tracking: online/offline transitions derived from registry
//! events, broadcast only to users who share a conversation with the
//! transitioning user.
//!
//! Offline broadcasts are delayed by a grace window and cancelled if the user
//! re-registers within it, so a normal reconnect produces zero visible
//! flicker for peers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::AbortHandle;

use crate::directory::ParticipantCache;
use crate::frame::ServerFrame;
use crate::registry::{ConnectionRegistry, UserId};

/// Default delay before an offline transition becomes visible to peers.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
}

struct PresenceEntry {
    state: PresenceState,
    last_transition: DateTime<Utc>,
    /// Pending delayed-offline task, if the user just disconnected.
    pending_offline: Option<AbortHandle>,
}

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    participants: Arc<ParticipantCache>,
    entries: DashMap<UserId, PresenceEntry>,
    grace: Duration,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        participants: Arc<ParticipantCache>,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            participants,
            entries: DashMap::new(),
            grace,
        })
    }

    pub fn state_of(&self, user_id: UserId) -> PresenceState {
        self.entries
            .get(&user_id)
            .map(|e| e.state)
            .unwrap_or(PresenceState::Offline)
    }

    /// A connection registered for `user_id`. `superseded` means it replaced
    /// a live connection, which is not a transition: the user never appeared
    /// offline, so peers see nothing.
    pub fn on_registered(self: &Arc<Self>, user_id: UserId, superseded: bool) {
        let mut broadcast_online = false;

        {
            let mut entry = self.entries.entry(user_id).or_insert(PresenceEntry {
                state: PresenceState::Offline,
                last_transition: Utc::now(),
                pending_offline: None,
            });

            if let Some(pending) = entry.pending_offline.take() {
                // Reconnect within the grace window: cancel the delayed
                // offline. No broadcast either way, peers saw nothing.
                pending.abort();
            } else if entry.state == PresenceState::Offline {
                entry.state = PresenceState::Online;
                entry.last_transition = Utc::now();
                broadcast_online = true;
            }
            // Still online (supersession): nothing to do.
        }

        if broadcast_online {
            tracing::debug!(user_id, superseded, "user online");
            self.broadcast(user_id, true);
        }
    }

    /// The user's connection unregistered with no replacement. Schedules the
    /// offline broadcast after the grace window.
    pub fn on_unregistered(self: &Arc<Self>, user_id: UserId) {
        let mut entry = match self.entries.get_mut(&user_id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.state != PresenceState::Online || entry.pending_offline.is_some() {
            return;
        }

        let tracker = self.clone();
        // Capture the deadline now: the spawned task may not be polled until
        // later, and the grace window starts at unregister time.
        let deadline = tokio::time::Instant::now() + self.grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracker.finalize_offline(user_id);
        });
        entry.pending_offline = Some(task.abort_handle());
    }

    /// Grace window elapsed without a re-register: make the offline
    /// transition visible.
    fn finalize_offline(self: &Arc<Self>, user_id: UserId) {
        let mut broadcast_offline = false;

        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            // Re-check: a register may have raced the timer firing.
            if entry.pending_offline.is_some() && !self.registry.is_registered(user_id) {
                entry.pending_offline = None;
                entry.state = PresenceState::Offline;
                entry.last_transition = Utc::now();
                broadcast_offline = true;
            } else {
                entry.pending_offline = None;
            }
        }

        if broadcast_offline {
            tracing::debug!(user_id, "user offline");
            self.broadcast(user_id, false);
        }
    }

    /// Push a `user_status` frame to every connected peer of `user_id`.
    fn broadcast(&self, user_id: UserId, online: bool) {
        let frame = ServerFrame::UserStatus { user_id, online };
        for peer in self.participants.peers_of(user_id) {
            if peer == user_id {
                continue;
            }
            if let Some(connection) = self.registry.lookup(peer) {
                let _ = connection.push(&frame);
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

    async fn setup() -> (
        Arc<ConnectionRegistry>,
        Arc<ParticipantCache>,
        Arc<PresenceTracker>,
    ) {
        let (registry, _events) = ConnectionRegistry::new();
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(1, 1, 2);
        let participants = Arc::new(ParticipantCache::new(directory));
        participants.resolve(1).await.unwrap();
        let tracker = PresenceTracker::new(
            registry.clone(),
            participants.clone(),
            Duration::from_secs(3),
        );
        (registry, participants, tracker)
    }

    fn connect(registry: &Arc<ConnectionRegistry>, user_id: UserId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(user_id, tx, CancellationToken::new());
        rx
    }

    fn drain_status_frames(rx: &mut mpsc::Receiver<Message>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames.push(text.to_string());
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn online_broadcast_reaches_conversation_peers_only() {
        let (registry, _participants, tracker) = setup().await;
        let mut peer_rx = connect(&registry, 2);
        let mut stranger_rx = connect(&registry, 9);

        connect(&registry, 1);
        tracker.on_registered(1, false);

        let peer_frames = drain_status_frames(&mut peer_rx);
        assert_eq!(peer_frames.len(), 1);
        assert!(peer_frames[0].contains("\"online\":true"));
        assert!(drain_status_frames(&mut stranger_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_window_is_invisible() {
        let (registry, _participants, tracker) = setup().await;
        let mut peer_rx = connect(&registry, 2);

        let user_rx = connect(&registry, 1);
        tracker.on_registered(1, false);
        drain_status_frames(&mut peer_rx); // swallow the initial online

        // Disconnect, then reconnect well inside the grace window.
        drop(user_rx);
        let handle = registry.lookup(1).unwrap();
        registry.unregister(1, handle.id());
        tracker.on_unregistered(1);

        tokio::time::advance(Duration::from_secs(1)).await;
        connect(&registry, 1);
        tracker.on_registered(1, false);

        // Let any (wrongly) scheduled offline fire.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert!(drain_status_frames(&mut peer_rx).is_empty());
        assert_eq!(tracker.state_of(1), PresenceState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_broadcast_fires_after_grace() {
        let (registry, _participants, tracker) = setup().await;
        let mut peer_rx = connect(&registry, 2);

        connect(&registry, 1);
        tracker.on_registered(1, false);
        drain_status_frames(&mut peer_rx);

        let handle = registry.lookup(1).unwrap();
        registry.unregister(1, handle.id());
        tracker.on_unregistered(1);

        // Nothing visible before the grace window elapses.
        tokio::time::advance(Duration::from_millis(2500)).await;
        tokio::task::yield_now().await;
        assert!(drain_status_frames(&mut peer_rx).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let frames = drain_status_frames(&mut peer_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"online\":false"));
        assert_eq!(tracker.state_of(1), PresenceState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn supersession_does_not_flicker() {
        let (registry, _participants, tracker) = setup().await;
        let mut peer_rx = connect(&registry, 2);

        connect(&registry, 1);
        tracker.on_registered(1, false);
        drain_status_frames(&mut peer_rx);

        // Second device takes over the connection slot.
        connect(&registry, 1);
        tracker.on_registered(1, true);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(drain_status_frames(&mut peer_rx).is_empty());
    }
}
