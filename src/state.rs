//! Shared application state and the registry event router.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::directory::{ConversationDirectory, ParticipantCache};
use crate::dispatcher::{DeliveryDispatcher, RetryPolicy};
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, RegistryEvent};
use crate::relay::SignalRelay;

/// Shared state passed to all handlers via the axum `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub relay: Arc<SignalRelay>,
    pub participants: Arc<ParticipantCache>,
    /// Capacity of each connection's outbound buffer. Overflow closes the
    /// connection instead of back-pressuring the dispatcher.
    pub outbound_capacity: usize,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire up the subsystem around a store directory. Returns the state and
    /// the registry event stream; the caller hands the stream to
    /// [`spawn_event_router`].
    pub fn build(
        directory: Arc<dyn ConversationDirectory>,
        retry_policy: RetryPolicy,
        presence_grace: Duration,
        outbound_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (registry, events) = ConnectionRegistry::new();
        let participants = Arc::new(ParticipantCache::new(directory));
        let presence = PresenceTracker::new(registry.clone(), participants.clone(), presence_grace);
        let dispatcher =
            DeliveryDispatcher::new(registry.clone(), participants.clone(), retry_policy);
        let relay = SignalRelay::new(registry.clone(), participants.clone());

        let state = Self {
            registry,
            presence,
            dispatcher,
            relay,
            participants,
            outbound_capacity,
            started_at: Utc::now(),
        };
        (state, events)
    }
}

/// Route registry events to the presence tracker and dispatcher. A single
/// consumer preserves per-user event order, so an unregister/register pair
/// can never be observed inverted.
pub fn spawn_event_router(
    state: AppState,
    mut events: mpsc::UnboundedReceiver<RegistryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Registered { user_id, superseded } => {
                    state.presence.on_registered(user_id, superseded);
                }
                RegistryEvent::Unregistered { user_id } => {
                    state.dispatcher.connection_closed(user_id);
                    state.presence.on_unregistered(user_id);
                }
            }
        }
    })
}
