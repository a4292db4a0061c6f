//! Publish bridge: subscription to the broker channel the marketplace API
//! publishes to after persisting a message.
//!
//! The API publishes one flat JSON record per persisted message on the
//! `new_message` Redis channel. This module decodes those records and feeds
//! them to the dispatcher in arrival order. A lost broker connection is
//! retried with capped exponential backoff; it is never fatal to the
//! process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::frame::DeliveryFrame;
use crate::registry::UserId;

/// Broker channel the marketplace API publishes new messages to.
pub const NEW_MESSAGE_CHANNEL: &str = "new_message";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("broker: {0}")]
    Broker(#[from] redis::RedisError),
}

/// One persisted message, as published by the API. Field names are the wire
/// contract with the publisher and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageEvent {
    pub message_id: String,
    pub conversation_id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_title: Option<String>,
}

impl NewMessageEvent {
    pub fn into_frame(self) -> DeliveryFrame {
        DeliveryFrame {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            content: self.content,
            created_at: self.created_at,
            sender_name: self.sender_name,
            listing_id: self.listing_id,
            listing_title: self.listing_title,
        }
    }
}

/// Subscribe to the broker and forward decoded events until `events` has no
/// receiver left. Reconnects forever with capped backoff.
pub async fn run_subscriber(redis_url: String, events: mpsc::UnboundedSender<NewMessageEvent>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match subscribe_once(&redis_url, &events).await {
            Ok(()) => {
                // Channel closed from our side: we are shutting down.
                if events.is_closed() {
                    return;
                }
                tracing::warn!("broker subscription ended, resubscribing");
                backoff = INITIAL_BACKOFF;
            }
            Err(err) => {
                tracing::warn!(%err, retry_in_secs = backoff.as_secs(), "broker subscription failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn subscribe_once(
    redis_url: &str,
    events: &mpsc::UnboundedSender<NewMessageEvent>,
) -> Result<(), BridgeError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(NEW_MESSAGE_CHANNEL).await?;
    tracing::info!(channel = NEW_MESSAGE_CHANNEL, "subscribed to publish bridge");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "unreadable broker payload, skipping");
                continue;
            }
        };

        match serde_json::from_str::<NewMessageEvent>(&payload) {
            Ok(event) => {
                if events.send(event).is_err() {
                    // Dispatcher is gone; stop consuming.
                    return Ok(());
                }
            }
            Err(err) => {
                // One bad record must not take the subscription down.
                tracing::warn!(%err, "malformed publish event, skipping");
            }
        }
    }

    Ok(())
}
