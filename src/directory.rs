//! Read-only boundary to the message store collaborator.
//!
//! The dispatcher never writes messages; the only thing it ever asks the
//! store is "who are the two participants of this conversation", and it asks
//! once per conversation. Resolved pairs feed the participant cache, which
//! doubles as the peer index used to scope presence broadcasts.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::registry::UserId;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("conversation {0} not found")]
    NotFound(i64),
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant { conversation_id: i64, user_id: UserId },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Source of conversation participant pairs. Implemented over the
/// marketplace API in production; tests substitute an in-memory map.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn participants(&self, conversation_id: i64) -> Result<(UserId, UserId), DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct ConversationRecord {
    buyer_id: UserId,
    seller_id: UserId,
}

/// Directory backed by the marketplace API's internal conversation endpoint.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConversationDirectory for HttpDirectory {
    async fn participants(&self, conversation_id: i64) -> Result<(UserId, UserId), DirectoryError> {
        let url = format!(
            "{}/internal/conversations/{}",
            self.base_url.trim_end_matches('/'),
            conversation_id
        );
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(conversation_id));
        }
        let record: ConversationRecord = response.error_for_status()?.json().await?;
        Ok((record.buyer_id, record.seller_id))
    }
}

/// Caches participant pairs and maintains the peer index: for each user, the
/// set of users they share at least one conversation with. Presence
/// broadcasts go only to this set, never to every connection.
pub struct ParticipantCache {
    directory: Arc<dyn ConversationDirectory>,
    conversations: DashMap<i64, (UserId, UserId)>,
    peers: DashMap<UserId, HashSet<UserId>>,
}

impl ParticipantCache {
    pub fn new(directory: Arc<dyn ConversationDirectory>) -> Self {
        Self {
            directory,
            conversations: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    /// Participant pair of a conversation, hitting the store only on first
    /// resolution.
    pub async fn resolve(&self, conversation_id: i64) -> Result<(UserId, UserId), DirectoryError> {
        if let Some(pair) = self.conversations.get(&conversation_id) {
            return Ok(*pair);
        }

        let pair = self.directory.participants(conversation_id).await?;
        self.conversations.insert(conversation_id, pair);
        self.link_peers(pair.0, pair.1);
        Ok(pair)
    }

    /// Record a participant pair learned from a publish event, avoiding a
    /// store round trip entirely.
    pub fn record(&self, conversation_id: i64, a: UserId, b: UserId) {
        if self.conversations.insert(conversation_id, (a, b)).is_none() {
            self.link_peers(a, b);
        }
    }

    /// The other participant of the conversation, from `user_id`'s side.
    pub async fn counterpart(
        &self,
        conversation_id: i64,
        user_id: UserId,
    ) -> Result<UserId, DirectoryError> {
        let (a, b) = self.resolve(conversation_id).await?;
        if user_id == a {
            Ok(b)
        } else if user_id == b {
            Ok(a)
        } else {
            Err(DirectoryError::NotParticipant {
                conversation_id,
                user_id,
            })
        }
    }

    /// Users sharing at least one known conversation with `user_id`.
    pub fn peers_of(&self, user_id: UserId) -> Vec<UserId> {
        self.peers
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn link_peers(&self, a: UserId, b: UserId) {
        self.peers.entry(a).or_default().insert(b);
        self.peers.entry(b).or_default().insert(a);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory directory for tests.
    pub struct MemoryDirectory {
        pub(super) conversations: DashMap<i64, (UserId, UserId)>,
    }

    impl MemoryDirectory {
        pub fn new() -> Self {
            Self {
                conversations: DashMap::new(),
            }
        }

        pub fn insert(&self, conversation_id: i64, buyer: UserId, seller: UserId) {
            self.conversations.insert(conversation_id, (buyer, seller));
        }
    }

    #[async_trait]
    impl ConversationDirectory for MemoryDirectory {
        async fn participants(
            &self,
            conversation_id: i64,
        ) -> Result<(UserId, UserId), DirectoryError> {
            self.conversations
                .get(&conversation_id)
                .map(|pair| *pair)
                .ok_or(DirectoryError::NotFound(conversation_id))
        }
    }
}
