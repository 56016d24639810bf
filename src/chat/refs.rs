//! Message reference manager: a durable `(guild, role) -> (channel, message)`
//! map with an in-memory cache, so state transitions keep editing the same
//! control surface.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{Error, PlatformError, Result};
use crate::model::{MessageRef, MessageRole};
use crate::storage::RefStore;

use super::{ChatApi, MessagePayload};

pub struct MessageRefManager {
    cache: DashMap<(String, MessageRole), MessageRef>,
    store: Arc<dyn RefStore>,
    chat: Arc<dyn ChatApi>,
}

impl MessageRefManager {
    pub fn new(store: Arc<dyn RefStore>, chat: Arc<dyn ChatApi>) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            chat,
        }
    }

    /// Cache first, then the store (populating the cache on a hit).
    pub async fn get(&self, guild_id: &str, role: MessageRole) -> Option<MessageRef> {
        let key = (guild_id.to_string(), role);
        if let Some(cached) = self.cache.get(&key) {
            return Some(cached.clone());
        }
        match self.store.get(guild_id, role).await {
            Ok(Some(stored)) => {
                self.cache.insert(key, stored.clone());
                Some(stored)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("message ref load failed for guild {guild_id}: {e}");
                None
            }
        }
    }

    /// Write-through set. On persistence failure the in-memory entry is kept
    /// and a warning logged; the surface keeps working for this process
    /// lifetime.
    pub async fn set(&self, guild_id: &str, role: MessageRole, channel_id: &str, message_id: &str) {
        let message_ref = MessageRef {
            guild_id: guild_id.to_string(),
            role,
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            updated_at: Utc::now(),
        };
        self.cache
            .insert((guild_id.to_string(), role), message_ref.clone());
        if let Err(e) = self.store.put(&message_ref).await {
            warn!("message ref persistence failed for guild {guild_id}: {e}");
        }
    }

    /// Remove one role's ref, or all of a guild's refs.
    pub async fn clear(&self, guild_id: &str, role: Option<MessageRole>) {
        match role {
            Some(role) => {
                self.cache.remove(&(guild_id.to_string(), role));
            }
            None => {
                self.cache.retain(|key, _| key.0 != guild_id);
            }
        }
        if let Err(e) = self.store.delete(guild_id, role).await {
            warn!("message ref delete failed for guild {guild_id}: {e}");
        }
    }

    /// Delete the referenced platform message (best effort) and drop the
    /// pointer. Used to tear down the error panel once audio recovers.
    pub async fn remove_message(&self, guild_id: &str, role: MessageRole) {
        if let Some(existing) = self.get(guild_id, role).await {
            if let Err(e) = self
                .chat
                .delete_message(&existing.channel_id, &existing.message_id)
                .await
            {
                debug!("could not delete {} message for guild {guild_id}: {e}", role.as_str());
            }
        }
        self.clear(guild_id, Some(role)).await;
    }

    /// Probe the platform for whether the referenced message is still
    /// editable.
    pub async fn validate(&self, message_ref: &MessageRef) -> bool {
        self.chat
            .message_exists(&message_ref.channel_id, &message_ref.message_id)
            .await
            .unwrap_or(false)
    }

    /// Edit the stored message in place, or send a fresh one and store the
    /// new pointer. This is the single write path for state-driven UI edits.
    pub async fn publish(
        &self,
        guild_id: &str,
        role: MessageRole,
        channel_id: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        if let Some(existing) = self.get(guild_id, role).await {
            match self
                .chat
                .edit_message(&existing.channel_id, &existing.message_id, payload)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Platform(
                    PlatformError::UnknownMessage { .. } | PlatformError::UnknownChannel { .. },
                )) => {
                    debug!(
                        "stored {} message for guild {guild_id} is gone, sending a new one",
                        role.as_str()
                    );
                }
                Err(other) => return Err(other),
            }
        }

        let message_id = self.chat.send_message(channel_id, payload).await?;
        self.set(guild_id, role, channel_id, &message_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeChatApi, MemoryStore};

    fn manager() -> (Arc<MemoryStore>, Arc<FakeChatApi>, MessageRefManager) {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(FakeChatApi::new());
        let manager = MessageRefManager::new(store.clone(), chat.clone());
        (store, chat, manager)
    }

    #[tokio::test]
    async fn publish_sends_then_edits_in_place() {
        let (_store, chat, manager) = manager();

        let payload = MessagePayload::text("first");
        manager
            .publish("g1", MessageRole::PlaybackControls, "chan1", &payload)
            .await
            .unwrap();
        assert_eq!(chat.sent_count(), 1);

        let payload = MessagePayload::text("second");
        manager
            .publish("g1", MessageRole::PlaybackControls, "chan1", &payload)
            .await
            .unwrap();
        // Second publish edits the stored message rather than posting anew.
        assert_eq!(chat.sent_count(), 1);
        assert_eq!(chat.edit_count(), 1);
    }

    #[tokio::test]
    async fn publish_recovers_from_deleted_message() {
        let (_store, chat, manager) = manager();

        manager
            .publish(
                "g1",
                MessageRole::PlaybackControls,
                "chan1",
                &MessagePayload::text("x"),
            )
            .await
            .unwrap();
        chat.delete_all();

        manager
            .publish(
                "g1",
                MessageRole::PlaybackControls,
                "chan1",
                &MessagePayload::text("y"),
            )
            .await
            .unwrap();
        assert_eq!(chat.sent_count(), 2);
    }

    #[tokio::test]
    async fn refs_survive_store_failure_in_memory() {
        let (store, _chat, manager) = manager();
        store.fail_ref_writes(true);

        manager
            .set("g1", MessageRole::ErrorEmbed, "chan1", "m1")
            .await;
        // The store write failed but the cached pointer still resolves.
        let cached = manager.get("g1", MessageRole::ErrorEmbed).await;
        assert_eq!(cached.unwrap().message_id, "m1");
    }

    #[tokio::test]
    async fn clear_removes_one_or_all_roles() {
        let (_store, _chat, manager) = manager();

        manager
            .set("g1", MessageRole::PlaybackControls, "chan1", "m1")
            .await;
        manager
            .set("g1", MessageRole::QueueMessage, "chan1", "m2")
            .await;

        manager.clear("g1", Some(MessageRole::QueueMessage)).await;
        assert!(manager.get("g1", MessageRole::QueueMessage).await.is_none());
        assert!(manager
            .get("g1", MessageRole::PlaybackControls)
            .await
            .is_some());

        manager.clear("g1", None).await;
        assert!(manager
            .get("g1", MessageRole::PlaybackControls)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn validate_probes_the_platform() {
        let (_store, chat, manager) = manager();
        manager
            .publish(
                "g1",
                MessageRole::PlaybackControls,
                "chan1",
                &MessagePayload::text("x"),
            )
            .await
            .unwrap();
        let message_ref = manager.get("g1", MessageRole::PlaybackControls).await.unwrap();
        assert!(manager.validate(&message_ref).await);

        chat.delete_all();
        assert!(!manager.validate(&message_ref).await);
    }
}
