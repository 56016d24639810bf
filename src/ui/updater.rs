//! UI updater task: receives derived states from the coordinator, enforces
//! the minimum inter-update delay, and edits the stored control surface.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chat::MessageRefManager;
use crate::config::UiConfig;
use crate::model::MessageRole;
use crate::storage::GifStore;

use super::render::{choose_gif, render};
use super::UiState;

/// One derived state bound for the guild's control surface.
#[derive(Debug, Clone)]
pub struct UiUpdate {
    pub guild_id: String,
    pub text_channel_id: String,
    pub state: UiState,
}

pub struct UiUpdater {
    refs: Arc<MessageRefManager>,
    gifs: Option<Arc<dyn GifStore>>,
    config: UiConfig,
    rx: mpsc::UnboundedReceiver<UiUpdate>,
}

impl UiUpdater {
    pub fn channel() -> (mpsc::UnboundedSender<UiUpdate>, mpsc::UnboundedReceiver<UiUpdate>) {
        mpsc::unbounded_channel()
    }

    pub fn new(
        refs: Arc<MessageRefManager>,
        gifs: Option<Arc<dyn GifStore>>,
        config: UiConfig,
        rx: mpsc::UnboundedReceiver<UiUpdate>,
    ) -> Self {
        Self {
            refs,
            gifs,
            config,
            rx,
        }
    }

    /// Consume updates until the channel closes. Updates for the same guild
    /// arriving inside the debounce window are coalesced to the newest.
    pub async fn run(mut self) {
        let min_interval = Duration::from_millis(self.config.min_update_interval_ms);
        let mut last_edit: HashMap<String, Instant> = HashMap::new();
        let mut backlog: VecDeque<UiUpdate> = VecDeque::new();

        loop {
            let mut update = match backlog.pop_front() {
                Some(update) => update,
                None => match self.rx.recv().await {
                    Some(update) => update,
                    None => break,
                },
            };

            // Coalesce: newer states for the same guild replace this one;
            // other guilds keep their order in the backlog.
            while let Ok(more) = self.rx.try_recv() {
                if more.guild_id == update.guild_id {
                    update = more;
                } else {
                    backlog.push_back(more);
                }
            }

            if let Some(at) = last_edit.get(&update.guild_id) {
                let elapsed = at.elapsed();
                if elapsed < min_interval {
                    tokio::time::sleep(min_interval - elapsed).await;
                }
            }

            let guild_id = update.guild_id.clone();
            self.apply(update).await;
            last_edit.insert(guild_id, Instant::now());
        }
        debug!("ui updater stopped");
    }

    async fn apply(&self, update: UiUpdate) {
        let UiUpdate {
            guild_id,
            text_channel_id,
            state,
        } = update;

        // Errors get their own panel; everything else drives the pinned
        // playback controls. Recovery tears the panel down.
        let (role, state) = match state {
            UiState::Error { .. } => (MessageRole::ErrorEmbed, state),
            other => (MessageRole::PlaybackControls, other),
        };
        if matches!(state, UiState::Playing { .. }) {
            self.refs
                .remove_message(&guild_id, MessageRole::ErrorEmbed)
                .await;
        }

        let state = self.attach_gif(&guild_id, state).await;
        let payload = render(&state);
        if let Err(e) = self
            .refs
            .publish(&guild_id, role, &text_channel_id, &payload)
            .await
        {
            warn!("ui update failed for guild {guild_id}: {e}");
        }
    }

    async fn attach_gif(&self, guild_id: &str, state: UiState) -> UiState {
        if !matches!(state, UiState::Querying { .. } | UiState::Loading { .. }) {
            return state;
        }

        let custom = match &self.gifs {
            Some(store) => match store.get(guild_id).await {
                Ok(Some(gifs)) if gifs.use_custom_gifs => Some(gifs.gif_urls),
                _ => None,
            },
            None => None,
        };

        // Deterministic pick so repeated renders of the same state agree.
        let seed = guild_id.bytes().map(u64::from).sum::<u64>();
        let url = choose_gif(&self.config.loading_gifs, custom.as_deref(), seed)
            .map(|s| s.to_string());
        state.with_gif(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessagePayload;
    use crate::test_utils::{FakeChatApi, MemoryStore};

    fn updater_parts() -> (
        Arc<FakeChatApi>,
        mpsc::UnboundedSender<UiUpdate>,
        tokio::task::JoinHandle<()>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(FakeChatApi::new());
        let refs = Arc::new(MessageRefManager::new(store.clone(), chat.clone()));
        let (tx, rx) = UiUpdater::channel();
        let config = UiConfig {
            min_update_interval_ms: 30,
            ..Default::default()
        };
        let updater = UiUpdater::new(refs, Some(store), config, rx);
        let handle = tokio::spawn(updater.run());
        (chat, tx, handle)
    }

    fn update(state: UiState) -> UiUpdate {
        UiUpdate {
            guild_id: "g1".into(),
            text_channel_id: "c1".into(),
            state,
        }
    }

    #[tokio::test]
    async fn bursts_are_coalesced_within_the_debounce_window() {
        let (chat, tx, handle) = updater_parts();

        // First update lands immediately; the three quick follow-ups should
        // collapse into at most two edits.
        tx.send(update(UiState::Idle { connected: false })).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(update(UiState::Querying {
            query: Some("a".into()),
            gif_url: None,
        }))
        .unwrap();
        tx.send(update(UiState::Querying {
            query: Some("b".into()),
            gif_url: None,
        }))
        .unwrap();
        tx.send(update(UiState::Idle { connected: true })).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(tx);
        handle.await.unwrap();

        let writes = chat.sent_count() + chat.edit_count();
        assert!(writes <= 3, "expected coalescing, saw {writes} writes");
        assert!(writes >= 1);
    }

    #[tokio::test]
    async fn error_goes_to_its_own_panel_and_clears_on_playing() {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(FakeChatApi::new());
        let refs = Arc::new(MessageRefManager::new(store.clone(), chat.clone()));
        let (tx, rx) = UiUpdater::channel();
        let updater = UiUpdater::new(
            refs.clone(),
            None,
            UiConfig {
                min_update_interval_ms: 1,
                ..Default::default()
            },
            rx,
        );
        let handle = tokio::spawn(updater.run());

        tx.send(update(UiState::Error {
            message: "decode failed".into(),
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(refs
            .get("g1", MessageRole::ErrorEmbed)
            .await
            .is_some());

        tx.send(update(UiState::Playing {
            now: crate::ui::NowPlayingView {
                title: "t".into(),
                artist: None,
                duration_ms: None,
                thumbnail_url: None,
                requested_by: "u".into(),
            },
            queue_len: 0,
            volume_pct: 100,
            muted: false,
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        handle.await.unwrap();

        assert!(refs.get("g1", MessageRole::ErrorEmbed).await.is_none());
    }

    #[tokio::test]
    async fn loading_state_carries_a_gif() {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(FakeChatApi::new());
        let refs = Arc::new(MessageRefManager::new(store.clone(), chat.clone()));
        let (tx, rx) = UiUpdater::channel();
        let updater = UiUpdater::new(refs, Some(store), UiConfig::default(), rx);
        let handle = tokio::spawn(updater.run());

        tx.send(update(UiState::Loading {
            title: Some("song".into()),
            gif_url: None,
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(tx);
        handle.await.unwrap();

        let last: MessagePayload = chat.last_payload().unwrap();
        assert!(last.embeds[0].image.is_some(), "loading embed missing gif");
    }
}
