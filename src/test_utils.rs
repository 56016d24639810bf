//! Shared test infrastructure: in-memory store fakes, a fake chat API,
//! voice gateway, decoder and resolver, plus record factories.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::chat::{ChatApi, MessagePayload};
use crate::error::{Error, MediaError, PlatformError, Result, SystemError};
use crate::media::preload::Decode;
use crate::media::process::DecodedArtifact;
use crate::media::resolver::{Resolution, Resolve};
use crate::model::{
    query_hash, AudioMetadata, GuildGifs, GuildSettings, MessageRef, MessageRole,
    PersistedQueueState, PlayIntent, Requester, SavedPlaylist, SongRecord, SongSource,
};
use crate::session::{PlaybackEnd, VoiceGateway};
use crate::storage::{
    GifStore, MetadataStore, PlaylistStore, QueueStore, RefStore, SettingsStore,
};

pub fn test_requester() -> Requester {
    Requester {
        user_id: "u1".to_string(),
        display_name: "tester".to_string(),
        avatar_url: None,
    }
}

/// A deterministic YouTube-style record for queue and engine tests.
pub fn test_song(key: &str) -> SongRecord {
    let url = format!("https://youtu.be/{key}");
    SongRecord {
        id: query_hash(&url),
        title: format!("Track {key}"),
        artist: Some("Test Artist".to_string()),
        duration_ms: Some(180_000),
        thumbnail_url: None,
        source: SongSource::YoutubeTrack,
        stream_key: url.clone(),
        source_url: Some(url),
        requested_by: test_requester(),
    }
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    pub settings_loads: AtomicU32,
    fail_refs: AtomicBool,
    settings: Mutex<HashMap<String, GuildSettings>>,
    queue_states: Mutex<HashMap<String, PersistedQueueState>>,
    overflow: Mutex<HashMap<String, Vec<SongRecord>>>,
    refs: Mutex<HashMap<(String, MessageRole), MessageRef>>,
    metadata: Mutex<HashMap<String, AudioMetadata>>,
    playlists: Mutex<HashMap<(String, String), SavedPlaylist>>,
    gifs: Mutex<HashMap<String, GuildGifs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_ref_writes(&self, fail: bool) {
        self.fail_refs.store(fail, Ordering::SeqCst);
    }

    pub fn seed_settings(&self, settings: GuildSettings) {
        self.settings
            .lock()
            .unwrap()
            .insert(settings.guild_id.clone(), settings);
    }

    pub fn saved_queue_state(&self, guild_id: &str) -> Option<PersistedQueueState> {
        self.queue_states.lock().unwrap().get(guild_id).cloned()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save_state(&self, guild_id: &str, state: &PersistedQueueState) -> Result<()> {
        self.queue_states
            .lock()
            .unwrap()
            .insert(guild_id.to_string(), state.clone());
        Ok(())
    }

    async fn load_state(&self, guild_id: &str) -> Result<Option<PersistedQueueState>> {
        Ok(self.queue_states.lock().unwrap().get(guild_id).cloned())
    }

    async fn push_overflow(&self, guild_id: &str, songs: &[SongRecord]) -> Result<()> {
        self.overflow
            .lock()
            .unwrap()
            .entry(guild_id.to_string())
            .or_default()
            .extend_from_slice(songs);
        Ok(())
    }

    async fn pull_overflow(
        &self,
        guild_id: &str,
        limit: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<SongRecord>> {
        let mut overflow = self.overflow.lock().unwrap();
        let Some(items) = overflow.get_mut(guild_id) else {
            return Ok(Vec::new());
        };
        let mut taken = Vec::new();
        let mut rest = Vec::new();
        for song in items.drain(..) {
            if taken.len() < limit && !exclude_ids.contains(&song.id) {
                taken.push(song);
            } else {
                rest.push(song);
            }
        }
        *items = rest;
        Ok(taken)
    }

    async fn overflow_count(&self, guild_id: &str) -> Result<u64> {
        Ok(self
            .overflow
            .lock()
            .unwrap()
            .get(guild_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn clear(&self, guild_id: &str) -> Result<()> {
        self.overflow.lock().unwrap().remove(guild_id);
        if let Some(state) = self.queue_states.lock().unwrap().get_mut(guild_id) {
            state.now_playing = None;
            state.queue_items.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load_or_create(&self, guild_id: &str) -> Result<GuildSettings> {
        self.settings_loads.fetch_add(1, Ordering::SeqCst);
        let mut settings = self.settings.lock().unwrap();
        Ok(settings
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildSettings::defaults_for(guild_id))
            .clone())
    }

    async fn save(&self, settings: &GuildSettings) -> Result<()> {
        self.settings
            .lock()
            .unwrap()
            .insert(settings.guild_id.clone(), settings.clone());
        Ok(())
    }
}

#[async_trait]
impl RefStore for MemoryStore {
    async fn get(&self, guild_id: &str, role: MessageRole) -> Result<Option<MessageRef>> {
        Ok(self
            .refs
            .lock()
            .unwrap()
            .get(&(guild_id.to_string(), role))
            .cloned())
    }

    async fn put(&self, message_ref: &MessageRef) -> Result<()> {
        if self.fail_refs.load(Ordering::SeqCst) {
            return Err(SystemError::Filesystem {
                reason: "simulated store failure".to_string(),
            }
            .into());
        }
        self.refs.lock().unwrap().insert(
            (message_ref.guild_id.clone(), message_ref.role),
            message_ref.clone(),
        );
        Ok(())
    }

    async fn delete(&self, guild_id: &str, role: Option<MessageRole>) -> Result<()> {
        let mut refs = self.refs.lock().unwrap();
        match role {
            Some(role) => {
                refs.remove(&(guild_id.to_string(), role));
            }
            None => refs.retain(|key, _| key.0 != guild_id),
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, query_hash: &str) -> Result<Option<AudioMetadata>> {
        Ok(self.metadata.lock().unwrap().get(query_hash).cloned())
    }

    async fn upsert(&self, meta: &AudioMetadata) -> Result<()> {
        self.metadata
            .lock()
            .unwrap()
            .insert(meta.query_hash.clone(), meta.clone());
        Ok(())
    }

    async fn record_play(&self, query_hash: &str) -> Result<()> {
        if let Some(meta) = self.metadata.lock().unwrap().get_mut(query_hash) {
            meta.play_count += 1;
            meta.last_played_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl PlaylistStore for MemoryStore {
    async fn save(&self, playlist: &SavedPlaylist) -> Result<()> {
        self.playlists.lock().unwrap().insert(
            (playlist.guild_id.clone(), playlist.playlist_name.clone()),
            playlist.clone(),
        );
        Ok(())
    }

    async fn load(&self, guild_id: &str, name: &str) -> Result<Option<SavedPlaylist>> {
        Ok(self
            .playlists
            .lock()
            .unwrap()
            .get(&(guild_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_names(&self, guild_id: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .playlists
            .lock()
            .unwrap()
            .keys()
            .filter(|(g, _)| g == guild_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, guild_id: &str, name: &str) -> Result<()> {
        self.playlists
            .lock()
            .unwrap()
            .remove(&(guild_id.to_string(), name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl GifStore for MemoryStore {
    async fn get(&self, guild_id: &str) -> Result<Option<GuildGifs>> {
        Ok(self.gifs.lock().unwrap().get(guild_id).cloned())
    }

    async fn put(&self, gifs: &GuildGifs) -> Result<()> {
        self.gifs
            .lock()
            .unwrap()
            .insert(gifs.guild_id.clone(), gifs.clone());
        Ok(())
    }
}

/// Chat API fake that stores messages in memory.
#[derive(Default)]
pub struct FakeChatApi {
    next_id: AtomicU64,
    sent: AtomicUsize,
    edits: AtomicUsize,
    messages: Mutex<HashMap<(String, String), MessagePayload>>,
    followups: Mutex<Vec<MessagePayload>>,
    last: Mutex<Option<MessagePayload>>,
}

impl FakeChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn edit_count(&self) -> usize {
        self.edits.load(Ordering::SeqCst)
    }

    pub fn followups(&self) -> Vec<MessagePayload> {
        self.followups.lock().unwrap().clone()
    }

    pub fn last_payload(&self) -> Option<MessagePayload> {
        self.last.lock().unwrap().clone()
    }

    /// Simulate the messages being deleted on the platform side.
    pub fn delete_all(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn send_message(&self, channel_id: &str, payload: &MessagePayload) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .insert((channel_id.to_string(), id.clone()), payload.clone());
        *self.last.lock().unwrap() = Some(payload.clone());
        Ok(id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        let mut messages = self.messages.lock().unwrap();
        let key = (channel_id.to_string(), message_id.to_string());
        if !messages.contains_key(&key) {
            return Err(PlatformError::UnknownMessage {
                message_id: message_id.to_string(),
            }
            .into());
        }
        messages.insert(key, payload.clone());
        self.edits.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(payload.clone());
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .remove(&(channel_id.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn message_exists(&self, channel_id: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .contains_key(&(channel_id.to_string(), message_id.to_string())))
    }

    async fn create_followup(
        &self,
        _interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        self.followups.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn edit_original_response(
        &self,
        _interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        self.followups.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Decoder fake producing deterministic artifact paths without touching the
/// filesystem.
pub struct FakeDecoder {
    fail: bool,
    delay: Duration,
    pub decode_count: AtomicUsize,
}

impl FakeDecoder {
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            delay: Duration::from_millis(1),
            decode_count: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            delay: Duration::from_millis(1),
            decode_count: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn path_for(&self, song: &SongRecord) -> PathBuf {
        PathBuf::from(format!("/tmp/cadence-fake/{}.ogg", song.id))
    }
}

#[async_trait]
impl Decode for FakeDecoder {
    async fn decode_song(
        &self,
        _guild_id: &str,
        song: &SongRecord,
        volume_pct: u8,
        max_duration_ms: Option<u64>,
    ) -> Result<DecodedArtifact> {
        tokio::time::sleep(self.delay).await;
        self.decode_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MediaError::SourceUnavailable {
                reason: "simulated decode failure".to_string(),
            }
            .into());
        }
        if let (Some(duration), Some(limit)) = (song.duration_ms, max_duration_ms) {
            if duration > limit {
                return Err(MediaError::DurationLimitExceeded {
                    duration_ms: duration,
                    limit_ms: limit,
                }
                .into());
            }
        }
        Ok(DecodedArtifact {
            path: self.path_for(song),
            volume_applied_pct: volume_pct,
        })
    }
}

/// Voice gateway fake. Track ends are driven by the test via `finish`.
#[derive(Default)]
pub struct FakeVoiceGateway {
    fail_connect: AtomicBool,
    pub play_count: AtomicUsize,
    pub stop_count: AtomicUsize,
    pub pause_count: AtomicUsize,
    pub resume_count: AtomicUsize,
    connected: Mutex<HashSet<String>>,
    end_senders: Mutex<HashMap<String, oneshot::Sender<PlaybackEnd>>>,
}

impl FakeVoiceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self, guild_id: &str) -> bool {
        self.connected.lock().unwrap().contains(guild_id)
    }

    /// Report the current stream as ended.
    pub fn finish(&self, guild_id: &str, end: PlaybackEnd) {
        if let Some(tx) = self.end_senders.lock().unwrap().remove(guild_id) {
            let _ = tx.send(end);
        }
    }
}

#[async_trait]
impl VoiceGateway for FakeVoiceGateway {
    async fn connect(&self, guild_id: &str, _channel_id: &str) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(crate::error::SessionError::VoiceConnectionFailed {
                reason: "simulated connect failure".to_string(),
            }
            .into());
        }
        self.connected.lock().unwrap().insert(guild_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, guild_id: &str) -> Result<()> {
        self.connected.lock().unwrap().remove(guild_id);
        Ok(())
    }

    async fn play(
        &self,
        guild_id: &str,
        _artifact: &std::path::Path,
    ) -> Result<oneshot::Receiver<PlaybackEnd>> {
        self.play_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.end_senders
            .lock()
            .unwrap()
            .insert(guild_id.to_string(), tx);
        Ok(rx)
    }

    async fn pause(&self, _guild_id: &str) -> Result<()> {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, _guild_id: &str) -> Result<()> {
        self.resume_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, guild_id: &str) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.end_senders.lock().unwrap().remove(guild_id);
        Ok(())
    }
}

/// Resolver fake: preconfigured outcomes per raw query, with a default of
/// one search-style record.
#[derive(Default)]
pub struct FakeResolver {
    delay: Duration,
    resolutions: Mutex<HashMap<String, Resolution>>,
    errors: Mutex<HashMap<String, Error>>,
    pub resolve_count: AtomicUsize,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(&self, raw: &str, resolution: Resolution) {
        self.resolutions
            .lock()
            .unwrap()
            .insert(raw.to_string(), resolution);
    }

    pub fn fail(&self, raw: &str, error: Error) {
        self.errors.lock().unwrap().insert(raw.to_string(), error);
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(
        &self,
        _guild_id: &str,
        intent: &PlayIntent,
        requester: &Requester,
        _settings: &GuildSettings,
    ) -> Result<Resolution> {
        tokio::time::sleep(self.delay).await;
        self.resolve_count.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.errors.lock().unwrap().get(&intent.raw) {
            return Err(error.clone());
        }
        if let Some(resolution) = self.resolutions.lock().unwrap().get(&intent.raw) {
            return Ok(resolution.clone());
        }

        let mut song = test_song(&intent.raw.replace(' ', "-"));
        song.requested_by = requester.clone();
        Ok(Resolution {
            songs: vec![song],
            ..Default::default()
        })
    }
}
