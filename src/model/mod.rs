// Core data model shared across the engine, queue, storage and UI layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Who asked for a track. Carried on every record for attribution in embeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "avatarUrl")]
    pub avatar_url: Option<String>,
}

/// Where a record came from. Spotify tracks are bridged to a YouTube search
/// at play time, so their stream key is a search query rather than a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SongSource {
    YoutubeTrack,
    SpotifyTrack,
    Search,
}

/// A resolved, playable track. Immutable once built; preload bookkeeping
/// lives in the preloader registry, keyed by `(guild, stream_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    /// Stable content hash of the normalized query that produced this record.
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<u64>,
    #[serde(rename = "thumbnailUrl")]
    pub thumbnail_url: Option<String>,
    pub source: SongSource,
    /// Opaque playable reference accepted by the process runner: a canonical
    /// video URL, or a `ytsearch1:` query for bridged/search records.
    #[serde(rename = "streamKey")]
    pub stream_key: String,
    /// Original page URL where one exists (used for dedup).
    #[serde(rename = "sourceUrl")]
    pub source_url: Option<String>,
    #[serde(rename = "requestedBy")]
    pub requested_by: Requester,
}

/// Classified play request, produced by the dispatcher and consumed by the
/// media resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayIntentKind {
    SpotifyPlaylist,
    SpotifyTrack,
    YoutubePlaylist,
    YoutubeTrack,
    Search,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayIntent {
    pub kind: PlayIntentKind,
    pub raw: String,
}

/// Which control surface an interaction arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    SlashCommands,
    Components,
    BotControls,
}

/// Per-surface access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    ServerOwner,
    Roles,
    #[default]
    Everyone,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::ServerOwner => "server_owner",
            AccessLevel::Roles => "roles",
            AccessLevel::Everyone => "everyone",
        }
    }

    pub fn parse(value: &str) -> AccessLevel {
        match value {
            "server_owner" => AccessLevel::ServerOwner,
            "roles" => AccessLevel::Roles,
            _ => AccessLevel::Everyone,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SurfaceAccess {
    pub level: AccessLevel,
    #[serde(rename = "roleIds", default)]
    pub role_ids: Vec<String>,
}

/// How the queue is presented to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueDisplayMode {
    #[default]
    Chat,
    Menu,
}

impl QueueDisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueDisplayMode::Chat => "chat",
            QueueDisplayMode::Menu => "menu",
        }
    }

    pub fn parse(value: &str) -> QueueDisplayMode {
        match value {
            "menu" => QueueDisplayMode::Menu,
            _ => QueueDisplayMode::Chat,
        }
    }
}

/// Persisted per-guild settings. Defaults match the `guild_settings` column
/// defaults so a fresh row and an absent row behave identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildSettings {
    #[serde(rename = "guildId")]
    pub guild_id: String,
    #[serde(rename = "voiceChannelId")]
    pub voice_channel_id: Option<String>,
    #[serde(rename = "voiceTimeoutMinutes")]
    pub voice_timeout_minutes: u32,
    #[serde(rename = "queueDisplayMode")]
    pub queue_display_mode: QueueDisplayMode,
    /// 0 means no limit.
    #[serde(rename = "maxDurationSeconds")]
    pub max_duration_seconds: u32,
    #[serde(rename = "slashCommands")]
    pub slash_commands: SurfaceAccess,
    pub components: SurfaceAccess,
    #[serde(rename = "botControls")]
    pub bot_controls: SurfaceAccess,
}

impl GuildSettings {
    pub fn defaults_for(guild_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            voice_channel_id: None,
            voice_timeout_minutes: 5,
            queue_display_mode: QueueDisplayMode::Chat,
            max_duration_seconds: 900,
            slash_commands: SurfaceAccess::default(),
            components: SurfaceAccess::default(),
            bot_controls: SurfaceAccess::default(),
        }
    }

    pub fn access_for(&self, surface: Surface) -> &SurfaceAccess {
        match surface {
            Surface::SlashCommands => &self.slash_commands,
            Surface::Components => &self.components,
            Surface::BotControls => &self.bot_controls,
        }
    }

    /// Duration limit in milliseconds, `None` when unlimited.
    pub fn max_duration_ms(&self) -> Option<u64> {
        match self.max_duration_seconds {
            0 => None,
            secs => Some(u64::from(secs) * 1000),
        }
    }
}

/// Roles a stored control-surface message can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    PlaybackControls,
    QueueMessage,
    ErrorEmbed,
    LoadingMessage,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::PlaybackControls => "playback_controls",
            MessageRole::QueueMessage => "queue_message",
            MessageRole::ErrorEmbed => "error_embed",
            MessageRole::LoadingMessage => "loading_message",
        }
    }

    pub fn parse(value: &str) -> Option<MessageRole> {
        match value {
            "playback_controls" => Some(MessageRole::PlaybackControls),
            "queue_message" => Some(MessageRole::QueueMessage),
            "error_embed" => Some(MessageRole::ErrorEmbed),
            "loading_message" => Some(MessageRole::LoadingMessage),
            _ => None,
        }
    }

    pub fn all() -> [MessageRole; 4] {
        [
            MessageRole::PlaybackControls,
            MessageRole::QueueMessage,
            MessageRole::ErrorEmbed,
            MessageRole::LoadingMessage,
        ]
    }
}

/// Durable pointer to a control-surface message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    #[serde(rename = "guildId")]
    pub guild_id: String,
    pub role: MessageRole,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Cached probe result for a normalized query (`audio_metadata` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    #[serde(rename = "queryHash")]
    pub query_hash: String,
    pub title: String,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: Option<u32>,
    #[serde(rename = "thumbnailUrl")]
    pub thumbnail_url: Option<String>,
    pub uploader: Option<String>,
    #[serde(rename = "sourceUrl")]
    pub source_url: Option<String>,
    #[serde(rename = "streamUrl")]
    pub stream_url: Option<String>,
    #[serde(rename = "streamUrlExpiresAt")]
    pub stream_url_expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "playCount")]
    pub play_count: i64,
    #[serde(rename = "lastPlayedAt")]
    pub last_played_at: Option<DateTime<Utc>>,
}

impl AudioMetadata {
    /// Stream URL if present and not expired; expired URLs are treated as
    /// absent.
    pub fn fresh_stream_url(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.stream_url, self.stream_url_expires_at) {
            (Some(url), Some(expires)) if expires > now => Some(url.as_str()),
            (Some(url), None) => Some(url.as_str()),
            _ => None,
        }
    }
}

/// A guild-scoped named song list (`saved_playlists` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPlaylist {
    #[serde(rename = "guildId")]
    pub guild_id: String,
    #[serde(rename = "playlistName")]
    pub playlist_name: String,
    pub songs: Vec<SongRecord>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
}

/// Per-guild loading GIF overrides (`guild_gifs` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildGifs {
    #[serde(rename = "guildId")]
    pub guild_id: String,
    #[serde(rename = "gifUrls")]
    pub gif_urls: Vec<String>,
    #[serde(rename = "useCustomGifs")]
    pub use_custom_gifs: bool,
}

/// The jsonb shape persisted into `guild_queues`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersistedQueueState {
    #[serde(rename = "nowPlaying")]
    pub now_playing: Option<SongRecord>,
    #[serde(rename = "queueItems", default)]
    pub queue_items: Vec<SongRecord>,
    #[serde(rename = "historyItems", default)]
    pub history_items: Vec<SongRecord>,
    #[serde(rename = "volumePct")]
    pub volume_pct: u8,
    #[serde(rename = "isMuted")]
    pub is_muted: bool,
}

/// The engine's logical state. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Querying,
    Loading,
    Playing,
    Paused,
}

impl PlaybackState {
    /// Whether audio is active or about to be: the idle supervisor must not
    /// fire in these states.
    pub fn has_active_audio(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Loading)
    }
}

/// Immutable view of a `GuildSession`, published by the engine after every
/// transition. Everything the renderer and coordinator read comes from here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub guild_id: String,
    pub text_channel_id: String,
    pub voice_channel_id: Option<String>,
    pub state: PlaybackState,
    pub connected: bool,
    pub now_playing: Option<SongRecord>,
    pub queue_window: Vec<SongRecord>,
    /// Window plus overflow: the user-visible queue size.
    pub queue_total: u64,
    pub history_len: usize,
    pub pending_len: usize,
    pub volume_pct: u8,
    pub muted: bool,
    pub just_shuffled: bool,
    /// Raw query text while the state is `Querying`.
    pub search_query: Option<String>,
    /// Most recent playback error, cleared when audio next starts.
    pub last_error: Option<String>,
}

/// Collapse whitespace and case so equivalent queries hash identically.
pub fn normalize_query(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable content hash of a normalized query. Used as `SongRecord.id` and as
/// the `audio_metadata` key.
pub fn query_hash(input: &str) -> String {
    let digest = Sha256::digest(normalize_query(input).as_bytes());
    hex::encode(&digest[..16])
}

/// Human-readable duration, e.g. `3m 30s`, `1h 2m`, `45s`.
pub fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    // A whole number of minutes reads better without a trailing "0s".
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}
