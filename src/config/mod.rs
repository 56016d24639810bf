use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Error, SystemError};

/// Top-level application configuration, loaded from `application.yml` with
/// secrets overridable from the environment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CadenceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            address: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DiscordConfig {
    /// Hex-encoded Ed25519 public key used to verify interaction webhooks.
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
    #[serde(rename = "botToken", default)]
    pub bot_token: String,
    #[serde(rename = "appId", default)]
    pub app_id: String,
    /// When set, commands are registered to a single guild (development).
    #[serde(rename = "guildId", default)]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpotifyConfig {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "clientSecret", default)]
    pub client_secret: String,
    #[serde(rename = "apiTimeoutSecs")]
    pub api_timeout_secs: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_timeout_secs: 30,
        }
    }
}

impl SpotifyConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    /// Rough guild count used only for pool sizing.
    #[serde(rename = "expectedGuildCount")]
    pub expected_guild_count: u32,
    #[serde(rename = "idleTimeoutSecs")]
    pub idle_timeout_secs: u64,
    #[serde(rename = "connectTimeoutSecs")]
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            expected_guild_count: 10,
            idle_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    /// `max = clamp(2·guilds, 5, 20)`
    pub fn max_connections(&self) -> u32 {
        (self.expected_guild_count * 2).clamp(5, 20)
    }

    /// `min = clamp(guilds, 2, 5)`
    pub fn min_connections(&self) -> u32 {
        self.expected_guild_count.clamp(2, 5)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Directory for decoded temp artifacts; swept on shutdown.
    #[serde(rename = "tempDir")]
    pub temp_dir: PathBuf,
    /// In-memory queue window size.
    #[serde(rename = "queueCap")]
    pub queue_cap: usize,
    #[serde(rename = "historyCap")]
    pub history_cap: usize,
    /// Batch size pulled from the overflow store on refill.
    #[serde(rename = "reloadBatch")]
    pub reload_batch: usize,
    /// Concurrent yt-dlp/ffmpeg processes allowed per guild.
    #[serde(rename = "processCapPerGuild")]
    pub process_cap_per_guild: usize,
    #[serde(rename = "playlistTitleTimeoutSecs")]
    pub playlist_title_timeout_secs: u64,
    #[serde(rename = "playlistItemsTimeoutSecs")]
    pub playlist_items_timeout_secs: u64,
    #[serde(rename = "decodeTimeoutSecs")]
    pub decode_timeout_secs: u64,
    #[serde(rename = "probeTimeoutSecs")]
    pub probe_timeout_secs: u64,
    /// Playlist ingestion cap; excess items are dropped with a warning.
    #[serde(rename = "maxPlaylistTracks")]
    pub max_playlist_tracks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("cadence"),
            queue_cap: 3,
            history_cap: 10,
            reload_batch: 3,
            process_cap_per_guild: 2,
            playlist_title_timeout_secs: 15,
            playlist_items_timeout_secs: 45,
            decode_timeout_secs: 120,
            probe_timeout_secs: 30,
            max_playlist_tracks: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Fallback idle timeout when a guild has no settings row yet.
    #[serde(rename = "defaultVoiceTimeoutMinutes")]
    pub default_voice_timeout_minutes: u32,
    /// Bound on commands deferred while the engine is mid-resolution.
    #[serde(rename = "deferredCap")]
    pub deferred_cap: usize,
    #[serde(rename = "deferredTtlSecs")]
    pub deferred_ttl_secs: u64,
    #[serde(rename = "sweepIntervalSecs")]
    pub sweep_interval_secs: u64,
    /// Locks older than this are considered stuck and reaped.
    #[serde(rename = "lockStaleSecs")]
    pub lock_stale_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_voice_timeout_minutes: 5,
            deferred_cap: 8,
            deferred_ttl_secs: 60,
            sweep_interval_secs: 30,
            lock_stale_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(rename = "windowSecs")]
    pub window_secs: u64,
    #[serde(rename = "maxRequests")]
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            max_requests: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    /// Minimum delay between edits of the same control-surface message;
    /// intermediate states inside the window are coalesced.
    #[serde(rename = "minUpdateIntervalMs")]
    pub min_update_interval_ms: u64,
    /// Built-in loading GIF set, overridable per guild via `guild_gifs`.
    #[serde(rename = "loadingGifs")]
    pub loading_gifs: Vec<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: 100,
            loading_gifs: vec![
                "https://media.tenor.com/images/vinyl-spin.gif".to_string(),
                "https://media.tenor.com/images/equalizer-bounce.gif".to_string(),
                "https://media.tenor.com/images/cassette-loop.gif".to_string(),
            ],
        }
    }
}

impl CadenceConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: CadenceConfig =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse YAML configuration")?;
        config.apply_env();
        Ok(config)
    }

    /// Configuration with only environment-provided secrets, used when no
    /// config file exists.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Environment variables override file values for secrets.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("PUBLIC_KEY") {
            self.discord.public_key = value;
        }
        if let Ok(value) = std::env::var("BOT_TOKEN") {
            self.discord.bot_token = value;
        }
        if let Ok(value) = std::env::var("APP_ID") {
            self.discord.app_id = value;
        }
        if let Ok(value) = std::env::var("GUILD_ID") {
            self.discord.guild_id = Some(value);
        }
        if let Ok(value) = std::env::var("SPOTIFY_CLIENT_ID") {
            self.spotify.client_id = value;
        }
        if let Ok(value) = std::env::var("SPOTIFY_CLIENT_SECRET") {
            self.spotify.client_secret = value;
        }
        if let Ok(value) = std::env::var("DATABASE_URL") {
            self.database.url = value;
        }
    }

    /// Fatal-startup validation; a failure here exits with code 1.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.discord.bot_token.is_empty() {
            return Err(SystemError::Config {
                reason: "BOT_TOKEN is not set".to_string(),
            }
            .into());
        }
        if self.discord.app_id.is_empty() {
            return Err(SystemError::Config {
                reason: "APP_ID is not set".to_string(),
            }
            .into());
        }
        if self.discord.public_key.is_empty() {
            return Err(SystemError::Config {
                reason: "PUBLIC_KEY is not set".to_string(),
            }
            .into());
        }
        if self.audio.queue_cap == 0 {
            return Err(SystemError::Config {
                reason: "audio.queueCap must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
