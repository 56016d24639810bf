//! Persistent store: connection pool, schema bootstrap, and the trait seams
//! the in-memory subsystems consume.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, NetworkError, Result};
use crate::model::{
    AudioMetadata, GuildGifs, GuildSettings, MessageRef, MessageRole, PersistedQueueState,
    SavedPlaylist, SongRecord,
};

mod metadata_ops;
mod playlist_ops;
mod queue_ops;
mod refs_ops;
mod schema;
mod settings_ops;

/// Queue persistence: window snapshot plus the overflow continuation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn save_state(&self, guild_id: &str, state: &PersistedQueueState) -> Result<()>;
    async fn load_state(&self, guild_id: &str) -> Result<Option<PersistedQueueState>>;
    async fn push_overflow(&self, guild_id: &str, songs: &[SongRecord]) -> Result<()>;
    /// Atomically remove and return up to `limit` records, skipping ids the
    /// in-memory window has already seen.
    async fn pull_overflow(
        &self,
        guild_id: &str,
        limit: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<SongRecord>>;
    async fn overflow_count(&self, guild_id: &str) -> Result<u64>;
    async fn clear(&self, guild_id: &str) -> Result<()>;
}

/// Guild settings rows; a read miss creates the row with defaults.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_or_create(&self, guild_id: &str) -> Result<GuildSettings>;
    async fn save(&self, settings: &GuildSettings) -> Result<()>;
}

/// Durable `(guild, role) -> (channel, message)` pointers.
#[async_trait]
pub trait RefStore: Send + Sync {
    async fn get(&self, guild_id: &str, role: MessageRole) -> Result<Option<MessageRef>>;
    async fn put(&self, message_ref: &MessageRef) -> Result<()>;
    /// `role = None` removes every ref for the guild.
    async fn delete(&self, guild_id: &str, role: Option<MessageRole>) -> Result<()>;
}

/// Probe-result cache keyed by query hash.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, query_hash: &str) -> Result<Option<AudioMetadata>>;
    async fn upsert(&self, meta: &AudioMetadata) -> Result<()>;
    async fn record_play(&self, query_hash: &str) -> Result<()>;
}

/// Guild-scoped named song lists.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn save(&self, playlist: &SavedPlaylist) -> Result<()>;
    async fn load(&self, guild_id: &str, name: &str) -> Result<Option<SavedPlaylist>>;
    async fn list_names(&self, guild_id: &str) -> Result<Vec<String>>;
    async fn delete(&self, guild_id: &str, name: &str) -> Result<()>;
}

/// Per-guild loading GIF overrides.
#[async_trait]
pub trait GifStore: Send + Sync {
    async fn get(&self, guild_id: &str) -> Result<Option<GuildGifs>>;
    async fn put(&self, gifs: &GuildGifs) -> Result<()>;
}

/// Connection pool wrapper. All SQL lives in the ops modules.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect with the pool sized per configuration and bootstrap the
    /// schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .min_connections(config.min_connections())
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(db_err)?;

        schema::bootstrap(&pool).await?;
        info!(
            "database ready (pool {}..{})",
            config.min_connections(),
            config.max_connections()
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(db_err)
    }
}

#[async_trait]
impl QueueStore for Database {
    async fn save_state(&self, guild_id: &str, state: &PersistedQueueState) -> Result<()> {
        queue_ops::save_state(&self.pool, guild_id, state).await
    }

    async fn load_state(&self, guild_id: &str) -> Result<Option<PersistedQueueState>> {
        queue_ops::load_state(&self.pool, guild_id).await
    }

    async fn push_overflow(&self, guild_id: &str, songs: &[SongRecord]) -> Result<()> {
        queue_ops::push_overflow(self, guild_id, songs).await
    }

    async fn pull_overflow(
        &self,
        guild_id: &str,
        limit: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<SongRecord>> {
        queue_ops::pull_overflow(self, guild_id, limit, exclude_ids).await
    }

    async fn overflow_count(&self, guild_id: &str) -> Result<u64> {
        queue_ops::overflow_count(&self.pool, guild_id).await
    }

    async fn clear(&self, guild_id: &str) -> Result<()> {
        queue_ops::clear(&self.pool, guild_id).await
    }
}

#[async_trait]
impl SettingsStore for Database {
    async fn load_or_create(&self, guild_id: &str) -> Result<GuildSettings> {
        settings_ops::load_or_create(&self.pool, guild_id).await
    }

    async fn save(&self, settings: &GuildSettings) -> Result<()> {
        settings_ops::save(&self.pool, settings).await
    }
}

#[async_trait]
impl RefStore for Database {
    async fn get(&self, guild_id: &str, role: MessageRole) -> Result<Option<MessageRef>> {
        refs_ops::get(&self.pool, guild_id, role).await
    }

    async fn put(&self, message_ref: &MessageRef) -> Result<()> {
        refs_ops::put(&self.pool, message_ref).await
    }

    async fn delete(&self, guild_id: &str, role: Option<MessageRole>) -> Result<()> {
        refs_ops::delete(&self.pool, guild_id, role).await
    }
}

#[async_trait]
impl MetadataStore for Database {
    async fn get(&self, query_hash: &str) -> Result<Option<AudioMetadata>> {
        metadata_ops::get(&self.pool, query_hash).await
    }

    async fn upsert(&self, meta: &AudioMetadata) -> Result<()> {
        metadata_ops::upsert(&self.pool, meta).await
    }

    async fn record_play(&self, query_hash: &str) -> Result<()> {
        metadata_ops::record_play(&self.pool, query_hash).await
    }
}

#[async_trait]
impl PlaylistStore for Database {
    async fn save(&self, playlist: &SavedPlaylist) -> Result<()> {
        playlist_ops::save(&self.pool, playlist).await
    }

    async fn load(&self, guild_id: &str, name: &str) -> Result<Option<SavedPlaylist>> {
        playlist_ops::load(&self.pool, guild_id, name).await
    }

    async fn list_names(&self, guild_id: &str) -> Result<Vec<String>> {
        playlist_ops::list_names(&self.pool, guild_id).await
    }

    async fn delete(&self, guild_id: &str, name: &str) -> Result<()> {
        playlist_ops::delete(&self.pool, guild_id, name).await
    }
}

#[async_trait]
impl GifStore for Database {
    async fn get(&self, guild_id: &str) -> Result<Option<GuildGifs>> {
        playlist_ops::get_gifs(&self.pool, guild_id).await
    }

    async fn put(&self, gifs: &GuildGifs) -> Result<()> {
        playlist_ops::put_gifs(&self.pool, gifs).await
    }
}

/// Map driver errors into the crate taxonomy.
pub(crate) fn db_err(err: sqlx::Error) -> Error {
    NetworkError::ConnectionFailed {
        reason: err.to_string(),
    }
    .into()
}
