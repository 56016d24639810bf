//! Schema bootstrap. Every statement is idempotent so startup can run them
//! unconditionally.

use sqlx::PgPool;

use crate::error::Result;

use super::db_err;

pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guild_settings (
            guild_id TEXT PRIMARY KEY,
            voice_channel_id TEXT,
            voice_timeout_minutes INT NOT NULL DEFAULT 5,
            queue_display_mode TEXT NOT NULL DEFAULT 'chat',
            slash_commands_access TEXT NOT NULL DEFAULT 'everyone',
            components_access TEXT NOT NULL DEFAULT 'everyone',
            bot_controls_access TEXT NOT NULL DEFAULT 'everyone',
            slash_commands_roles TEXT[] NOT NULL DEFAULT '{}',
            components_roles TEXT[] NOT NULL DEFAULT '{}',
            bot_controls_roles TEXT[] NOT NULL DEFAULT '{}',
            max_duration_seconds INT NOT NULL DEFAULT 900
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guild_queues (
            guild_id TEXT PRIMARY KEY,
            now_playing JSONB,
            queue_items JSONB,
            history_items JSONB,
            lazy_load_queue JSONB,
            current_playlist JSONB,
            volume JSONB,
            is_muted BOOL NOT NULL DEFAULT FALSE,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_refs (
            guild_id TEXT NOT NULL,
            type TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (guild_id, type)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio_metadata (
            query_hash TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            duration_seconds INT,
            thumbnail_url TEXT,
            uploader TEXT,
            source_url TEXT,
            stream_url TEXT,
            stream_url_expires_at TIMESTAMPTZ,
            play_count INT NOT NULL DEFAULT 0,
            last_played_at TIMESTAMPTZ,
            file_size_bytes BIGINT,
            format_info JSONB,
            additional_metadata JSONB
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS saved_playlists (
            guild_id TEXT NOT NULL,
            playlist_name TEXT NOT NULL,
            songs JSONB NOT NULL,
            created_by TEXT NOT NULL,
            UNIQUE (guild_id, playlist_name)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guild_gifs (
            guild_id TEXT PRIMARY KEY,
            gif_urls TEXT[] NOT NULL DEFAULT '{}',
            use_custom_gifs BOOL NOT NULL DEFAULT FALSE,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    Ok(())
}
