//! Saved playlists and per-guild loading GIF overrides.

use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::error::{NetworkError, Result};
use crate::model::{GuildGifs, SavedPlaylist, SongRecord};

use super::db_err;

pub(super) async fn save(pool: &PgPool, playlist: &SavedPlaylist) -> Result<()> {
    let songs = serde_json::to_value(&playlist.songs).map_err(|e| {
        crate::error::Error::from(NetworkError::InvalidResponse {
            reason: format!("failed to encode playlist: {e}"),
        })
    })?;

    sqlx::query(
        r#"
        INSERT INTO saved_playlists (guild_id, playlist_name, songs, created_by)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (guild_id, playlist_name) DO UPDATE SET
            songs = EXCLUDED.songs,
            created_by = EXCLUDED.created_by
        "#,
    )
    .bind(&playlist.guild_id)
    .bind(&playlist.playlist_name)
    .bind(songs)
    .bind(&playlist.created_by)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(super) async fn load(
    pool: &PgPool,
    guild_id: &str,
    name: &str,
) -> Result<Option<SavedPlaylist>> {
    let row = sqlx::query(
        "SELECT songs, created_by FROM saved_playlists \
         WHERE guild_id = $1 AND playlist_name = $2",
    )
    .bind(guild_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let songs_value: Value = row.try_get("songs").map_err(db_err)?;
    let songs: Vec<SongRecord> = serde_json::from_value(songs_value).unwrap_or_else(|e| {
        warn!("corrupt saved playlist '{name}' for guild {guild_id}: {e}");
        Vec::new()
    });

    Ok(Some(SavedPlaylist {
        guild_id: guild_id.to_string(),
        playlist_name: name.to_string(),
        songs,
        created_by: row.try_get("created_by").map_err(db_err)?,
    }))
}

pub(super) async fn list_names(pool: &PgPool, guild_id: &str) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT playlist_name FROM saved_playlists WHERE guild_id = $1 ORDER BY playlist_name",
    )
    .bind(guild_id)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    Ok(names)
}

pub(super) async fn delete(pool: &PgPool, guild_id: &str, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM saved_playlists WHERE guild_id = $1 AND playlist_name = $2")
        .bind(guild_id)
        .bind(name)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub(super) async fn get_gifs(pool: &PgPool, guild_id: &str) -> Result<Option<GuildGifs>> {
    let row = sqlx::query("SELECT gif_urls, use_custom_gifs FROM guild_gifs WHERE guild_id = $1")
        .bind(guild_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(GuildGifs {
        guild_id: guild_id.to_string(),
        gif_urls: row.try_get("gif_urls").map_err(db_err)?,
        use_custom_gifs: row.try_get("use_custom_gifs").map_err(db_err)?,
    }))
}

pub(super) async fn put_gifs(pool: &PgPool, gifs: &GuildGifs) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO guild_gifs (guild_id, gif_urls, use_custom_gifs, last_updated)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (guild_id) DO UPDATE SET
            gif_urls = EXCLUDED.gif_urls,
            use_custom_gifs = EXCLUDED.use_custom_gifs,
            last_updated = NOW()
        "#,
    )
    .bind(&gifs.guild_id)
    .bind(&gifs.gif_urls)
    .bind(gifs.use_custom_gifs)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}
