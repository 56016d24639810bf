//! Probe-result cache rows keyed by query hash.

use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::AudioMetadata;

use super::db_err;

pub(super) async fn get(pool: &PgPool, query_hash: &str) -> Result<Option<AudioMetadata>> {
    let row = sqlx::query(
        "SELECT query_hash, title, duration_seconds, thumbnail_url, uploader, source_url, \
         stream_url, stream_url_expires_at, play_count, last_played_at \
         FROM audio_metadata WHERE query_hash = $1",
    )
    .bind(query_hash)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let duration: Option<i32> = row.try_get("duration_seconds").map_err(db_err)?;
    let play_count: i32 = row.try_get("play_count").map_err(db_err)?;

    Ok(Some(AudioMetadata {
        query_hash: row.try_get("query_hash").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        duration_seconds: duration.map(|d| d.max(0) as u32),
        thumbnail_url: row.try_get("thumbnail_url").map_err(db_err)?,
        uploader: row.try_get("uploader").map_err(db_err)?,
        source_url: row.try_get("source_url").map_err(db_err)?,
        stream_url: row.try_get("stream_url").map_err(db_err)?,
        stream_url_expires_at: row.try_get("stream_url_expires_at").map_err(db_err)?,
        play_count: i64::from(play_count),
        last_played_at: row.try_get("last_played_at").map_err(db_err)?,
    }))
}

pub(super) async fn upsert(pool: &PgPool, meta: &AudioMetadata) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audio_metadata
            (query_hash, title, duration_seconds, thumbnail_url, uploader, source_url,
             stream_url, stream_url_expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (query_hash) DO UPDATE SET
            title = EXCLUDED.title,
            duration_seconds = EXCLUDED.duration_seconds,
            thumbnail_url = EXCLUDED.thumbnail_url,
            uploader = EXCLUDED.uploader,
            source_url = EXCLUDED.source_url,
            stream_url = EXCLUDED.stream_url,
            stream_url_expires_at = EXCLUDED.stream_url_expires_at
        "#,
    )
    .bind(&meta.query_hash)
    .bind(&meta.title)
    .bind(meta.duration_seconds.map(|d| d as i32))
    .bind(&meta.thumbnail_url)
    .bind(&meta.uploader)
    .bind(&meta.source_url)
    .bind(&meta.stream_url)
    .bind(meta.stream_url_expires_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(super) async fn record_play(pool: &PgPool, query_hash: &str) -> Result<()> {
    sqlx::query(
        "UPDATE audio_metadata SET play_count = play_count + 1, last_played_at = NOW() \
         WHERE query_hash = $1",
    )
    .bind(query_hash)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}
