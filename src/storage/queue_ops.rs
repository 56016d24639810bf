//! Queue persistence: window snapshots in `queue_items`, the overflow
//! continuation in `lazy_load_queue`.

use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::error::{NetworkError, Result};
use crate::model::{PersistedQueueState, SongRecord};

use super::{db_err, Database};

fn json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        NetworkError::InvalidResponse {
            reason: format!("failed to encode queue state: {e}"),
        }
        .into()
    })
}

fn decode_songs(value: Option<Value>, guild_id: &str, column: &str) -> Vec<SongRecord> {
    match value {
        Some(v) => serde_json::from_value(v).unwrap_or_else(|e| {
            warn!("corrupt {column} for guild {guild_id}, resetting: {e}");
            Vec::new()
        }),
        None => Vec::new(),
    }
}

async fn ensure_row(pool: &PgPool, guild_id: &str) -> Result<()> {
    sqlx::query("INSERT INTO guild_queues (guild_id) VALUES ($1) ON CONFLICT (guild_id) DO NOTHING")
        .bind(guild_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub(super) async fn save_state(
    pool: &PgPool,
    guild_id: &str,
    state: &PersistedQueueState,
) -> Result<()> {
    let now_playing = match &state.now_playing {
        Some(song) => json(song)?,
        None => Value::Null,
    };

    sqlx::query(
        r#"
        INSERT INTO guild_queues
            (guild_id, now_playing, queue_items, history_items, volume, is_muted, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (guild_id) DO UPDATE SET
            now_playing = EXCLUDED.now_playing,
            queue_items = EXCLUDED.queue_items,
            history_items = EXCLUDED.history_items,
            volume = EXCLUDED.volume,
            is_muted = EXCLUDED.is_muted,
            last_updated = NOW()
        "#,
    )
    .bind(guild_id)
    .bind(now_playing)
    .bind(json(&state.queue_items)?)
    .bind(json(&state.history_items)?)
    .bind(json(&state.volume_pct)?)
    .bind(state.is_muted)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(super) async fn load_state(
    pool: &PgPool,
    guild_id: &str,
) -> Result<Option<PersistedQueueState>> {
    let row = sqlx::query(
        "SELECT now_playing, queue_items, history_items, volume, is_muted \
         FROM guild_queues WHERE guild_id = $1",
    )
    .bind(guild_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let now_playing: Option<Value> = row.try_get("now_playing").map_err(db_err)?;
    let now_playing = now_playing
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v).ok());
    let volume: Option<Value> = row.try_get("volume").map_err(db_err)?;
    let volume_pct = volume
        .and_then(|v| v.as_u64())
        .map(|v| v.min(100) as u8)
        .unwrap_or(100);

    Ok(Some(PersistedQueueState {
        now_playing,
        queue_items: decode_songs(
            row.try_get("queue_items").map_err(db_err)?,
            guild_id,
            "queue_items",
        ),
        history_items: decode_songs(
            row.try_get("history_items").map_err(db_err)?,
            guild_id,
            "history_items",
        ),
        volume_pct,
        is_muted: row.try_get("is_muted").map_err(db_err)?,
    }))
}

pub(super) async fn push_overflow(
    db: &Database,
    guild_id: &str,
    songs: &[SongRecord],
) -> Result<()> {
    if songs.is_empty() {
        return Ok(());
    }
    ensure_row(db.pool(), guild_id).await?;

    let mut tx = db.begin().await?;
    let row =
        sqlx::query("SELECT lazy_load_queue FROM guild_queues WHERE guild_id = $1 FOR UPDATE")
            .bind(guild_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

    let mut items = decode_songs(
        row.try_get("lazy_load_queue").map_err(db_err)?,
        guild_id,
        "lazy_load_queue",
    );
    items.extend_from_slice(songs);

    sqlx::query(
        "UPDATE guild_queues SET lazy_load_queue = $2, last_updated = NOW() WHERE guild_id = $1",
    )
    .bind(guild_id)
    .bind(json(&items)?)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    tx.commit().await.map_err(db_err)
}

pub(super) async fn pull_overflow(
    db: &Database,
    guild_id: &str,
    limit: usize,
    exclude_ids: &[String],
) -> Result<Vec<SongRecord>> {
    let mut tx = db.begin().await?;
    let row =
        sqlx::query("SELECT lazy_load_queue FROM guild_queues WHERE guild_id = $1 FOR UPDATE")
            .bind(guild_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

    let Some(row) = row else {
        tx.commit().await.map_err(db_err)?;
        return Ok(Vec::new());
    };

    let items = decode_songs(
        row.try_get("lazy_load_queue").map_err(db_err)?,
        guild_id,
        "lazy_load_queue",
    );

    let mut taken = Vec::new();
    let mut rest = Vec::new();
    for song in items {
        if taken.len() < limit && !exclude_ids.contains(&song.id) {
            taken.push(song);
        } else {
            rest.push(song);
        }
    }

    sqlx::query(
        "UPDATE guild_queues SET lazy_load_queue = $2, last_updated = NOW() WHERE guild_id = $1",
    )
    .bind(guild_id)
    .bind(json(&rest)?)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    tx.commit().await.map_err(db_err)?;
    Ok(taken)
}

pub(super) async fn overflow_count(pool: &PgPool, guild_id: &str) -> Result<u64> {
    let count: Option<i32> = sqlx::query_scalar(
        "SELECT COALESCE(jsonb_array_length(lazy_load_queue), 0) \
         FROM guild_queues WHERE guild_id = $1",
    )
    .bind(guild_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    Ok(count.unwrap_or(0).max(0) as u64)
}

pub(super) async fn clear(pool: &PgPool, guild_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE guild_queues SET now_playing = NULL, queue_items = '[]'::jsonb, \
         lazy_load_queue = '[]'::jsonb, last_updated = NOW() WHERE guild_id = $1",
    )
    .bind(guild_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}
