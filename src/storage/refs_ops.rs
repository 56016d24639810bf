//! Message reference rows, primary key `(guild_id, type)`.

use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::{MessageRef, MessageRole};

use super::db_err;

pub(super) async fn get(
    pool: &PgPool,
    guild_id: &str,
    role: MessageRole,
) -> Result<Option<MessageRef>> {
    let row = sqlx::query(
        "SELECT channel_id, message_id, updated_at FROM message_refs \
         WHERE guild_id = $1 AND type = $2",
    )
    .bind(guild_id)
    .bind(role.as_str())
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(MessageRef {
        guild_id: guild_id.to_string(),
        role,
        channel_id: row.try_get("channel_id").map_err(db_err)?,
        message_id: row.try_get("message_id").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    }))
}

pub(super) async fn put(pool: &PgPool, message_ref: &MessageRef) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO message_refs (guild_id, type, channel_id, message_id, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (guild_id, type) DO UPDATE SET
            channel_id = EXCLUDED.channel_id,
            message_id = EXCLUDED.message_id,
            updated_at = NOW()
        "#,
    )
    .bind(&message_ref.guild_id)
    .bind(message_ref.role.as_str())
    .bind(&message_ref.channel_id)
    .bind(&message_ref.message_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(super) async fn delete(
    pool: &PgPool,
    guild_id: &str,
    role: Option<MessageRole>,
) -> Result<()> {
    match role {
        Some(role) => {
            sqlx::query("DELETE FROM message_refs WHERE guild_id = $1 AND type = $2")
                .bind(guild_id)
                .bind(role.as_str())
                .execute(pool)
                .await
                .map_err(db_err)?;
        }
        None => {
            sqlx::query("DELETE FROM message_refs WHERE guild_id = $1")
                .bind(guild_id)
                .execute(pool)
                .await
                .map_err(db_err)?;
        }
    }
    Ok(())
}
