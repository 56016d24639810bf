//! Guild settings rows. A read miss creates the row so the cache layer can
//! treat "absent" and "default" identically.

use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::{AccessLevel, GuildSettings, QueueDisplayMode, SurfaceAccess};

use super::db_err;

fn from_row(row: &sqlx::postgres::PgRow) -> Result<GuildSettings> {
    let level = |column: &str| -> Result<AccessLevel> {
        let raw: String = row.try_get(column).map_err(db_err)?;
        Ok(AccessLevel::parse(&raw))
    };
    let roles = |column: &str| -> Result<Vec<String>> { row.try_get(column).map_err(db_err) };

    let mode: String = row.try_get("queue_display_mode").map_err(db_err)?;
    let timeout: i32 = row.try_get("voice_timeout_minutes").map_err(db_err)?;
    let max_duration: i32 = row.try_get("max_duration_seconds").map_err(db_err)?;

    Ok(GuildSettings {
        guild_id: row.try_get("guild_id").map_err(db_err)?,
        voice_channel_id: row.try_get("voice_channel_id").map_err(db_err)?,
        voice_timeout_minutes: timeout.max(0) as u32,
        queue_display_mode: QueueDisplayMode::parse(&mode),
        max_duration_seconds: max_duration.max(0) as u32,
        slash_commands: SurfaceAccess {
            level: level("slash_commands_access")?,
            role_ids: roles("slash_commands_roles")?,
        },
        components: SurfaceAccess {
            level: level("components_access")?,
            role_ids: roles("components_roles")?,
        },
        bot_controls: SurfaceAccess {
            level: level("bot_controls_access")?,
            role_ids: roles("bot_controls_roles")?,
        },
    })
}

pub(super) async fn load_or_create(pool: &PgPool, guild_id: &str) -> Result<GuildSettings> {
    let row = sqlx::query("SELECT * FROM guild_settings WHERE guild_id = $1")
        .bind(guild_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;

    if let Some(row) = row {
        return from_row(&row);
    }

    let defaults = GuildSettings::defaults_for(guild_id);
    save(pool, &defaults).await?;
    Ok(defaults)
}

pub(super) async fn save(pool: &PgPool, settings: &GuildSettings) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO guild_settings
            (guild_id, voice_channel_id, voice_timeout_minutes, queue_display_mode,
             slash_commands_access, components_access, bot_controls_access,
             slash_commands_roles, components_roles, bot_controls_roles,
             max_duration_seconds)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (guild_id) DO UPDATE SET
            voice_channel_id = EXCLUDED.voice_channel_id,
            voice_timeout_minutes = EXCLUDED.voice_timeout_minutes,
            queue_display_mode = EXCLUDED.queue_display_mode,
            slash_commands_access = EXCLUDED.slash_commands_access,
            components_access = EXCLUDED.components_access,
            bot_controls_access = EXCLUDED.bot_controls_access,
            slash_commands_roles = EXCLUDED.slash_commands_roles,
            components_roles = EXCLUDED.components_roles,
            bot_controls_roles = EXCLUDED.bot_controls_roles,
            max_duration_seconds = EXCLUDED.max_duration_seconds
        "#,
    )
    .bind(&settings.guild_id)
    .bind(&settings.voice_channel_id)
    .bind(settings.voice_timeout_minutes as i32)
    .bind(settings.queue_display_mode.as_str())
    .bind(settings.slash_commands.level.as_str())
    .bind(settings.components.level.as_str())
    .bind(settings.bot_controls.level.as_str())
    .bind(&settings.slash_commands.role_ids)
    .bind(&settings.components.role_ids)
    .bind(&settings.bot_controls.role_ids)
    .bind(settings.max_duration_seconds as i32)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}
