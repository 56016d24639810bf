//! Guild-settings cache: a small TTL cache over the settings store with
//! write-through updates and FIFO eviction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::model::{AccessLevel, GuildSettings, Surface};
use crate::storage::SettingsStore;

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CAPACITY: usize = 50;

struct CacheEntry {
    settings: GuildSettings,
    loaded_at: Instant,
}

pub struct SettingsCache {
    store: Arc<dyn SettingsStore>,
    ttl: Duration,
    capacity: usize,
    entries: DashMap<String, CacheEntry>,
    /// Insertion order for FIFO eviction.
    order: Mutex<VecDeque<String>>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self::with_policy(store, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_policy(store: Arc<dyn SettingsStore>, ttl: Duration, capacity: usize) -> Self {
        Self {
            store,
            ttl,
            capacity,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Fetch settings, loading (and creating defaults) on a miss or an
    /// expired entry.
    pub async fn get(&self, guild_id: &str) -> Result<GuildSettings> {
        if let Some(entry) = self.entries.get(guild_id) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(entry.settings.clone());
            }
        }

        let settings = self.store.load_or_create(guild_id).await?;
        self.insert(guild_id, settings.clone()).await;
        Ok(settings)
    }

    /// Write-through update; the cached entry is invalidated rather than
    /// refreshed so the next read observes the store's view.
    pub async fn update(&self, settings: &GuildSettings) -> Result<()> {
        self.store.save(settings).await?;
        self.invalidate(&settings.guild_id);
        Ok(())
    }

    pub fn invalidate(&self, guild_id: &str) {
        self.entries.remove(guild_id);
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    async fn insert(&self, guild_id: &str, settings: GuildSettings) {
        let mut order = self.order.lock().await;
        if !self.entries.contains_key(guild_id) {
            order.push_back(guild_id.to_string());
        }
        self.entries.insert(
            guild_id.to_string(),
            CacheEntry {
                settings,
                loaded_at: Instant::now(),
            },
        );
        while self.entries.len() > self.capacity {
            let Some(evicted) = order.pop_front() else {
                break;
            };
            self.entries.remove(&evicted);
            debug!("evicted settings cache entry for guild {evicted}");
        }
    }
}

/// Caller identity for access checks.
pub struct AccessContext<'a> {
    pub user_id: &'a str,
    pub role_ids: &'a [String],
    pub is_server_owner: bool,
}

/// The boolean predicate gating every control surface.
pub fn can_use(settings: &GuildSettings, surface: Surface, ctx: &AccessContext<'_>) -> bool {
    let access = settings.access_for(surface);
    match access.level {
        AccessLevel::Everyone => true,
        AccessLevel::ServerOwner => ctx.is_server_owner,
        AccessLevel::Roles => {
            ctx.is_server_owner || ctx.role_ids.iter().any(|r| access.role_ids.contains(r))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurfaceAccess;
    use crate::test_utils::MemoryStore;
    use std::sync::atomic::Ordering;

    fn ctx<'a>(roles: &'a [String], owner: bool) -> AccessContext<'a> {
        AccessContext {
            user_id: "u1",
            role_ids: roles,
            is_server_owner: owner,
        }
    }

    #[tokio::test]
    async fn miss_creates_defaults_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let cache = SettingsCache::new(store.clone());

        let settings = cache.get("g1").await.unwrap();
        assert_eq!(settings.voice_timeout_minutes, 5);
        assert_eq!(cache.cached_len(), 1);

        let loads_before = store.settings_loads.load(Ordering::SeqCst);
        let _ = cache.get("g1").await.unwrap();
        assert_eq!(store.settings_loads.load(Ordering::SeqCst), loads_before);
    }

    #[tokio::test]
    async fn update_is_write_through_and_invalidates() {
        let store = Arc::new(MemoryStore::new());
        let cache = SettingsCache::new(store.clone());

        let mut settings = cache.get("g1").await.unwrap();
        settings.max_duration_seconds = 60;
        cache.update(&settings).await.unwrap();
        assert_eq!(cache.cached_len(), 0);

        let reloaded = cache.get("g1").await.unwrap();
        assert_eq!(reloaded.max_duration_seconds, 60);
    }

    #[tokio::test]
    async fn fifo_eviction_respects_capacity() {
        let store = Arc::new(MemoryStore::new());
        let cache = SettingsCache::with_policy(store, Duration::from_secs(300), 2);

        cache.get("g1").await.unwrap();
        cache.get("g2").await.unwrap();
        cache.get("g3").await.unwrap();

        assert_eq!(cache.cached_len(), 2);
        assert!(!cache.entries.contains_key("g1"));
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let store = Arc::new(MemoryStore::new());
        let cache = SettingsCache::with_policy(store.clone(), Duration::from_millis(10), 50);

        cache.get("g1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let loads_before = store.settings_loads.load(Ordering::SeqCst);
        cache.get("g1").await.unwrap();
        assert_eq!(store.settings_loads.load(Ordering::SeqCst), loads_before + 1);
    }

    #[test]
    fn access_predicate() {
        let mut settings = GuildSettings::defaults_for("g1");
        assert!(can_use(&settings, Surface::SlashCommands, &ctx(&[], false)));

        settings.components = SurfaceAccess {
            level: AccessLevel::ServerOwner,
            role_ids: vec![],
        };
        assert!(!can_use(&settings, Surface::Components, &ctx(&[], false)));
        assert!(can_use(&settings, Surface::Components, &ctx(&[], true)));

        settings.bot_controls = SurfaceAccess {
            level: AccessLevel::Roles,
            role_ids: vec!["dj".to_string()],
        };
        let dj = vec!["dj".to_string()];
        let other = vec!["mod".to_string()];
        assert!(can_use(&settings, Surface::BotControls, &ctx(&dj, false)));
        assert!(!can_use(&settings, Surface::BotControls, &ctx(&other, false)));
    }
}
