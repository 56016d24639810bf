//! Voice idle supervisor: per-guild timers that disconnect inactive
//! sessions. The timeout is re-read from settings when the timer fires so
//! live configuration changes are honored.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::SessionSnapshot;
use crate::settings::SettingsCache;

use super::Command;

pub struct IdleSupervisor {
    settings: Arc<SettingsCache>,
    default_timeout_minutes: u32,
    /// One timer task per idle guild.
    timers: DashMap<String, JoinHandle<()>>,
    snapshots: DashMap<String, watch::Receiver<SessionSnapshot>>,
    /// Length of a "minute" - shrunk in tests.
    minute: Duration,
}

impl IdleSupervisor {
    pub fn new(settings: Arc<SettingsCache>, default_timeout_minutes: u32) -> Arc<Self> {
        Self::with_minute(settings, default_timeout_minutes, Duration::from_secs(60))
    }

    pub fn with_minute(
        settings: Arc<SettingsCache>,
        default_timeout_minutes: u32,
        minute: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            default_timeout_minutes: default_timeout_minutes.max(1),
            timers: DashMap::new(),
            snapshots: DashMap::new(),
            minute,
        })
    }

    /// Make the guild's live snapshot available for the safety recheck.
    pub fn register_snapshot(&self, guild_id: &str, rx: watch::Receiver<SessionSnapshot>) {
        self.snapshots.insert(guild_id.to_string(), rx);
    }

    pub fn forget(&self, guild_id: &str) {
        self.clear(guild_id);
        self.snapshots.remove(guild_id);
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Arm (or re-arm) the idle timer. Fires `ExternalDisconnect` into the
    /// engine inbox unless audio came back in the meantime.
    pub fn arm(self: &Arc<Self>, guild_id: &str, cmd_tx: mpsc::UnboundedSender<Command>) {
        self.clear(guild_id);

        let this = Arc::clone(self);
        let guild = guild_id.to_string();
        let handle = tokio::spawn(async move {
            eprintln!("DEBUG: timer task started for {guild}");
            let mut slept = Duration::ZERO;
            loop {
                // Read the timeout fresh on every lap; a settings change
                // mid-countdown extends or shortens the wait.
                let minutes = this
                    .settings
                    .get(&guild)
                    .await
                    .map(|s| s.voice_timeout_minutes)
                    .unwrap_or(this.default_timeout_minutes)
                    .max(1);
                let target = this.minute * minutes;
                if slept >= target {
                    break;
                }
                let nap = target - slept;
                tokio::time::sleep(nap).await;
                slept += nap;
            }

            // Safety recheck: never cut off live audio.
            let still_idle = this
                .snapshots
                .get(&guild)
                .map(|rx| {
                    let snapshot = rx.borrow();
                    !snapshot.state.has_active_audio() && snapshot.queue_total == 0
                })
                .unwrap_or(true);

            if still_idle {
                info!("idle timeout fired for guild {guild}, disconnecting");
                let _ = cmd_tx.send(Command::ExternalDisconnect);
            } else {
                debug!("idle timeout for guild {guild} aborted by activity");
            }
            this.timers.remove(&guild);
        });

        self.timers.insert(guild_id.to_string(), handle);
    }

    /// Disarm the timer (queue became non-empty, playback resumed, explicit
    /// disconnect, or reset).
    pub fn clear(&self, guild_id: &str) {
        if let Some((_, handle)) = self.timers.remove(guild_id) {
            handle.abort();
        }
    }
}
