//! Per-guild session engine: one task owns all mutation of a guild's
//! session, fed by a typed command inbox. Across guilds, engines run in
//! parallel.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chat::{ChatApi, MessageRefManager};
use crate::config::CadenceConfig;
use crate::coordinator::StateCoordinator;
use crate::error::{Result, SessionError};
use crate::media::resolver::Resolve;
use crate::media::Preloader;
use crate::model::{PlayIntent, Requester, SessionSnapshot};
use crate::settings::SettingsCache;
use crate::storage::{MetadataStore, QueueStore};

mod engine;
mod idle;

#[cfg(test)]
mod tests;

pub use engine::Engine;
pub use idle::IdleSupervisor;

/// Commands the engine consumes, one at a time, in arrival order.
#[derive(Debug)]
pub enum Command {
    Play {
        intent: PlayIntent,
        requester: Requester,
        /// Token for follow-up warnings (playlist drops, failures).
        interaction_token: Option<String>,
    },
    /// Enqueue already-resolved records (saved playlists); they still pass
    /// the duration filter.
    EnqueueResolved {
        songs: Vec<crate::model::SongRecord>,
        interaction_token: Option<String>,
    },
    Skip,
    Stop,
    Pause,
    Resume,
    Shuffle,
    SetVolume(u8),
    SetMuted(bool),
    /// The player finished the current stream.
    AdvanceDueToEnd,
    /// Voice connection dropped externally, or the idle timeout fired.
    ExternalDisconnect,
    /// Administrative teardown: clears persisted queue state too.
    AdminReset,
}

/// Why a stream stopped playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Finished,
    Failed,
}

/// Seam over the real-time voice connection and player, which belong to the
/// embedding process. The engine owns calls into it; nothing calls back
/// except the returned end-of-playback channel.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn connect(&self, guild_id: &str, channel_id: &str) -> Result<()>;
    async fn disconnect(&self, guild_id: &str) -> Result<()>;
    /// Begin streaming a decoded artifact. The receiver resolves when the
    /// player finishes or aborts the stream.
    async fn play(&self, guild_id: &str, artifact: &Path) -> Result<oneshot::Receiver<PlaybackEnd>>;
    async fn pause(&self, guild_id: &str) -> Result<()>;
    async fn resume(&self, guild_id: &str) -> Result<()>;
    async fn stop(&self, guild_id: &str) -> Result<()>;
}

/// Everything an engine task needs, shared across guilds.
pub struct EngineDeps {
    pub resolver: Arc<dyn Resolve>,
    pub preloader: Arc<Preloader>,
    pub queue_store: Arc<dyn QueueStore>,
    pub metadata: Option<Arc<dyn MetadataStore>>,
    pub settings: Arc<SettingsCache>,
    pub voice: Arc<dyn VoiceGateway>,
    pub coordinator: Arc<StateCoordinator>,
    pub chat: Arc<dyn ChatApi>,
    pub refs: Arc<MessageRefManager>,
    pub idle: Arc<IdleSupervisor>,
    pub config: CadenceConfig,
}

/// Standalone-mode gateway: accepted but silent. The embedding process
/// supplies the real transport; without one, sessions behave normally while
/// no audio leaves the machine and tracks never self-complete.
#[derive(Default)]
pub struct NullVoiceGateway {
    streams: DashMap<String, oneshot::Sender<PlaybackEnd>>,
}

impl NullVoiceGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl VoiceGateway for NullVoiceGateway {
    async fn connect(&self, guild_id: &str, channel_id: &str) -> Result<()> {
        info!("standalone mode: voice connect for guild {guild_id} to channel {channel_id}");
        Ok(())
    }

    async fn disconnect(&self, guild_id: &str) -> Result<()> {
        self.streams.remove(guild_id);
        Ok(())
    }

    async fn play(&self, guild_id: &str, artifact: &Path) -> Result<oneshot::Receiver<PlaybackEnd>> {
        info!(
            "standalone mode: would stream {} for guild {guild_id}",
            artifact.display()
        );
        let (tx, rx) = oneshot::channel();
        // Keep the sender alive so the engine treats the stream as ongoing.
        self.streams.insert(guild_id.to_string(), tx);
        Ok(rx)
    }

    async fn pause(&self, _guild_id: &str) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _guild_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, guild_id: &str) -> Result<()> {
        if let Some((_, tx)) = self.streams.remove(guild_id) {
            let _ = tx.send(PlaybackEnd::Finished);
        }
        Ok(())
    }
}

struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Registry of live sessions. Sessions are created on the first accepted
/// play and removed when their engine task exits.
pub struct SessionManager {
    sessions: Arc<DashMap<String, SessionHandle>>,
    deps: Arc<EngineDeps>,
}

impl SessionManager {
    pub fn new(deps: Arc<EngineDeps>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            deps,
        })
    }

    pub fn exists(&self, guild_id: &str) -> bool {
        self.sessions.contains_key(guild_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self, guild_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(guild_id)
            .map(|h| h.snapshot_rx.borrow().clone())
    }

    /// Send a command to an existing session.
    pub fn send(&self, guild_id: &str, command: Command) -> Result<()> {
        let handle = self
            .sessions
            .get(guild_id)
            .ok_or_else(|| SessionError::NoActiveSession {
                guild_id: guild_id.to_string(),
            })?;
        handle.cmd_tx.send(command).map_err(|_| {
            SessionError::NoActiveSession {
                guild_id: guild_id.to_string(),
            }
            .into()
        })
    }

    /// Get the command sender for a guild, creating and spawning the engine
    /// task on first use.
    pub fn get_or_create(
        self: &Arc<Self>,
        guild_id: &str,
        text_channel_id: &str,
    ) -> mpsc::UnboundedSender<Command> {
        // Entry-based so two racing interactions cannot double-spawn.
        let entry = self.sessions.entry(guild_id.to_string());
        let entry = match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                return occupied.get().cmd_tx.clone();
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => vacant,
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            guild_id: guild_id.to_string(),
            text_channel_id: text_channel_id.to_string(),
            volume_pct: 100,
            ..Default::default()
        });

        let engine = Engine::new(
            guild_id,
            text_channel_id,
            Arc::clone(&self.deps),
            cmd_tx.clone(),
            snapshot_tx,
        );

        self.deps.coordinator.register_inbox(guild_id, cmd_tx.clone());
        self.deps
            .idle
            .register_snapshot(guild_id, snapshot_rx.clone());

        let sessions = Arc::clone(&self.sessions);
        let coordinator = Arc::clone(&self.deps.coordinator);
        let idle = Arc::clone(&self.deps.idle);
        let guild = guild_id.to_string();
        let task = tokio::spawn(async move {
            engine::run(engine, cmd_rx).await;
            // The engine exited: drop every per-guild registration.
            sessions.remove(&guild);
            coordinator.unregister(&guild);
            idle.forget(&guild);
            info!("session destroyed for guild {guild}");
        });

        info!("session created for guild {guild_id}");
        entry.insert(SessionHandle {
            cmd_tx: cmd_tx.clone(),
            snapshot_rx,
            task,
        });
        cmd_tx
    }

    /// Tear down every session. Part of the shutdown sequence.
    pub async fn shutdown_all(&self) {
        let guilds: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for guild_id in &guilds {
            if let Err(e) = self.send(guild_id, Command::AdminReset) {
                warn!("could not reset session for guild {guild_id}: {e}");
            }
        }
        // Give engines a moment to run their teardown paths.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !self.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
