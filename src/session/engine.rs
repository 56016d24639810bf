//! The per-guild engine task. All `GuildSession` state lives here and is
//! mutated only between awaits of this task's own select loop.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::chat::MessagePayload;
use crate::error::Result;
use crate::media::process::DecodedArtifact;
use crate::media::resolver::Resolution;
use crate::model::{
    MessageRole, PersistedQueueState, PlayIntent, PlaybackState, Requester, SessionSnapshot,
    SongRecord,
};
use crate::queue::TrackQueue;

use super::{Command, EngineDeps, PlaybackEnd};

/// A boxed, dynamically-dispatched future that only ever has one owning
/// task polling it. `dyn Future + Send` is not `Sync` on its own, which
/// would make `Engine` itself `!Sync` and block `tokio::spawn` from
/// accepting the task that owns it; this wrapper asserts the `Sync` bound
/// the compiler needs without introducing any real cross-thread sharing.
struct AssertSync<T: ?Sized>(T);

unsafe impl<T: ?Sized> Sync for AssertSync<T> {}

impl<T> std::ops::Deref for AssertSync<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for AssertSync<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

type BoxFuture<T> = AssertSync<Pin<Box<dyn Future<Output = T> + Send>>>;
type StartOutput = Result<(DecodedArtifact, oneshot::Receiver<PlaybackEnd>)>;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

enum Next {
    Cmd(Option<Command>),
    Resolved(Result<Resolution>),
    Started(StartOutput),
    Ended(PlaybackEnd),
}

/// Context kept while a resolution is in flight, for user-facing replies.
struct PlayContext {
    interaction_token: Option<String>,
}

pub struct Engine {
    guild_id: String,
    deps: Arc<EngineDeps>,
    self_tx: mpsc::UnboundedSender<Command>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    text_channel_id: String,
    state: PlaybackState,
    connected: bool,
    now_playing: Option<SongRecord>,
    current_artifact: Option<PathBuf>,
    history: VecDeque<SongRecord>,
    volume_pct: u8,
    muted: bool,
    just_shuffled: bool,
    search_query: Option<String>,
    last_error: Option<String>,
    torn_down: bool,

    queue: TrackQueue,

    resolving: Option<BoxFuture<Result<Resolution>>>,
    resolve_ctx: Option<PlayContext>,
    starting: Option<BoxFuture<StartOutput>>,
    end_rx: Option<oneshot::Receiver<PlaybackEnd>>,
    /// Play commands that arrived while a resolution was already running.
    staged_plays: VecDeque<Command>,
}

impl Engine {
    pub fn new(
        guild_id: &str,
        text_channel_id: &str,
        deps: Arc<EngineDeps>,
        self_tx: mpsc::UnboundedSender<Command>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let queue = TrackQueue::new(
            guild_id,
            deps.config.audio.queue_cap,
            deps.config.audio.reload_batch,
            Arc::clone(&deps.queue_store),
        );
        Self {
            guild_id: guild_id.to_string(),
            deps,
            self_tx,
            snapshot_tx,
            text_channel_id: text_channel_id.to_string(),
            state: PlaybackState::Idle,
            connected: false,
            now_playing: None,
            current_artifact: None,
            history: VecDeque::new(),
            volume_pct: 100,
            muted: false,
            just_shuffled: false,
            search_query: None,
            last_error: None,
            torn_down: false,
            queue,
            resolving: None,
            resolve_ctx: None,
            starting: None,
            end_rx: None,
            staged_plays: VecDeque::new(),
        }
    }

    /// Volume the decoder should bake in.
    fn effective_volume(&self) -> u8 {
        if self.muted {
            0
        } else {
            self.volume_pct
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            guild_id: self.guild_id.clone(),
            text_channel_id: self.text_channel_id.clone(),
            voice_channel_id: None,
            state: self.state,
            connected: self.connected,
            now_playing: self.now_playing.clone(),
            queue_window: self.queue.window_items(),
            queue_total: self.queue.total_count(),
            history_len: self.history.len(),
            pending_len: self.queue.pending_len() + self.staged_plays.len(),
            volume_pct: self.volume_pct,
            muted: self.muted,
            just_shuffled: self.just_shuffled,
            search_query: self.search_query.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Publish the current snapshot to watchers and the coordinator (which
    /// re-derives the UI).
    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        self.deps.coordinator.notify_engine_state(&snapshot);
    }

    async fn persist(&self) {
        let state = PersistedQueueState {
            now_playing: self.now_playing.clone(),
            queue_items: self.queue.window_items(),
            history_items: self.history.iter().cloned().collect(),
            volume_pct: self.volume_pct,
            is_muted: self.muted,
        };
        if let Err(e) = self.deps.queue_store.save_state(&self.guild_id, &state).await {
            warn!("queue persistence failed for guild {}: {e}", self.guild_id);
        }
    }

    /// Ephemeral reply through the interaction token, or a plain channel
    /// message when no token is available.
    async fn notify_user(&self, ctx: Option<&PlayContext>, text: &str) {
        let token = ctx.and_then(|c| c.interaction_token.clone());
        let chat = self.deps.chat.clone();
        let text_channel_id = self.text_channel_id.clone();
        let guild_id = self.guild_id.clone();
        let text = text.to_string();
        let result = match token {
            Some(token) => {
                chat.create_followup(&token, &MessagePayload::ephemeral_text(&text))
                    .await
            }
            None => chat
                .send_message(&text_channel_id, &MessagePayload::text(&text))
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            debug!("user notification failed for guild {guild_id}: {e}");
        }
    }

    async fn begin_preload_head(&mut self) {
        // Shuffling invalidates the notion of a stable head until the next
        // advance; do not decode ahead in that window.
        if self.just_shuffled {
            return;
        }
        let Some(head) = self.queue.head().cloned() else {
            return;
        };
        let max_ms = self
            .deps
            .settings
            .get(&self.guild_id)
            .await
            .ok()
            .and_then(|s| s.max_duration_ms());
        self.deps
            .preloader
            .begin(&self.guild_id, &head, self.effective_volume(), max_ms);
    }

    fn arm_idle_timer(&self) {
        self.deps.idle.arm(&self.guild_id, self.self_tx.clone());
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Play {
                intent,
                requester,
                interaction_token,
            } => {
                if self.resolving.is_some() {
                    // Staged behind the in-flight resolution; picked up in
                    // arrival order once it completes.
                    if self.staged_plays.len() >= self.deps.config.session.deferred_cap {
                        warn!("staged play overflow for guild {}", self.guild_id);
                        self.notify_user(
                            None,
                            "Too many pending requests, try again in a moment.",
                        )
                        .await;
                    } else {
                        self.staged_plays.push_back(Command::Play {
                            intent,
                            requester,
                            interaction_token,
                        });
                        self.publish();
                    }
                } else {
                    self.begin_resolution(intent, requester, interaction_token);
                }
            }
            Command::EnqueueResolved {
                songs,
                interaction_token,
            } => self.enqueue_resolved(songs, interaction_token).await,
            Command::Skip => self.skip().await,
            Command::Stop => self.stop().await,
            Command::Pause => self.pause().await,
            Command::Resume => self.resume().await,
            Command::Shuffle => self.shuffle().await,
            Command::SetVolume(volume) => self.set_volume(volume).await,
            Command::SetMuted(muted) => self.set_muted(muted).await,
            Command::AdvanceDueToEnd => self.advance().await,
            Command::ExternalDisconnect => {
                self.teardown(false).await;
                return Flow::Exit;
            }
            Command::AdminReset => {
                self.teardown(true).await;
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn begin_resolution(
        &mut self,
        intent: PlayIntent,
        requester: Requester,
        interaction_token: Option<String>,
    ) {
        info!(
            "resolving '{}' for guild {} ({:?})",
            intent.raw, self.guild_id, intent.kind
        );
        self.search_query = Some(intent.raw.clone());
        if self.state == PlaybackState::Idle {
            self.state = PlaybackState::Querying;
        }
        self.resolve_ctx = Some(PlayContext { interaction_token });

        let resolver = Arc::clone(&self.deps.resolver);
        let settings = Arc::clone(&self.deps.settings);
        let guild_id = self.guild_id.clone();
        self.resolving = Some(AssertSync(Box::pin(async move {
            let settings = settings.get(&guild_id).await?;
            resolver
                .resolve(&guild_id, &intent, &requester, &settings)
                .await
        })));
        self.publish();
    }

    async fn on_resolved(&mut self, result: Result<Resolution>) {
        let ctx = self.resolve_ctx.take();
        self.search_query = None;

        match result {
            Err(err) => {
                if !err.is_silent() {
                    warn!("resolution failed for guild {}: {err}", self.guild_id);
                }
                self.notify_user(ctx.as_ref(), &err.user_message()).await;
                self.recover_after_failed_resolution().await;
            }
            Ok(resolution) => {
                if resolution.songs.is_empty() {
                    self.notify_user(ctx.as_ref(), "No playable tracks found.").await;
                    self.recover_after_failed_resolution().await;
                } else {
                    self.accept_resolution(ctx.as_ref(), resolution).await;
                }
            }
        }

        // Arrival order: the earliest staged play starts resolving next.
        if let Some(Command::Play {
            intent,
            requester,
            interaction_token,
        }) = self.staged_plays.pop_front()
        {
            self.begin_resolution(intent, requester, interaction_token);
        }
    }

    async fn recover_after_failed_resolution(&mut self) {
        if self.now_playing.is_some() || self.starting.is_some() {
            // Current playback is untouched; just re-render.
            self.publish();
        } else if !self.queue.is_empty() {
            self.advance().await;
        } else {
            self.state = PlaybackState::Idle;
            self.publish();
            self.arm_idle_timer();
        }
    }

    async fn accept_resolution(&mut self, ctx: Option<&PlayContext>, resolution: Resolution) {
        if let Some(summary) = queue_summary(&resolution) {
            self.notify_user(ctx, &summary).await;
        }

        if self.starting.is_some() {
            // A track is mid-load: stage behind it, never touching the
            // currently-resolving head.
            self.queue.push_pending(resolution.songs);
            self.publish();
            return;
        }

        match self.queue.enqueue(resolution.songs).await {
            Ok(outcome) => {
                if outcome.duplicates > 0 {
                    debug!(
                        "skipped {} duplicate songs for guild {}",
                        outcome.duplicates, self.guild_id
                    );
                }
            }
            Err(e) => {
                warn!("enqueue failed for guild {}: {e}", self.guild_id);
                self.notify_user(ctx, &e.user_message()).await;
            }
        }
        self.persist().await;

        if self.now_playing.is_none() && self.starting.is_none() {
            self.start_next().await;
        } else {
            self.begin_preload_head().await;
            self.publish();
        }
    }

    /// Already-resolved records (a saved playlist) join through the normal
    /// enqueue path, duration filter included.
    async fn enqueue_resolved(
        &mut self,
        songs: Vec<SongRecord>,
        interaction_token: Option<String>,
    ) {
        let ctx = PlayContext { interaction_token };
        let max_ms = self
            .deps
            .settings
            .get(&self.guild_id)
            .await
            .ok()
            .and_then(|s| s.max_duration_ms());

        let before = songs.len();
        let songs: Vec<SongRecord> = match max_ms {
            Some(limit) => songs
                .into_iter()
                .filter(|s| s.duration_ms.map(|d| d <= limit).unwrap_or(true))
                .collect(),
            None => songs,
        };
        let dropped_over_limit = before - songs.len();

        if songs.is_empty() {
            self.notify_user(Some(&ctx), "Every track exceeded this server's duration limit.")
                .await;
            return;
        }
        let resolution = Resolution {
            songs,
            playlist_title: None,
            dropped_over_limit,
            dropped_over_cap: 0,
        };
        self.accept_resolution(Some(&ctx), resolution).await;
    }

    /// Pop the queue head and begin loading it, or go idle.
    async fn start_next(&mut self) {
        match self.queue.dequeue().await {
            Ok(Some(song)) => self.start_loading(song).await,
            Ok(None) => {
                self.state = PlaybackState::Idle;
                self.now_playing = None;
                self.publish();
                self.persist().await;
                self.arm_idle_timer();
            }
            Err(e) => {
                warn!("dequeue failed for guild {}: {e}", self.guild_id);
                self.last_error = Some(e.user_message());
                self.state = PlaybackState::Idle;
                self.publish();
                self.arm_idle_timer();
            }
        }
    }

    async fn start_loading(&mut self, song: SongRecord) {
        self.state = PlaybackState::Loading;
        self.just_shuffled = false;
        self.now_playing = Some(song.clone());

        let deps = Arc::clone(&self.deps);
        let guild_id = self.guild_id.clone();
        let volume = self.effective_volume();
        self.starting = Some(AssertSync(Box::pin(async move {
            let settings = deps.settings.get(&guild_id).await?;
            let max_ms = settings.max_duration_ms();

            let artifact = deps
                .preloader
                .obtain(&guild_id, &song, volume, max_ms)
                .await?;

            let channel = settings.voice_channel_id.clone().ok_or(
                crate::error::SessionError::NotInVoiceChannel,
            )?;
            deps.voice.connect(&guild_id, &channel).await?;
            let end_rx = deps.voice.play(&guild_id, &artifact.path).await?;
            Ok((artifact, end_rx))
        })));
        self.publish();
    }

    async fn on_started(&mut self, result: StartOutput) {
        match result {
            Ok((artifact, end_rx)) => {
                self.connected = true;
                self.current_artifact = Some(artifact.path.clone());
                self.end_rx = Some(end_rx);
                self.state = PlaybackState::Playing;
                self.last_error = None;
                self.deps.idle.clear(&self.guild_id);

                if let Some(song) = &self.now_playing {
                    info!("now playing '{}' in guild {}", song.title, self.guild_id);
                    if let Some(metadata) = &self.deps.metadata {
                        if let Err(e) = metadata.record_play(&song.id).await {
                            debug!("play count update failed: {e}");
                        }
                    }
                }

                // Songs resolved while we were loading join the queue now.
                let pending = self.queue.drain_pending();
                if !pending.is_empty() {
                    if let Err(e) = self.queue.enqueue(pending).await {
                        warn!("pending enqueue failed for guild {}: {e}", self.guild_id);
                    }
                }

                self.begin_preload_head().await;
                self.persist().await;
                self.publish();
            }
            Err(err) => {
                warn!(
                    "failed to start '{}' in guild {}: {err}",
                    self.now_playing
                        .as_ref()
                        .map(|s| s.title.as_str())
                        .unwrap_or("?"),
                    self.guild_id
                );
                self.last_error = Some(err.user_message());
                self.now_playing = None;
                if self.queue.is_empty() {
                    self.state = PlaybackState::Idle;
                    self.publish();
                    self.arm_idle_timer();
                } else {
                    self.start_next().await;
                }
            }
        }
    }

    /// The current track is done (finished, failed, or skipped): clean its
    /// artifact, record history, and move on.
    async fn advance(&mut self) {
        if let Some(path) = self.current_artifact.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        self.end_rx = None;

        if let Some(done) = self.now_playing.take() {
            self.deps
                .preloader
                .discard(&self.guild_id, &done.stream_key)
                .await;
            self.push_history(done);
        }
        self.just_shuffled = false;
        self.start_next().await;
    }

    fn push_history(&mut self, song: SongRecord) {
        self.history.push_front(song);
        let cap = self.deps.config.audio.history_cap;
        while self.history.len() > cap {
            self.history.pop_back();
        }
    }

    async fn skip(&mut self) {
        if self.now_playing.is_none() && self.starting.is_none() {
            debug!("skip with no active audio in guild {}", self.guild_id);
            return;
        }
        // Drop the end receiver first so the stopped stream cannot race a
        // second advance.
        self.end_rx = None;
        self.starting = None;
        let _ = self.deps.voice.stop(&self.guild_id).await;
        self.advance().await;
        self.persist().await;
    }

    async fn stop(&mut self) {
        // Stop lands in idle with an empty queue from any state; a second
        // stop is a no-op.
        self.resolving = None;
        self.resolve_ctx = None;
        self.starting = None;
        self.end_rx = None;
        self.staged_plays.clear();
        self.search_query = None;
        let _ = self.deps.voice.stop(&self.guild_id).await;

        if let Some(path) = self.current_artifact.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        if let Some(done) = self.now_playing.take() {
            self.deps
                .preloader
                .discard(&self.guild_id, &done.stream_key)
                .await;
            self.push_history(done);
        }
        if let Err(e) = self.queue.clear().await {
            warn!("queue clear failed for guild {}: {e}", self.guild_id);
        }
        self.deps.preloader.clear_guild(&self.guild_id).await;
        self.state = PlaybackState::Idle;
        self.persist().await;
        self.publish();
        self.arm_idle_timer();
    }

    async fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        if let Err(e) = self.deps.voice.pause(&self.guild_id).await {
            warn!("pause failed for guild {}: {e}", self.guild_id);
            return;
        }
        self.state = PlaybackState::Paused;
        self.publish();
    }

    async fn resume(&mut self) {
        if self.state != PlaybackState::Paused {
            return;
        }
        if let Err(e) = self.deps.voice.resume(&self.guild_id).await {
            warn!("resume failed for guild {}: {e}", self.guild_id);
            return;
        }
        self.state = PlaybackState::Playing;
        self.publish();
    }

    async fn shuffle(&mut self) {
        // Below two songs there is nothing to permute.
        if self.queue.len() < 2 {
            return;
        }
        if let Some(head) = self.queue.head().cloned() {
            // The decoded head is no longer the head; do not waste the file.
            self.deps
                .preloader
                .discard(&self.guild_id, &head.stream_key)
                .await;
        }
        self.queue.shuffle();
        self.just_shuffled = true;
        self.persist().await;
        self.publish();
    }

    async fn set_volume(&mut self, volume: u8) {
        let volume = volume.min(100);
        if volume == self.volume_pct {
            return;
        }
        info!(
            "volume {} -> {} for guild {}",
            self.volume_pct, volume, self.guild_id
        );
        self.volume_pct = volume;
        self.refresh_preload_volume().await;
        self.persist().await;
        self.publish();
    }

    async fn set_muted(&mut self, muted: bool) {
        if muted == self.muted {
            return;
        }
        self.muted = muted;
        self.refresh_preload_volume().await;
        self.persist().await;
        self.publish();
    }

    /// A volume change re-decodes the head preload only; the current stream
    /// keeps its baked-in volume (no mid-stream resample).
    async fn refresh_preload_volume(&mut self) {
        self.deps
            .preloader
            .invalidate_mismatched(&self.guild_id, self.effective_volume())
            .await;
        if self.state == PlaybackState::Playing || self.state == PlaybackState::Paused {
            self.begin_preload_head().await;
        }
    }

    async fn teardown(&mut self, clear_store: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!(
            "tearing down session for guild {} (reset: {clear_store})",
            self.guild_id
        );

        self.resolving = None;
        self.resolve_ctx = None;
        self.starting = None;
        self.end_rx = None;
        self.staged_plays.clear();

        let _ = self.deps.voice.stop(&self.guild_id).await;
        let _ = self.deps.voice.disconnect(&self.guild_id).await;

        if let Some(path) = self.current_artifact.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        self.deps.preloader.clear_guild(&self.guild_id).await;
        self.deps.idle.clear(&self.guild_id);

        self.now_playing = None;
        self.search_query = None;
        self.connected = false;
        self.state = PlaybackState::Idle;

        if clear_store {
            self.history.clear();
            if let Err(e) = self.queue.clear().await {
                warn!("queue clear failed for guild {}: {e}", self.guild_id);
            }
        }
        self.persist().await;
        self.publish();

        // Auxiliary surfaces go away; the pinned controls stay with their
        // final disconnected render.
        for role in [
            MessageRole::QueueMessage,
            MessageRole::ErrorEmbed,
            MessageRole::LoadingMessage,
        ] {
            self.deps.refs.clear(&self.guild_id, Some(role)).await;
        }
    }
}

/// One summary line for what a resolution queued and dropped.
fn queue_summary(resolution: &Resolution) -> Option<String> {
    let queued = resolution.songs.len();
    let mut parts = Vec::new();

    match (&resolution.playlist_title, queued) {
        (Some(title), n) => parts.push(format!("Queued {n} tracks from **{title}**")),
        (None, 1) => parts.push(format!("Queued **{}**", resolution.songs[0].title)),
        (None, n) => parts.push(format!("Queued {n} tracks")),
    }

    let mut skipped = Vec::new();
    if resolution.dropped_over_cap > 0 {
        skipped.push(format!("{} skipped (playlist cap)", resolution.dropped_over_cap));
    }
    if resolution.dropped_over_limit > 0 {
        skipped.push(format!(
            "{} skipped (duration limit)",
            resolution.dropped_over_limit
        ));
    }
    if !skipped.is_empty() {
        parts.push(skipped.join(", "));
    }

    // A clean single-track queue needs no announcement beyond the embed.
    if resolution.playlist_title.is_none() && queued == 1 && skipped.is_empty() {
        return None;
    }
    Some(parts.join(" - "))
}

async fn poll_boxed<T>(slot: &mut Option<BoxFuture<T>>) -> T {
    match slot {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn poll_end(slot: &mut Option<oneshot::Receiver<PlaybackEnd>>) -> PlaybackEnd {
    match slot {
        Some(rx) => rx.await.unwrap_or(PlaybackEnd::Failed),
        None => std::future::pending().await,
    }
}

/// Drive the engine until its inbox closes or a destroy command arrives.
pub(super) async fn run(mut engine: Engine, mut inbox: mpsc::UnboundedReceiver<Command>) {
    loop {
        let next = {
            let has_resolving = engine.resolving.is_some();
            let has_starting = engine.starting.is_some();
            let has_end = engine.end_rx.is_some();
            let Engine {
                resolving,
                starting,
                end_rx,
                ..
            } = &mut engine;

            tokio::select! {
                command = inbox.recv() => Next::Cmd(command),
                result = poll_boxed(resolving), if has_resolving => Next::Resolved(result),
                result = poll_boxed(starting), if has_starting => Next::Started(result),
                end = poll_end(end_rx), if has_end => Next::Ended(end),
            }
        };

        match next {
            Next::Cmd(None) => break,
            Next::Cmd(Some(command)) => {
                if engine.on_command(command).await == Flow::Exit {
                    return;
                }
            }
            Next::Resolved(result) => {
                engine.resolving = None;
                engine.on_resolved(result).await;
            }
            Next::Started(result) => {
                engine.starting = None;
                engine.on_started(result).await;
            }
            Next::Ended(end) => {
                engine.end_rx = None;
                if end == PlaybackEnd::Failed {
                    engine.last_error =
                        Some("Playback failed mid-stream; skipping to the next track.".to_string());
                }
                if engine.on_command(Command::AdvanceDueToEnd).await == Flow::Exit {
                    return;
                }
            }
        }
    }
    engine.teardown(false).await;
}
