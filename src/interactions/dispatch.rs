//! Interaction dispatcher: routes verified payloads to handlers, gates them
//! by guild access policy and the rate limit, and turns them into engine
//! commands. Always answers within the platform's ack window; long work is
//! handed to the engine, which updates the control surface asynchronously.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::coordinator::{LockState, Priority, StateCoordinator, TransitionSource};
use crate::media::resolver::classify;
use crate::media::{Preloader, ProcessRunner};
use crate::model::{PlaybackState, Requester, SavedPlaylist, SessionSnapshot, Surface};
use crate::session::{Command, IdleSupervisor, SessionManager};
use crate::settings::{can_use, AccessContext, SettingsCache};
use crate::storage::PlaylistStore;
use crate::ui::render::{
    volume_bar, ID_ADD_SONG, ID_ADD_SONG_INPUT, ID_ADD_SONG_MODAL, ID_PLAY_PAUSE, ID_SHUFFLE,
    ID_SKIP, ID_STOP,
};

use super::payload::{Interaction, InteractionResponse, InteractionType, User};

const VOLUME_STEP: u8 = 10;

pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    coordinator: Arc<StateCoordinator>,
    settings: Arc<SettingsCache>,
    preloader: Arc<Preloader>,
    process: Arc<ProcessRunner>,
    idle: Arc<IdleSupervisor>,
    playlists: Arc<dyn PlaylistStore>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        coordinator: Arc<StateCoordinator>,
        settings: Arc<SettingsCache>,
        preloader: Arc<Preloader>,
        process: Arc<ProcessRunner>,
        idle: Arc<IdleSupervisor>,
        playlists: Arc<dyn PlaylistStore>,
    ) -> Self {
        Self {
            sessions,
            coordinator,
            settings,
            preloader,
            process,
            idle,
            playlists,
        }
    }

    /// Route one verified interaction. Never fails: every problem becomes a
    /// user-visible ephemeral reply.
    pub async fn dispatch(&self, interaction: Interaction) -> InteractionResponse {
        match interaction.kind {
            InteractionType::Ping => InteractionResponse::pong(),
            InteractionType::ApplicationCommand => self.handle_command(interaction).await,
            InteractionType::MessageComponent => self.handle_component(interaction).await,
            InteractionType::ModalSubmit => self.handle_modal(interaction).await,
            InteractionType::Autocomplete => {
                InteractionResponse::ephemeral("This interaction is not supported.")
            }
        }
    }

    async fn gate(
        &self,
        interaction: &Interaction,
        guild_id: &str,
        surface: Surface,
    ) -> Option<InteractionResponse> {
        let settings = match self.settings.get(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("settings load failed for guild {guild_id}: {e}");
                return Some(InteractionResponse::ephemeral(e.user_message()));
            }
        };
        let Some(user) = interaction.acting_user() else {
            return Some(InteractionResponse::ephemeral("Could not identify you."));
        };
        let ctx = AccessContext {
            user_id: &user.id,
            role_ids: interaction.role_ids(),
            is_server_owner: interaction.is_admin(),
        };
        if !can_use(&settings, surface, &ctx) {
            return Some(InteractionResponse::ephemeral(
                "You do not have permission to use this control.",
            ));
        }
        None
    }

    async fn handle_command(&self, interaction: Interaction) -> InteractionResponse {
        let Some(guild_id) = interaction.guild_id.clone() else {
            return InteractionResponse::ephemeral("This command only works in a server.");
        };
        if let Some(denied) = self.gate(&interaction, &guild_id, Surface::SlashCommands).await {
            return denied;
        }
        let Some(name) = interaction.command_name().map(str::to_string) else {
            return InteractionResponse::ephemeral("Unknown interaction.");
        };

        match name.as_str() {
            "play" => self.handle_play(&guild_id, &interaction).await,
            "skip" => self.control(&guild_id, &interaction, Command::Skip, "Skipping.").await,
            "stop" => {
                self.control(&guild_id, &interaction, Command::Stop, "Stopped playback.")
                    .await
            }
            "pause" => self.control(&guild_id, &interaction, Command::Pause, "Paused.").await,
            "resume" => {
                self.control(&guild_id, &interaction, Command::Resume, "Resuming.")
                    .await
            }
            "shuffle" => {
                self.control(&guild_id, &interaction, Command::Shuffle, "Shuffled the queue.")
                    .await
            }
            "reset" => {
                if !interaction.is_admin() {
                    return InteractionResponse::ephemeral(
                        "Only administrators can reset the session.",
                    );
                }
                self.control(&guild_id, &interaction, Command::AdminReset, "Session reset.")
                    .await
            }
            "components" => self.refresh_controls(&guild_id, &interaction).await,
            "memory" => self.diagnostics(&guild_id),
            "saveplaylist" => self.save_playlist(&guild_id, &interaction).await,
            "loadplaylist" => self.load_playlist(&guild_id, &interaction).await,
            "volumeup" => self.adjust_volume(&guild_id, &interaction, VolumeChange::Up).await,
            "volumedown" => {
                self.adjust_volume(&guild_id, &interaction, VolumeChange::Down)
                    .await
            }
            "mute" => self.adjust_volume(&guild_id, &interaction, VolumeChange::ToggleMute).await,
            "volumetest" => {
                let snapshot = self.sessions.snapshot(&guild_id).unwrap_or_default();
                InteractionResponse::ephemeral(volume_bar(
                    if snapshot.guild_id.is_empty() {
                        100
                    } else {
                        snapshot.volume_pct
                    },
                    snapshot.muted,
                ))
            }
            other => {
                debug!("unknown slash command '{other}' in guild {guild_id}");
                InteractionResponse::ephemeral("Unknown interaction.")
            }
        }
    }

    async fn handle_component(&self, interaction: Interaction) -> InteractionResponse {
        let Some(guild_id) = interaction.guild_id.clone() else {
            return InteractionResponse::ephemeral("These controls only work in a server.");
        };
        let Some(custom_id) = interaction.custom_id().map(str::to_string) else {
            return InteractionResponse::ephemeral("That control is not recognized.");
        };

        let surface = if custom_id == ID_ADD_SONG {
            Surface::Components
        } else {
            Surface::BotControls
        };
        if let Some(denied) = self.gate(&interaction, &guild_id, surface).await {
            return denied;
        }

        match custom_id.as_str() {
            ID_ADD_SONG => InteractionResponse::add_song_modal(ID_ADD_SONG_MODAL, ID_ADD_SONG_INPUT),
            ID_PLAY_PAUSE => {
                let Some(snapshot) = self.sessions.snapshot(&guild_id) else {
                    return InteractionResponse::ephemeral("Nothing is playing.");
                };
                let command = match snapshot.state {
                    PlaybackState::Playing => Command::Pause,
                    PlaybackState::Paused => Command::Resume,
                    _ => return InteractionResponse::ephemeral("Nothing is playing."),
                };
                self.press(&guild_id, &interaction, command).await
            }
            ID_SKIP => self.press(&guild_id, &interaction, Command::Skip).await,
            ID_STOP => self.press(&guild_id, &interaction, Command::Stop).await,
            ID_SHUFFLE => self.press(&guild_id, &interaction, Command::Shuffle).await,
            other => {
                // Fail closed on ids we never registered.
                debug!("unknown component '{other}' in guild {guild_id}");
                InteractionResponse::ephemeral("That control is not recognized.")
            }
        }
    }

    async fn handle_modal(&self, interaction: Interaction) -> InteractionResponse {
        let Some(guild_id) = interaction.guild_id.clone() else {
            return InteractionResponse::ephemeral("This only works in a server.");
        };
        if interaction.custom_id() != Some(ID_ADD_SONG_MODAL) {
            return InteractionResponse::ephemeral("That form is not recognized.");
        }
        if let Some(denied) = self.gate(&interaction, &guild_id, Surface::Components).await {
            return denied;
        }
        let Some(query) = interaction.modal_value(ID_ADD_SONG_INPUT) else {
            return InteractionResponse::ephemeral("Give me a song name or link.");
        };
        self.queue_play(&guild_id, &interaction, &query).await
    }

    async fn handle_play(&self, guild_id: &str, interaction: &Interaction) -> InteractionResponse {
        let raw = interaction.option_str("query").or_else(|| {
            let song = interaction.option_str("song")?;
            Some(match interaction.option_str("artist") {
                Some(artist) => format!("{song} {artist}"),
                None => song,
            })
        });
        let Some(raw) = raw else {
            return InteractionResponse::ephemeral("Give me a song name or link.");
        };
        self.queue_play(guild_id, interaction, &raw).await
    }

    /// Shared play pipeline for the slash command and the add-song modal:
    /// classify, take the querying lock when starting cold, and hand the
    /// intent to the engine in the background.
    async fn queue_play(
        &self,
        guild_id: &str,
        interaction: &Interaction,
        raw: &str,
    ) -> InteractionResponse {
        let intent = match classify(raw) {
            Ok(intent) => intent,
            Err(e) => return InteractionResponse::ephemeral(e.user_message()),
        };
        let Some(user) = interaction.acting_user() else {
            return InteractionResponse::ephemeral("Could not identify you.");
        };
        let channel_id = interaction.channel_id.clone().unwrap_or_default();
        let requester = requester_from(user);

        self.sessions.get_or_create(guild_id, &channel_id);
        let command = Command::Play {
            intent,
            requester,
            interaction_token: Some(interaction.token.clone()),
        };

        let cold_start = self
            .sessions
            .snapshot(guild_id)
            .map(|s| s.state == PlaybackState::Idle && s.now_playing.is_none())
            .unwrap_or(true);

        let result = if cold_start {
            self.coordinator
                .request_transition(
                    guild_id,
                    LockState::Querying,
                    Priority::Normal,
                    TransitionSource::User {
                        user_id: user.id.clone(),
                    },
                    command,
                )
                .map(|_| ())
        } else {
            self.coordinator
                .check_rate(guild_id, &user.id)
                .and_then(|_| self.sessions.send(guild_id, command))
        };

        match result {
            Ok(()) => InteractionResponse::ephemeral(format!("Looking for **{raw}**...")),
            Err(e) => InteractionResponse::ephemeral(e.user_message()),
        }
    }

    /// Rate-limited direct command for slash transport controls.
    async fn control(
        &self,
        guild_id: &str,
        interaction: &Interaction,
        command: Command,
        ack: &str,
    ) -> InteractionResponse {
        let Some(user) = interaction.acting_user() else {
            return InteractionResponse::ephemeral("Could not identify you.");
        };
        if let Err(e) = self.coordinator.check_rate(guild_id, &user.id) {
            return InteractionResponse::ephemeral(e.user_message());
        }
        match self.sessions.send(guild_id, command) {
            Ok(()) => InteractionResponse::ephemeral(ack),
            Err(e) => InteractionResponse::ephemeral(e.user_message()),
        }
    }

    /// Component press: silent ack, the engine re-renders the message.
    async fn press(
        &self,
        guild_id: &str,
        interaction: &Interaction,
        command: Command,
    ) -> InteractionResponse {
        let Some(user) = interaction.acting_user() else {
            return InteractionResponse::ephemeral("Could not identify you.");
        };
        if let Err(e) = self.coordinator.check_rate(guild_id, &user.id) {
            return InteractionResponse::ephemeral(e.user_message());
        }
        match self.sessions.send(guild_id, command) {
            Ok(()) => InteractionResponse::deferred_update(),
            Err(e) => InteractionResponse::ephemeral(e.user_message()),
        }
    }

    async fn adjust_volume(
        &self,
        guild_id: &str,
        interaction: &Interaction,
        change: VolumeChange,
    ) -> InteractionResponse {
        let Some(snapshot) = self.sessions.snapshot(guild_id) else {
            return InteractionResponse::ephemeral("Nothing is playing.");
        };
        let (command, ack) = match change {
            VolumeChange::Up => {
                let next = snapshot.volume_pct.saturating_add(VOLUME_STEP).min(100);
                (Command::SetVolume(next), format!("Volume {next}%"))
            }
            VolumeChange::Down => {
                let next = snapshot.volume_pct.saturating_sub(VOLUME_STEP);
                (Command::SetVolume(next), format!("Volume {next}%"))
            }
            VolumeChange::ToggleMute => {
                let next = !snapshot.muted;
                (
                    Command::SetMuted(next),
                    if next { "Muted." } else { "Unmuted." }.to_string(),
                )
            }
        };
        self.control(guild_id, interaction, command, &ack).await
    }

    /// `/components`: re-emit the control surface from the live snapshot,
    /// or post a fresh idle one.
    async fn refresh_controls(
        &self,
        guild_id: &str,
        interaction: &Interaction,
    ) -> InteractionResponse {
        let snapshot = self.sessions.snapshot(guild_id).unwrap_or_else(|| SessionSnapshot {
            guild_id: guild_id.to_string(),
            text_channel_id: interaction.channel_id.clone().unwrap_or_default(),
            volume_pct: 100,
            ..Default::default()
        });
        self.coordinator.notify_engine_state(&snapshot);
        InteractionResponse::ephemeral("Control surface refreshed.")
    }

    /// `/saveplaylist name:<x>`: snapshot the current track plus the
    /// in-memory window under a guild-scoped name.
    async fn save_playlist(&self, guild_id: &str, interaction: &Interaction) -> InteractionResponse {
        let Some(name) = interaction.option_str("name").filter(|n| !n.trim().is_empty()) else {
            return InteractionResponse::ephemeral("Give the playlist a name.");
        };
        let Some(user) = interaction.acting_user() else {
            return InteractionResponse::ephemeral("Could not identify you.");
        };
        let Some(snapshot) = self.sessions.snapshot(guild_id) else {
            return InteractionResponse::ephemeral("Nothing is queued to save.");
        };

        let mut songs = Vec::new();
        if let Some(now) = snapshot.now_playing {
            songs.push(now);
        }
        songs.extend(snapshot.queue_window);
        if songs.is_empty() {
            return InteractionResponse::ephemeral("Nothing is queued to save.");
        }

        let count = songs.len();
        let playlist = SavedPlaylist {
            guild_id: guild_id.to_string(),
            playlist_name: name.trim().to_string(),
            songs,
            created_by: user.id.clone(),
        };
        match self.playlists.save(&playlist).await {
            Ok(()) => InteractionResponse::ephemeral(format!(
                "Saved {count} tracks as **{}**.",
                playlist.playlist_name
            )),
            Err(e) => InteractionResponse::ephemeral(e.user_message()),
        }
    }

    /// `/loadplaylist name:<x>`: feed a saved list back through the engine's
    /// enqueue path (duration filter included).
    async fn load_playlist(&self, guild_id: &str, interaction: &Interaction) -> InteractionResponse {
        let Some(name) = interaction.option_str("name").filter(|n| !n.trim().is_empty()) else {
            return InteractionResponse::ephemeral("Which playlist?");
        };
        let Some(user) = interaction.acting_user() else {
            return InteractionResponse::ephemeral("Could not identify you.");
        };
        let playlist = match self.playlists.load(guild_id, name.trim()).await {
            Ok(Some(playlist)) => playlist,
            Ok(None) => {
                return InteractionResponse::ephemeral(format!(
                    "No saved playlist named **{}**.",
                    name.trim()
                ));
            }
            Err(e) => return InteractionResponse::ephemeral(e.user_message()),
        };

        if let Err(e) = self.coordinator.check_rate(guild_id, &user.id) {
            return InteractionResponse::ephemeral(e.user_message());
        }
        let channel_id = interaction.channel_id.clone().unwrap_or_default();
        let tx = self.sessions.get_or_create(guild_id, &channel_id);
        let count = playlist.songs.len();
        let command = Command::EnqueueResolved {
            songs: playlist.songs,
            interaction_token: Some(interaction.token.clone()),
        };
        match tx.send(command) {
            Ok(()) => InteractionResponse::ephemeral(format!(
                "Loading {count} tracks from **{}**...",
                name.trim()
            )),
            Err(_) => InteractionResponse::ephemeral("The session is shutting down."),
        }
    }

    /// `/memory`: process-wide resource counters.
    fn diagnostics(&self, guild_id: &str) -> InteractionResponse {
        let queue_line = self
            .sessions
            .snapshot(guild_id)
            .map(|s| {
                format!(
                    "This guild: state {:?}, queue {} (pending {}), history {}",
                    s.state, s.queue_total, s.pending_len, s.history_len
                )
            })
            .unwrap_or_else(|| "This guild: no active session".to_string());

        InteractionResponse::ephemeral(format!(
            "Sessions: {}\nPreload entries: {}\nActive subprocesses: {}\nIdle timers armed: {}\n{}",
            self.sessions.active_count(),
            self.preloader.entry_count(),
            self.process.active_count(),
            self.idle.armed_count(),
            queue_line
        ))
    }
}

enum VolumeChange {
    Up,
    Down,
    ToggleMute,
}

fn requester_from(user: &User) -> Requester {
    Requester {
        user_id: user.id.clone(),
        display_name: user.display_name().to_string(),
        avatar_url: user
            .avatar
            .as_ref()
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{hash}.png", user.id)),
    }
}
