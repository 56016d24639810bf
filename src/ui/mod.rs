//! UI state projection: a closed sum type over everything the control
//! surface can show, derived from an engine snapshot per render cycle.

use crate::model::{PlaybackState, SessionSnapshot, SongRecord};

pub mod render;
pub mod updater;

pub use render::render;
pub use updater::{UiUpdate, UiUpdater};

/// What an embed needs to know about the current track.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingView {
    pub title: String,
    pub artist: Option<String>,
    pub duration_ms: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub requested_by: String,
}

impl From<&SongRecord> for NowPlayingView {
    fn from(song: &SongRecord) -> Self {
        Self {
            title: song.title.clone(),
            artist: song.artist.clone(),
            duration_ms: song.duration_ms,
            thumbnail_url: song.thumbnail_url.clone(),
            requested_by: song.requested_by.display_name.clone(),
        }
    }
}

/// The tagged variant the renderer pattern-matches. Each variant carries
/// only what its embed needs.
#[derive(Debug, Clone, PartialEq)]
pub enum UiState {
    Querying {
        query: Option<String>,
        gif_url: Option<String>,
    },
    Loading {
        title: Option<String>,
        gif_url: Option<String>,
    },
    Playing {
        now: NowPlayingView,
        queue_len: u64,
        volume_pct: u8,
        muted: bool,
    },
    Paused {
        now: NowPlayingView,
        queue_len: u64,
        volume_pct: u8,
        muted: bool,
    },
    Idle {
        connected: bool,
    },
    Error {
        message: String,
    },
}

impl UiState {
    /// Attach a loading GIF where the variant shows one.
    pub fn with_gif(mut self, url: Option<String>) -> Self {
        match &mut self {
            UiState::Querying { gif_url, .. } | UiState::Loading { gif_url, .. } => {
                *gif_url = url;
            }
            _ => {}
        }
        self
    }

    /// Whether shuffle makes sense right now (two or more queued songs).
    pub fn shuffle_enabled(&self) -> bool {
        matches!(
            self,
            UiState::Playing { queue_len, .. } | UiState::Paused { queue_len, .. }
                if *queue_len >= 2
        )
    }
}

/// Project an engine snapshot to the single current UI state.
pub fn derive_ui_state(snapshot: &SessionSnapshot) -> UiState {
    if let Some(message) = &snapshot.last_error {
        if snapshot.state == PlaybackState::Idle {
            return UiState::Error {
                message: message.clone(),
            };
        }
    }

    match snapshot.state {
        PlaybackState::Querying => UiState::Querying {
            query: snapshot.search_query.clone(),
            gif_url: None,
        },
        PlaybackState::Loading => UiState::Loading {
            title: snapshot.now_playing.as_ref().map(|s| s.title.clone()),
            gif_url: None,
        },
        PlaybackState::Playing => match &snapshot.now_playing {
            Some(song) => UiState::Playing {
                now: NowPlayingView::from(song),
                queue_len: snapshot.queue_total,
                volume_pct: snapshot.volume_pct,
                muted: snapshot.muted,
            },
            // A playing state without a track cannot render; treat as idle.
            None => UiState::Idle {
                connected: snapshot.connected,
            },
        },
        PlaybackState::Paused => match &snapshot.now_playing {
            Some(song) => UiState::Paused {
                now: NowPlayingView::from(song),
                queue_len: snapshot.queue_total,
                volume_pct: snapshot.volume_pct,
                muted: snapshot.muted,
            },
            None => UiState::Idle {
                connected: snapshot.connected,
            },
        },
        PlaybackState::Idle => UiState::Idle {
            connected: snapshot.connected,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_song;

    fn snapshot(state: PlaybackState) -> SessionSnapshot {
        SessionSnapshot {
            guild_id: "g1".into(),
            text_channel_id: "c1".into(),
            state,
            connected: true,
            volume_pct: 100,
            ..Default::default()
        }
    }

    #[test]
    fn every_playback_state_maps_to_exactly_one_ui_state() {
        let mut playing = snapshot(PlaybackState::Playing);
        playing.now_playing = Some(test_song("a"));

        let mut paused = snapshot(PlaybackState::Paused);
        paused.now_playing = Some(test_song("a"));

        assert!(matches!(
            derive_ui_state(&snapshot(PlaybackState::Idle)),
            UiState::Idle { connected: true }
        ));
        assert!(matches!(
            derive_ui_state(&snapshot(PlaybackState::Querying)),
            UiState::Querying { .. }
        ));
        assert!(matches!(
            derive_ui_state(&snapshot(PlaybackState::Loading)),
            UiState::Loading { .. }
        ));
        assert!(matches!(derive_ui_state(&playing), UiState::Playing { .. }));
        assert!(matches!(derive_ui_state(&paused), UiState::Paused { .. }));
    }

    #[test]
    fn idle_error_snapshot_renders_error_variant() {
        let mut snap = snapshot(PlaybackState::Idle);
        snap.last_error = Some("decode failed".into());
        assert!(matches!(derive_ui_state(&snap), UiState::Error { .. }));
    }

    #[test]
    fn playing_without_track_degrades_to_idle() {
        let snap = snapshot(PlaybackState::Playing);
        assert!(matches!(derive_ui_state(&snap), UiState::Idle { .. }));
    }

    #[test]
    fn shuffle_enablement_needs_two_queued() {
        let mut snap = snapshot(PlaybackState::Playing);
        snap.now_playing = Some(test_song("a"));
        snap.queue_total = 1;
        assert!(!derive_ui_state(&snap).shuffle_enabled());
        snap.queue_total = 2;
        assert!(derive_ui_state(&snap).shuffle_enabled());
    }
}
