//! Pure renderer: `UiState` in, message payload out. No I/O, no clocks.

use crate::chat::payload::{
    ActionRow, Button, ButtonStyle, Embed, EmbedField, EmbedImage, MessagePayload,
};
use crate::model::format_duration_ms;

use super::UiState;

pub const COLOR_QUERYING: u32 = 0x5865F2;
pub const COLOR_LOADING: u32 = 0xFAA61A;
pub const COLOR_PLAYING: u32 = 0x57F287;
pub const COLOR_PAUSED: u32 = 0xFEE75C;
pub const COLOR_IDLE: u32 = 0x95A5A6;
pub const COLOR_ERROR: u32 = 0xED4245;

// Unified component ids. The dispatcher fails closed on anything else.
pub const ID_PLAY_PAUSE: &str = "music_play_pause";
pub const ID_SKIP: &str = "music_skip";
pub const ID_STOP: &str = "music_stop";
pub const ID_SHUFFLE: &str = "music_shuffle";
pub const ID_ADD_SONG: &str = "music_add_song";
pub const ID_ADD_SONG_MODAL: &str = "music_add_song_modal";
pub const ID_ADD_SONG_INPUT: &str = "music_add_song_query";

const VOLUME_BAR_SEGMENTS: u8 = 10;

/// Volume bar built from ten block characters, proportional to the
/// percentage. Muted renders fully hollow with a marker.
pub fn volume_bar(volume_pct: u8, muted: bool) -> String {
    if muted {
        return format!("🔇 {}", "░".repeat(VOLUME_BAR_SEGMENTS as usize));
    }
    let filled = (u32::from(volume_pct.min(100)) * u32::from(VOLUME_BAR_SEGMENTS) / 100) as usize;
    format!(
        "🔊 {}{} {volume_pct}%",
        "█".repeat(filled),
        "░".repeat(VOLUME_BAR_SEGMENTS as usize - filled)
    )
}

pub fn render(state: &UiState) -> MessagePayload {
    let embed = render_embed(state);
    let components = render_components(state);
    MessagePayload {
        content: None,
        embeds: vec![embed],
        components,
        flags: None,
    }
}

fn render_embed(state: &UiState) -> Embed {
    match state {
        UiState::Querying { query, gif_url } => Embed {
            title: Some("Searching...".to_string()),
            description: query
                .as_ref()
                .map(|q| format!("Looking for **{q}**"))
                .or_else(|| Some("Resolving your request".to_string())),
            color: Some(COLOR_QUERYING),
            image: gif_url.as_ref().map(|url| EmbedImage { url: url.clone() }),
            ..Default::default()
        },
        UiState::Loading { title, gif_url } => Embed {
            title: Some("Loading".to_string()),
            description: title
                .as_ref()
                .map(|t| format!("Warming up **{t}**"))
                .or_else(|| Some("Preparing audio".to_string())),
            color: Some(COLOR_LOADING),
            image: gif_url.as_ref().map(|url| EmbedImage { url: url.clone() }),
            ..Default::default()
        },
        UiState::Playing {
            now,
            queue_len,
            volume_pct,
            muted,
        } => now_playing_embed("Now Playing", COLOR_PLAYING, now, *queue_len, *volume_pct, *muted),
        UiState::Paused {
            now,
            queue_len,
            volume_pct,
            muted,
        } => now_playing_embed("Paused", COLOR_PAUSED, now, *queue_len, *volume_pct, *muted),
        UiState::Idle { connected } => Embed {
            title: Some("Nothing Playing".to_string()),
            description: Some(if *connected {
                "Queue something with /play or the Add Song button.".to_string()
            } else {
                "Not connected to a voice channel.".to_string()
            }),
            color: Some(COLOR_IDLE),
            ..Default::default()
        },
        UiState::Error { message } => Embed {
            title: Some("Playback Error".to_string()),
            description: Some(message.clone()),
            color: Some(COLOR_ERROR),
            ..Default::default()
        },
    }
}

fn now_playing_embed(
    title: &str,
    color: u32,
    now: &super::NowPlayingView,
    queue_len: u64,
    volume_pct: u8,
    muted: bool,
) -> Embed {
    let mut description = format!("**{}**", now.title);
    if let Some(artist) = &now.artist {
        description.push_str(&format!("\nby {artist}"));
    }

    let mut fields = vec![
        EmbedField {
            name: "Queue".to_string(),
            value: if queue_len == 0 {
                "empty".to_string()
            } else {
                format!("{queue_len} waiting")
            },
            inline: true,
        },
        EmbedField {
            name: "Volume".to_string(),
            value: volume_bar(volume_pct, muted),
            inline: true,
        },
    ];
    if let Some(duration) = now.duration_ms {
        fields.insert(
            0,
            EmbedField {
                name: "Duration".to_string(),
                value: format_duration_ms(duration),
                inline: true,
            },
        );
    }

    Embed {
        title: Some(title.to_string()),
        description: Some(description),
        color: Some(color),
        thumbnail: now
            .thumbnail_url
            .as_ref()
            .map(|url| EmbedImage { url: url.clone() }),
        fields,
        footer: Some(crate::chat::payload::EmbedFooter {
            text: format!("requested by {}", now.requested_by),
            icon_url: None,
        }),
        ..Default::default()
    }
}

fn render_components(state: &UiState) -> Vec<ActionRow> {
    let (active_audio, paused) = match state {
        UiState::Playing { .. } => (true, false),
        UiState::Paused { .. } => (true, true),
        _ => (false, false),
    };
    let shuffle_enabled = state.shuffle_enabled();

    let play_pause = Button::new(
        ID_PLAY_PAUSE,
        if paused { "Resume" } else { "Pause" },
        if paused {
            ButtonStyle::Success
        } else {
            ButtonStyle::Primary
        },
    )
    .disabled(!active_audio);

    let row = ActionRow::new(vec![
        play_pause,
        Button::new(ID_SKIP, "Skip", ButtonStyle::Secondary).disabled(!active_audio),
        Button::new(ID_STOP, "Stop", ButtonStyle::Danger).disabled(!active_audio),
        Button::new(ID_SHUFFLE, "Shuffle", ButtonStyle::Secondary).disabled(!shuffle_enabled),
        Button::new(ID_ADD_SONG, "Add Song", ButtonStyle::Success),
    ]);

    vec![row]
}

/// Pick a loading GIF deterministically so renders stay pure. Guild
/// overrides (when enabled and non-empty) win over the built-in set.
pub fn choose_gif<'a>(
    builtin: &'a [String],
    custom: Option<&'a [String]>,
    seed: u64,
) -> Option<&'a str> {
    let pool = match custom {
        Some(urls) if !urls.is_empty() => urls,
        _ => builtin,
    };
    if pool.is_empty() {
        return None;
    }
    pool.get(seed as usize % pool.len()).map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NowPlayingView;

    fn now() -> NowPlayingView {
        NowPlayingView {
            title: "Never Gonna Give You Up".into(),
            artist: Some("Rick Astley".into()),
            duration_ms: Some(212_000),
            thumbnail_url: Some("https://i.ytimg.com/x.jpg".into()),
            requested_by: "rick".into(),
        }
    }

    #[test]
    fn volume_bar_is_proportional() {
        assert_eq!(volume_bar(100, false), format!("🔊 {} 100%", "█".repeat(10)));
        let half = volume_bar(50, false);
        assert!(half.contains(&format!("{}{}", "█".repeat(5), "░".repeat(5))));
        let muted = volume_bar(80, true);
        assert!(muted.starts_with("🔇"));
        assert!(!muted.contains('█'));
    }

    #[test]
    fn playing_embed_is_green_with_fields() {
        let payload = render(&UiState::Playing {
            now: now(),
            queue_len: 2,
            volume_pct: 70,
            muted: false,
        });
        let embed = &payload.embeds[0];
        assert_eq!(embed.color, Some(COLOR_PLAYING));
        assert!(embed.description.as_ref().unwrap().contains("Never Gonna"));
        assert!(embed.fields.iter().any(|f| f.name == "Duration"));
        assert!(embed.fields.iter().any(|f| f.value.contains("3m 32s")));
    }

    #[test]
    fn paused_flips_button_label_and_style() {
        let paused = render(&UiState::Paused {
            now: now(),
            queue_len: 0,
            volume_pct: 100,
            muted: false,
        });
        let row = &paused.components[0];
        assert_eq!(row.components[0].label, "Resume");
        assert_eq!(row.components[0].style, ButtonStyle::Success);

        let playing = render(&UiState::Playing {
            now: now(),
            queue_len: 0,
            volume_pct: 100,
            muted: false,
        });
        assert_eq!(playing.components[0].components[0].label, "Pause");
    }

    #[test]
    fn idle_disables_transport_controls() {
        let payload = render(&UiState::Idle { connected: true });
        let row = &payload.components[0];
        let by_id = |id: &str| row.components.iter().find(|b| b.custom_id == id).unwrap();
        assert!(by_id(ID_PLAY_PAUSE).disabled);
        assert!(by_id(ID_SKIP).disabled);
        assert!(by_id(ID_STOP).disabled);
        assert!(by_id(ID_SHUFFLE).disabled);
        assert!(!by_id(ID_ADD_SONG).disabled);
    }

    #[test]
    fn shuffle_enabled_only_with_two_queued() {
        let payload = render(&UiState::Playing {
            now: now(),
            queue_len: 3,
            volume_pct: 100,
            muted: false,
        });
        let row = &payload.components[0];
        let shuffle = row
            .components
            .iter()
            .find(|b| b.custom_id == ID_SHUFFLE)
            .unwrap();
        assert!(!shuffle.disabled);
    }

    #[test]
    fn every_variant_renders_one_embed() {
        let states = [
            UiState::Querying {
                query: Some("q".into()),
                gif_url: None,
            },
            UiState::Loading {
                title: None,
                gif_url: Some("https://gif".into()),
            },
            UiState::Playing {
                now: now(),
                queue_len: 0,
                volume_pct: 100,
                muted: false,
            },
            UiState::Paused {
                now: now(),
                queue_len: 0,
                volume_pct: 100,
                muted: true,
            },
            UiState::Idle { connected: false },
            UiState::Error {
                message: "boom".into(),
            },
        ];
        for state in &states {
            let payload = render(state);
            assert_eq!(payload.embeds.len(), 1, "state {state:?}");
            assert!(payload.embeds[0].color.is_some());
        }
    }

    #[test]
    fn gif_choice_prefers_custom_set() {
        let builtin = vec!["b1".to_string(), "b2".to_string()];
        let custom = vec!["c1".to_string()];
        let empty_custom: Vec<String> = vec![];
        assert_eq!(choose_gif(&builtin, Some(&custom), 7), Some("c1"));
        assert_eq!(choose_gif(&builtin, None, 1), Some("b2"));
        assert_eq!(choose_gif(&builtin, Some(&empty_custom), 0), Some("b1"));
        let empty: Vec<String> = vec![];
        assert_eq!(choose_gif(&empty, None, 0), None);
    }
}
