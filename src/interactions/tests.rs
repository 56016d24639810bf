//! Dispatcher routing, gating and fail-closed behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::chat::MessageRefManager;
use crate::config::CadenceConfig;
use crate::coordinator::StateCoordinator;
use crate::media::{Preloader, ProcessRunner};
use crate::model::{AccessLevel, GuildSettings, PlaybackState, SurfaceAccess};
use crate::session::{EngineDeps, IdleSupervisor, SessionManager};
use crate::settings::SettingsCache;
use crate::test_utils::{FakeChatApi, FakeDecoder, FakeResolver, FakeVoiceGateway, MemoryStore};
use crate::ui::render::{ID_ADD_SONG, ID_SKIP};

use super::payload::{
    CallbackType, CommandOption, Interaction, InteractionData, InteractionType, Member, User,
};
use super::Dispatcher;

struct Stack {
    dispatcher: Dispatcher,
    sessions: Arc<SessionManager>,
    store: Arc<MemoryStore>,
    _ui_rx: mpsc::UnboundedReceiver<crate::ui::UiUpdate>,
}

fn stack() -> Stack {
    let config = CadenceConfig::default();
    let store = Arc::new(MemoryStore::new());

    let mut settings = GuildSettings::defaults_for("g1");
    settings.voice_channel_id = Some("vc1".to_string());
    store.seed_settings(settings);

    let settings_cache = Arc::new(SettingsCache::new(store.clone()));
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let coordinator = StateCoordinator::new(&config.session, &config.ratelimit, ui_tx);

    let preloader = Preloader::new(Arc::new(FakeDecoder::succeeding()));
    let process = Arc::new(ProcessRunner::new(&config.audio));
    let voice = Arc::new(FakeVoiceGateway::new());
    let chat = Arc::new(FakeChatApi::new());
    let refs = Arc::new(MessageRefManager::new(store.clone(), chat.clone()));
    let idle = IdleSupervisor::with_minute(settings_cache.clone(), 5, Duration::from_secs(60));

    let deps = Arc::new(EngineDeps {
        resolver: Arc::new(FakeResolver::new()),
        preloader: Arc::clone(&preloader),
        queue_store: store.clone(),
        metadata: Some(store.clone()),
        settings: Arc::clone(&settings_cache),
        voice,
        coordinator: Arc::clone(&coordinator),
        chat,
        refs,
        idle: Arc::clone(&idle),
        config,
    });
    let sessions = SessionManager::new(deps);

    let dispatcher = Dispatcher::new(
        Arc::clone(&sessions),
        coordinator,
        settings_cache,
        preloader,
        process,
        idle,
        store.clone(),
    );

    Stack {
        dispatcher,
        sessions,
        store,
        _ui_rx: ui_rx,
    }
}

fn user() -> User {
    User {
        id: "u1".to_string(),
        username: "rick".to_string(),
        global_name: Some("Rick".to_string()),
        avatar: None,
    }
}

fn member(admin: bool) -> Member {
    Member {
        user: user(),
        roles: vec![],
        permissions: Some(if admin { "8" } else { "0" }.to_string()),
    }
}

fn interaction(kind: InteractionType, data: Option<InteractionData>) -> Interaction {
    Interaction {
        id: "1".to_string(),
        application_id: "app".to_string(),
        kind,
        token: "tok".to_string(),
        guild_id: Some("g1".to_string()),
        channel_id: Some("c1".to_string()),
        member: Some(member(false)),
        user: None,
        data,
    }
}

fn command(name: &str, options: Vec<(&str, &str)>) -> Interaction {
    interaction(
        InteractionType::ApplicationCommand,
        Some(InteractionData {
            name: Some(name.to_string()),
            options: options
                .into_iter()
                .map(|(name, value)| CommandOption {
                    name: name.to_string(),
                    value: Some(serde_json::Value::String(value.to_string())),
                })
                .collect(),
            ..Default::default()
        }),
    )
}

fn component(custom_id: &str) -> Interaction {
    interaction(
        InteractionType::MessageComponent,
        Some(InteractionData {
            custom_id: Some(custom_id.to_string()),
            component_type: Some(2),
            ..Default::default()
        }),
    )
}

fn response_text(response: &super::InteractionResponse) -> String {
    match &response.data {
        Some(super::payload::ResponseData::Message(payload)) => {
            payload.content.clone().unwrap_or_default()
        }
        _ => String::new(),
    }
}

#[tokio::test]
async fn ping_pongs() {
    let s = stack();
    let response = s
        .dispatcher
        .dispatch(interaction(InteractionType::Ping, None))
        .await;
    assert_eq!(response.kind, CallbackType::Pong);
}

#[tokio::test]
async fn play_command_creates_a_session_and_starts_playback() {
    let s = stack();
    let response = s
        .dispatcher
        .dispatch(command("play", vec![("query", "some song")]))
        .await;
    assert_eq!(response.kind, CallbackType::ChannelMessageWithSource);
    assert!(response_text(&response).contains("some song"));
    assert!(s.sessions.exists("g1"));

    for _ in 0..200 {
        if let Some(snapshot) = s.sessions.snapshot("g1") {
            if snapshot.state == PlaybackState::Playing {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("playback never started: {:?}", s.sessions.snapshot("g1"));
}

#[tokio::test]
async fn empty_play_query_is_rejected() {
    let s = stack();
    let response = s
        .dispatcher
        .dispatch(command("play", vec![("query", "   ")]))
        .await;
    assert!(response_text(&response).contains("query"));
    assert!(!s.sessions.exists("g1"));
}

#[tokio::test]
async fn unknown_command_and_component_fail_closed() {
    let s = stack();
    let response = s.dispatcher.dispatch(command("definitely_not_a_command", vec![])).await;
    assert!(response_text(&response).contains("Unknown interaction"));

    let response = s.dispatcher.dispatch(component("access_legacy_skip")).await;
    assert!(response_text(&response).contains("not recognized"));
}

#[tokio::test]
async fn add_song_button_opens_the_modal() {
    let s = stack();
    let response = s.dispatcher.dispatch(component(ID_ADD_SONG)).await;
    assert_eq!(response.kind, CallbackType::Modal);
}

#[tokio::test]
async fn transport_button_without_session_reports_nothing_playing() {
    let s = stack();
    let response = s.dispatcher.dispatch(component(ID_SKIP)).await;
    assert!(response_text(&response).contains("Nothing is playing")
        || response_text(&response).contains("no active session"));
}

#[tokio::test]
async fn owner_only_surface_denies_regular_users() {
    let s = stack();
    let mut settings = GuildSettings::defaults_for("g1");
    settings.voice_channel_id = Some("vc1".to_string());
    settings.slash_commands = SurfaceAccess {
        level: AccessLevel::ServerOwner,
        role_ids: vec![],
    };
    s.store.seed_settings(settings);

    let response = s
        .dispatcher
        .dispatch(command("play", vec![("query", "song")]))
        .await;
    assert!(response_text(&response).contains("permission"));

    // An admin passes the same gate.
    let mut admin_interaction = command("skip", vec![]);
    admin_interaction.member = Some(member(true));
    let response = s.dispatcher.dispatch(admin_interaction).await;
    assert!(!response_text(&response).contains("permission"));
}

#[tokio::test]
async fn reset_requires_admin() {
    let s = stack();
    let response = s.dispatcher.dispatch(command("reset", vec![])).await;
    assert!(response_text(&response).contains("administrators"));
}

#[tokio::test]
async fn rate_limit_kicks_in_after_ten_requests() {
    let s = stack();
    let mut last = String::new();
    for _ in 0..11 {
        let response = s.dispatcher.dispatch(command("stop", vec![])).await;
        last = response_text(&response);
    }
    assert!(last.contains("Slow down"), "unexpected reply: {last}");
}

#[tokio::test]
async fn playlists_save_and_load_round_trip() {
    let s = stack();
    s.dispatcher
        .dispatch(command("play", vec![("query", "first tune")]))
        .await;
    for _ in 0..200 {
        if let Some(snapshot) = s.sessions.snapshot("g1") {
            if snapshot.state == PlaybackState::Playing {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = s
        .dispatcher
        .dispatch(command("saveplaylist", vec![("name", "favs")]))
        .await;
    assert!(
        response_text(&response).contains("Saved 1 tracks as **favs**"),
        "unexpected: {}",
        response_text(&response)
    );

    let response = s
        .dispatcher
        .dispatch(command("loadplaylist", vec![("name", "nope")]))
        .await;
    assert!(response_text(&response).contains("No saved playlist"));

    let response = s
        .dispatcher
        .dispatch(command("loadplaylist", vec![("name", "favs")]))
        .await;
    assert!(response_text(&response).contains("Loading 1 tracks from **favs**"));
}

#[tokio::test]
async fn memory_diagnostics_report_counters() {
    let s = stack();
    let response = s.dispatcher.dispatch(command("memory", vec![])).await;
    let text = response_text(&response);
    assert!(text.contains("Sessions: 0"), "unexpected: {text}");
    assert!(text.contains("no active session"), "unexpected: {text}");
}
