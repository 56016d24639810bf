//! Engine behavior tests driven through the session manager with fakes for
//! every external collaborator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::chat::MessageRefManager;
use crate::config::CadenceConfig;
use crate::error::MediaError;
use crate::media::resolver::Resolution;
use crate::model::{GuildSettings, PlayIntentKind, PlaybackState, SessionSnapshot};
use crate::test_utils::{
    test_requester, test_song, FakeChatApi, FakeDecoder, FakeResolver, FakeVoiceGateway,
    MemoryStore,
};
use crate::ui::{UiState, UiUpdate};

struct Harness {
    manager: Arc<SessionManager>,
    store: Arc<MemoryStore>,
    chat: Arc<FakeChatApi>,
    voice: Arc<FakeVoiceGateway>,
    resolver: Arc<FakeResolver>,
    ui_rx: mpsc::UnboundedReceiver<UiUpdate>,
}

fn harness_with(resolver: FakeResolver, decoder: FakeDecoder) -> Harness {
    // A one-minute "minute" keeps the idle timer from firing mid-test; the
    // idle-timeout test shrinks it.
    harness_with_idle(resolver, decoder, Duration::from_secs(60))
}

fn harness_with_idle(
    resolver: FakeResolver,
    decoder: FakeDecoder,
    idle_minute: Duration,
) -> Harness {
    let config = CadenceConfig::default();
    let store = Arc::new(MemoryStore::new());

    let mut settings = GuildSettings::defaults_for("g1");
    settings.voice_channel_id = Some("vc1".to_string());
    store.seed_settings(settings);

    let settings_cache = Arc::new(crate::settings::SettingsCache::new(store.clone()));
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let coordinator =
        crate::coordinator::StateCoordinator::new(&config.session, &config.ratelimit, ui_tx);

    let resolver = Arc::new(resolver);
    let preloader = crate::media::Preloader::new(Arc::new(decoder));
    let voice = Arc::new(FakeVoiceGateway::new());
    let chat = Arc::new(FakeChatApi::new());
    let refs = Arc::new(MessageRefManager::new(store.clone(), chat.clone()));
    let idle = IdleSupervisor::with_minute(settings_cache.clone(), 5, idle_minute);

    let deps = Arc::new(EngineDeps {
        resolver: resolver.clone(),
        preloader,
        queue_store: store.clone(),
        metadata: Some(store.clone()),
        settings: settings_cache,
        voice: voice.clone(),
        coordinator,
        chat: chat.clone(),
        refs,
        idle,
        config,
    });

    Harness {
        manager: SessionManager::new(deps),
        store,
        chat,
        voice,
        resolver,
        ui_rx,
    }
}

fn harness() -> Harness {
    harness_with(FakeResolver::new(), FakeDecoder::succeeding())
}

fn play(raw: &str) -> Command {
    Command::Play {
        intent: crate::model::PlayIntent {
            kind: PlayIntentKind::Search,
            raw: raw.to_string(),
        },
        requester: test_requester(),
        interaction_token: Some("tok".to_string()),
    }
}

async fn wait_for(
    manager: &SessionManager,
    guild_id: &str,
    what: &str,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..300 {
        if let Some(snapshot) = manager.snapshot(guild_id) {
            if predicate(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "never reached '{what}'; last snapshot: {:?}",
        manager.snapshot(guild_id)
    );
}

#[tokio::test]
async fn play_walks_querying_loading_playing() {
    let mut h = harness_with(
        FakeResolver::new().with_delay(Duration::from_millis(20)),
        FakeDecoder::succeeding().with_delay(Duration::from_millis(20)),
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("never gonna give you up")).unwrap();

    let snapshot = wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;
    assert_eq!(
        snapshot.now_playing.as_ref().map(|s| s.title.as_str()),
        Some("Track never-gonna-give-you-up")
    );
    assert_eq!(snapshot.queue_total, 0);
    assert!(snapshot.connected);
    assert!(h.voice.is_connected("g1"));

    // The UI walked through querying and loading before playing.
    let mut saw = Vec::new();
    while let Ok(update) = h.ui_rx.try_recv() {
        saw.push(update.state);
    }
    let position = |target: fn(&UiState) -> bool| saw.iter().position(target);
    let querying = position(|s| matches!(s, UiState::Querying { .. })).expect("querying state");
    let loading = position(|s| matches!(s, UiState::Loading { .. })).expect("loading state");
    let playing = position(|s| matches!(s, UiState::Playing { .. })).expect("playing state");
    assert!(querying < loading && loading < playing);
}

#[tokio::test]
async fn pause_resume_round_trip_keeps_track_and_queue() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    let before = wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    tx.send(Command::Pause).unwrap();
    let paused = wait_for(&h.manager, "g1", "paused", |s| {
        s.state == PlaybackState::Paused
    })
    .await;
    assert_eq!(paused.now_playing, before.now_playing);
    assert_eq!(paused.queue_total, before.queue_total);

    tx.send(Command::Resume).unwrap();
    let resumed = wait_for(&h.manager, "g1", "resumed", |s| {
        s.state == PlaybackState::Playing
    })
    .await;
    assert_eq!(resumed.now_playing, before.now_playing);
    assert_eq!(resumed.queue_total, before.queue_total);
}

#[tokio::test]
async fn stop_lands_idle_and_is_idempotent() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b"), test_song("c")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    tx.send(Command::Stop).unwrap();
    let stopped = wait_for(&h.manager, "g1", "stopped", |s| {
        s.state == PlaybackState::Idle && s.now_playing.is_none()
    })
    .await;
    assert_eq!(stopped.queue_total, 0);
    assert_eq!(stopped.history_len, 1);

    // Applying stop again changes nothing.
    tx.send(Command::Stop).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = h.manager.snapshot("g1").expect("session still exists");
    assert_eq!(again.state, PlaybackState::Idle);
    assert_eq!(again.queue_total, 0);
    assert_eq!(again.history_len, 1);
}

#[tokio::test]
async fn track_end_advances_to_next_and_cleans_up() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    let first = wait_for(&h.manager, "g1", "playing a", |s| {
        s.state == PlaybackState::Playing
    })
    .await;
    assert_eq!(
        first.now_playing.as_ref().map(|s| s.title.as_str()),
        Some("Track a")
    );
    assert_eq!(first.queue_total, 1);

    h.voice.finish("g1", PlaybackEnd::Finished);
    let second = wait_for(&h.manager, "g1", "playing b", |s| {
        s.state == PlaybackState::Playing
            && s.now_playing.as_ref().map(|t| t.title.as_str()) == Some("Track b")
    })
    .await;
    assert_eq!(second.queue_total, 0);
    assert_eq!(second.history_len, 1);

    // Last track ends: back to idle with both in history.
    h.voice.finish("g1", PlaybackEnd::Finished);
    let done = wait_for(&h.manager, "g1", "idle", |s| {
        s.state == PlaybackState::Idle
    })
    .await;
    assert_eq!(done.history_len, 2);
}

#[tokio::test]
async fn skip_preserves_queue_order_with_concurrent_play() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b"), test_song("c")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    wait_for(&h.manager, "g1", "playing a", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    tx.send(Command::Skip).unwrap();
    wait_for(&h.manager, "g1", "playing b", |s| {
        s.now_playing.as_ref().map(|t| t.title.as_str()) == Some("Track b")
    })
    .await;

    tx.send(play("d")).unwrap();
    let snapshot = wait_for(&h.manager, "g1", "d queued", |s| s.queue_total == 2).await;
    let titles: Vec<&str> = snapshot
        .queue_window
        .iter()
        .map(|s| s.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Track c", "Track d"]);
}

#[tokio::test]
async fn play_during_resolution_is_staged_then_resolved() {
    let h = harness_with(
        FakeResolver::new().with_delay(Duration::from_millis(50)),
        FakeDecoder::succeeding(),
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("first")).unwrap();
    tx.send(play("second")).unwrap();

    let snapshot = wait_for(&h.manager, "g1", "both resolved", |s| {
        s.state == PlaybackState::Playing && s.queue_total == 1
    })
    .await;
    assert_eq!(
        snapshot.now_playing.as_ref().map(|s| s.title.as_str()),
        Some("Track first")
    );
    assert_eq!(
        snapshot.queue_window[0].title.as_str(),
        "Track second",
        "staged play resolved after the in-flight one"
    );
    assert_eq!(
        h.resolver
            .resolve_count
            .load(std::sync::atomic::Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn duration_limit_rejection_reports_and_returns_to_idle() {
    let h = harness();
    h.resolver.fail(
        "toolong",
        MediaError::DurationLimitExceeded {
            duration_ms: 210_000,
            limit_ms: 60_000,
        }
        .into(),
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("toolong")).unwrap();

    let mut followups = h.chat.followups();
    for _ in 0..200 {
        if !followups.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        followups = h.chat.followups();
    }

    let snapshot = wait_for(&h.manager, "g1", "back to idle", |s| {
        s.state == PlaybackState::Idle && s.search_query.is_none()
    })
    .await;
    assert!(snapshot.now_playing.is_none());
    assert_eq!(followups.len(), 1);
    let text = followups[0].content.clone().unwrap_or_default();
    assert!(text.contains("3m 30s"), "unexpected reply: {text}");
    assert!(text.contains("1m"), "unexpected reply: {text}");
}

#[tokio::test]
async fn playlist_drops_produce_single_summary_warning() {
    let h = harness();
    h.resolver.respond(
        "biglist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            playlist_title: Some("Mega Mix".to_string()),
            dropped_over_limit: 3,
            dropped_over_cap: 50,
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("biglist")).unwrap();
    wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    let followups = h.chat.followups();
    assert_eq!(followups.len(), 1, "exactly one summary warning");
    let text = followups[0].content.clone().unwrap_or_default();
    assert!(text.contains("50 skipped"), "unexpected summary: {text}");
    assert!(text.contains("3 skipped"), "unexpected summary: {text}");
    assert!(text.contains("Mega Mix"), "unexpected summary: {text}");
}

#[tokio::test]
async fn failed_decode_skips_to_next_track() {
    let h = harness_with(FakeResolver::new(), FakeDecoder::failing());
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();

    // Every decode fails, so the engine walks the whole queue and lands
    // idle with the error surfaced.
    let snapshot = wait_for(&h.manager, "g1", "exhausted queue", |s| {
        s.state == PlaybackState::Idle && s.last_error.is_some()
    })
    .await;
    assert_eq!(snapshot.queue_total, 0);
}

#[tokio::test]
async fn idle_timeout_destroys_the_session() {
    let h = harness_with_idle(
        FakeResolver::new(),
        FakeDecoder::succeeding(),
        Duration::from_millis(5),
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("one song")).unwrap();
    wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    // Track ends with an empty queue; the idle timer (5 fake-minutes of
    // 5ms) then tears the session down.
    h.voice.finish("g1", PlaybackEnd::Finished);
    for _ in 0..300 {
        if !h.manager.exists("g1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.manager.exists("g1"), "session not destroyed");
    assert!(!h.voice.is_connected("g1"));
}

#[tokio::test]
async fn volume_change_redecodes_head_preload_only() {
    let decoder = FakeDecoder::succeeding();
    let h = harness_with(FakeResolver::new(), decoder);
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    let before = wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;
    assert_eq!(before.volume_pct, 100);

    tx.send(Command::SetVolume(40)).unwrap();
    let after = wait_for(&h.manager, "g1", "volume applied", |s| s.volume_pct == 40).await;
    // The playing stream is untouched; state did not leave playing.
    assert_eq!(after.state, PlaybackState::Playing);
    assert_eq!(after.now_playing, before.now_playing);
}

#[tokio::test]
async fn shuffle_below_two_is_a_noop() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    // One song queued: shuffle must not set the flag.
    tx.send(Command::Shuffle).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = h.manager.snapshot("g1").unwrap();
    assert!(!snapshot.just_shuffled);
    assert_eq!(snapshot.queue_total, 1);
}

#[tokio::test]
async fn admin_reset_clears_persisted_state() {
    let h = harness();
    h.resolver.respond(
        "setlist",
        Resolution {
            songs: vec![test_song("a"), test_song("b"), test_song("c")],
            ..Default::default()
        },
    );
    let tx = h.manager.get_or_create("g1", "c1");
    tx.send(play("setlist")).unwrap();
    wait_for(&h.manager, "g1", "playing", |s| {
        s.state == PlaybackState::Playing
    })
    .await;

    tx.send(Command::AdminReset).unwrap();
    for _ in 0..200 {
        if !h.manager.exists("g1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.manager.exists("g1"));

    let persisted = h.store.saved_queue_state("g1").expect("state persisted");
    assert!(persisted.now_playing.is_none());
    assert!(persisted.queue_items.is_empty());
    assert!(persisted.history_items.is_empty());
}
