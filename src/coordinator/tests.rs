//! Lock, preemption, deferral and rate-limit policy tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::config::{RateLimitConfig, SessionConfig};
use crate::model::{PlaybackState, SessionSnapshot};
use crate::session::Command;
use crate::ui::{UiState, UiUpdate};

struct Setup {
    coordinator: Arc<StateCoordinator>,
    inbox_rx: mpsc::UnboundedReceiver<Command>,
    ui_rx: mpsc::UnboundedReceiver<UiUpdate>,
}

fn setup() -> Setup {
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let coordinator = StateCoordinator::new(
        &SessionConfig::default(),
        &RateLimitConfig::default(),
        ui_tx,
    );
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    coordinator.register_inbox("g1", inbox_tx);
    Setup {
        coordinator,
        inbox_rx,
        ui_rx,
    }
}

fn user(user_id: &str) -> TransitionSource {
    TransitionSource::User {
        user_id: user_id.to_string(),
    }
}

fn snapshot(state: PlaybackState) -> SessionSnapshot {
    SessionSnapshot {
        guild_id: "g1".to_string(),
        text_channel_id: "c1".to_string(),
        state,
        volume_pct: 100,
        ..Default::default()
    }
}

#[tokio::test]
async fn allowed_transition_is_accepted_and_forwarded() {
    let mut s = setup();
    let outcome = s
        .coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Stop,
        )
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Accepted);
    assert_eq!(s.coordinator.lock_state("g1"), LockState::Querying);
    assert!(matches!(s.inbox_rx.try_recv(), Ok(Command::Stop)));
}

#[tokio::test]
async fn disallowed_transition_defers_until_release() {
    let mut s = setup();
    // Take the querying lock.
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap();
    s.inbox_rx.try_recv().unwrap();

    // querying -> querying is not in the table: deferred.
    let outcome = s
        .coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u2"),
            Command::Resume,
        )
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Deferred);
    assert_eq!(s.coordinator.deferred_len("g1"), 1);
    assert!(s.inbox_rx.try_recv().is_err());

    // The engine lands idle; the deferred request drains and forwards.
    s.coordinator.notify_engine_state(&snapshot(PlaybackState::Idle));
    assert!(matches!(s.inbox_rx.try_recv(), Ok(Command::Resume)));
    assert_eq!(s.coordinator.deferred_len("g1"), 0);
}

#[tokio::test]
async fn higher_priority_preempts_lower() {
    let mut s = setup();
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap();
    s.inbox_rx.try_recv().unwrap();

    // querying -> querying is disallowed, but HIGH beats NORMAL.
    let outcome = s
        .coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::High,
            user("admin"),
            Command::Skip,
        )
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Preempted);
    assert!(matches!(s.inbox_rx.try_recv(), Ok(Command::Skip)));
}

#[tokio::test]
async fn deferred_queue_is_bounded() {
    let s = setup();
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap();

    let cap = SessionConfig::default().deferred_cap;
    for i in 0..cap {
        s.coordinator
            .request_transition(
                "g1",
                LockState::Querying,
                Priority::Normal,
                user(&format!("u{i}")),
                Command::Pause,
            )
            .unwrap();
    }
    let err = s
        .coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("last"),
            Command::Pause,
        )
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::QueueFull);
}

#[tokio::test(start_paused = true)]
async fn deferred_entries_expire() {
    let s = setup();
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap();
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u2"),
            Command::Resume,
        )
        .unwrap();
    assert_eq!(s.coordinator.deferred_len("g1"), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    s.coordinator.sweep();
    assert_eq!(s.coordinator.deferred_len("g1"), 0);
}

#[tokio::test]
async fn rate_limit_applies_to_users_not_engine() {
    let s = setup();
    // Exhaust the 10-per-10s window with accepted idle->idle transitions.
    for _ in 0..10 {
        s.coordinator
            .request_transition(
                "g1",
                LockState::Idle,
                Priority::Normal,
                user("u1"),
                Command::Pause,
            )
            .unwrap();
    }
    let err = s
        .coordinator
        .request_transition(
            "g1",
            LockState::Idle,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::RateLimited);

    // Engine-internal transitions bypass the window entirely.
    for _ in 0..20 {
        s.coordinator
            .request_transition(
                "g1",
                LockState::Idle,
                Priority::Low,
                TransitionSource::Engine,
                Command::Pause,
            )
            .unwrap();
    }
}

#[tokio::test]
async fn engine_notifications_emit_ui_states() {
    let mut s = setup();
    s.coordinator
        .notify_engine_state(&snapshot(PlaybackState::Querying));
    s.coordinator.notify_engine_state(&snapshot(PlaybackState::Idle));

    let first = s.ui_rx.try_recv().unwrap();
    assert!(matches!(first.state, UiState::Querying { .. }));
    let second = s.ui_rx.try_recv().unwrap();
    assert!(matches!(second.state, UiState::Idle { .. }));
    assert_eq!(s.coordinator.lock_state("g1"), LockState::Idle);
}

#[tokio::test(start_paused = true)]
async fn sweep_reaps_stale_locks() {
    let s = setup();
    s.coordinator
        .request_transition(
            "g1",
            LockState::Querying,
            Priority::Normal,
            user("u1"),
            Command::Pause,
        )
        .unwrap();
    assert_eq!(s.coordinator.lock_state("g1"), LockState::Querying);

    tokio::time::advance(Duration::from_secs(301)).await;
    s.coordinator.sweep();
    assert_eq!(s.coordinator.lock_state("g1"), LockState::Idle);
}
