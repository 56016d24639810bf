//! State coordinator: wraps the session engines with the cross-cutting
//! policies the control surface depends on - transition locks with priority
//! preemption, a bounded deferred-transition queue, rate limiting, and UI
//! state emission.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{RateLimitConfig, SessionConfig};
use crate::error::{QueueError, Result};
use crate::model::{PlaybackState, SessionSnapshot};
use crate::session::Command;
use crate::ui::{derive_ui_state, UiState, UiUpdate};

mod ratelimit;
pub use ratelimit::RateLimiter;

#[cfg(test)]
mod tests;

/// Coarse transition-lock states. `Paused` holds the same lock as
/// `Playing`; pause toggles do not take a lock transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Querying,
    Loading,
    Playing,
}

impl From<PlaybackState> for LockState {
    fn from(state: PlaybackState) -> Self {
        match state {
            PlaybackState::Idle => LockState::Idle,
            PlaybackState::Querying => LockState::Querying,
            PlaybackState::Loading => LockState::Loading,
            PlaybackState::Playing | PlaybackState::Paused => LockState::Playing,
        }
    }
}

/// Lower value preempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

#[derive(Debug, Clone)]
pub struct StateLock {
    pub state: LockState,
    pub priority: Priority,
    pub requester_id: Option<String>,
    pub since: Instant,
}

impl Default for StateLock {
    fn default() -> Self {
        Self {
            state: LockState::Idle,
            priority: Priority::Low,
            requester_id: None,
            since: Instant::now(),
        }
    }
}

/// Where a transition request came from. Engine-internal transitions bypass
/// the rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionSource {
    User { user_id: String },
    Engine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Accepted,
    /// Accepted by preempting a lower-priority holder.
    Preempted,
    /// Parked until the current lock releases.
    Deferred,
}

struct DeferredTransition {
    to: LockState,
    priority: Priority,
    source: TransitionSource,
    command: Command,
    /// Original request time; preserved across preemption so re-queued
    /// commands keep their ordering.
    requested_at: Instant,
}

/// Allowed lock transitions per the policy table.
fn allowed(from: LockState, to: LockState) -> bool {
    use LockState::*;
    matches!(
        (from, to),
        (Querying, Loading)
            | (Querying, Idle)
            | (Loading, Playing)
            | (Loading, Idle)
            | (Playing, Idle)
            | (Idle, Querying)
            | (Idle, Loading)
            | (Idle, Idle)
    )
}

pub struct StateCoordinator {
    locks: DashMap<String, StateLock>,
    deferred: DashMap<String, VecDeque<DeferredTransition>>,
    inboxes: DashMap<String, mpsc::UnboundedSender<Command>>,
    limiter: RateLimiter,
    ui_tx: mpsc::UnboundedSender<UiUpdate>,
    deferred_cap: usize,
    deferred_ttl: Duration,
    lock_stale: Duration,
}

impl StateCoordinator {
    pub fn new(
        session_config: &SessionConfig,
        ratelimit_config: &RateLimitConfig,
        ui_tx: mpsc::UnboundedSender<UiUpdate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            locks: DashMap::new(),
            deferred: DashMap::new(),
            inboxes: DashMap::new(),
            limiter: RateLimiter::new(ratelimit_config),
            ui_tx,
            deferred_cap: session_config.deferred_cap,
            deferred_ttl: Duration::from_secs(session_config.deferred_ttl_secs),
            lock_stale: Duration::from_secs(session_config.lock_stale_secs),
        })
    }

    /// Register the engine inbox deferred commands drain into.
    pub fn register_inbox(&self, guild_id: &str, tx: mpsc::UnboundedSender<Command>) {
        self.inboxes.insert(guild_id.to_string(), tx);
    }

    pub fn unregister(&self, guild_id: &str) {
        self.inboxes.remove(guild_id);
        self.locks.remove(guild_id);
        self.deferred.remove(guild_id);
    }

    /// Rate-limit check for commands that do not take a lock transition
    /// (transport controls on an active session).
    pub fn check_rate(&self, guild_id: &str, user_id: &str) -> Result<()> {
        self.limiter.check(guild_id, user_id)
    }

    pub fn lock_state(&self, guild_id: &str) -> LockState {
        self.locks
            .get(guild_id)
            .map(|l| l.state)
            .unwrap_or(LockState::Idle)
    }

    /// Gate a user-driven command that implies a lock transition. Accepted
    /// (or preempting) requests are forwarded to the engine immediately;
    /// disallowed ones are parked and drained on release.
    pub fn request_transition(
        &self,
        guild_id: &str,
        to: LockState,
        priority: Priority,
        source: TransitionSource,
        command: Command,
    ) -> Result<TransitionOutcome> {
        if let TransitionSource::User { user_id } = &source {
            self.limiter.check(guild_id, user_id)?;
        }

        let mut lock = self.locks.entry(guild_id.to_string()).or_default();
        let outcome = if allowed(lock.state, to) {
            TransitionOutcome::Accepted
        } else if priority < lock.priority {
            info!(
                "priority {:?} preempts {:?} lock for guild {guild_id}",
                priority, lock.priority
            );
            TransitionOutcome::Preempted
        } else {
            TransitionOutcome::Deferred
        };

        match outcome {
            TransitionOutcome::Accepted | TransitionOutcome::Preempted => {
                *lock = StateLock {
                    state: to,
                    priority,
                    requester_id: match &source {
                        TransitionSource::User { user_id } => Some(user_id.clone()),
                        TransitionSource::Engine => None,
                    },
                    since: Instant::now(),
                };
                drop(lock);
                self.forward(guild_id, command);
            }
            TransitionOutcome::Deferred => {
                drop(lock);
                self.defer(guild_id, to, priority, source, command)?;
            }
        }
        Ok(outcome)
    }

    fn defer(
        &self,
        guild_id: &str,
        to: LockState,
        priority: Priority,
        source: TransitionSource,
        command: Command,
    ) -> Result<()> {
        let mut queue = self.deferred.entry(guild_id.to_string()).or_default();
        if queue.len() >= self.deferred_cap {
            return Err(QueueError::Full {
                cap: self.deferred_cap,
            }
            .into());
        }
        debug!("deferring {:?} transition for guild {guild_id}", to);
        queue.push_back(DeferredTransition {
            to,
            priority,
            source,
            command,
            requested_at: Instant::now(),
        });
        Ok(())
    }

    fn forward(&self, guild_id: &str, command: Command) {
        if let Some(tx) = self.inboxes.get(guild_id) {
            if tx.send(command).is_err() {
                warn!("engine inbox closed for guild {guild_id}");
            }
        } else {
            warn!("no engine inbox registered for guild {guild_id}");
        }
    }

    /// The engine reports a completed transition. The lock follows the
    /// engine, the UI re-derives, and any now-allowed deferred transitions
    /// drain in (priority, request-time) order.
    pub fn notify_engine_state(&self, snapshot: &SessionSnapshot) {
        let to = LockState::from(snapshot.state);
        {
            let mut lock = self.locks.entry(snapshot.guild_id.clone()).or_default();
            *lock = StateLock {
                state: to,
                priority: Priority::Low,
                requester_id: None,
                since: Instant::now(),
            };
        }

        let update = UiUpdate {
            guild_id: snapshot.guild_id.clone(),
            text_channel_id: snapshot.text_channel_id.clone(),
            state: derive_ui_state(snapshot),
        };
        if self.ui_tx.send(update).is_err() {
            debug!("ui updater channel closed");
        }

        // A playback error while audio is still running gets its own panel;
        // the idle case already renders as the Error variant above.
        if let Some(message) = &snapshot.last_error {
            if snapshot.state != PlaybackState::Idle {
                let _ = self.ui_tx.send(UiUpdate {
                    guild_id: snapshot.guild_id.clone(),
                    text_channel_id: snapshot.text_channel_id.clone(),
                    state: UiState::Error {
                        message: message.clone(),
                    },
                });
            }
        }

        self.drain_deferred(&snapshot.guild_id);
    }

    fn drain_deferred(&self, guild_id: &str) {
        let Some(mut queue) = self.deferred.get_mut(guild_id) else {
            return;
        };
        let now = Instant::now();
        queue.retain(|entry| now.duration_since(entry.requested_at) < self.deferred_ttl);
        if queue.is_empty() {
            return;
        }

        // Stable ordering: priority first, original request time second.
        let mut entries: Vec<DeferredTransition> = queue.drain(..).collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.requested_at.cmp(&b.requested_at))
        });

        let mut kept = VecDeque::new();
        for entry in entries {
            let current = self.lock_state(guild_id);
            if allowed(current, entry.to) {
                debug!("releasing deferred {:?} for guild {guild_id}", entry.to);
                if let Some(mut lock) = self.locks.get_mut(guild_id) {
                    *lock = StateLock {
                        state: entry.to,
                        priority: entry.priority,
                        requester_id: match &entry.source {
                            TransitionSource::User { user_id } => Some(user_id.clone()),
                            TransitionSource::Engine => None,
                        },
                        since: Instant::now(),
                    };
                }
                self.forward(guild_id, entry.command);
            } else {
                kept.push_back(entry);
            }
        }
        *queue = kept;
    }

    /// Periodic reaping of expired locks, deferred entries, and rate
    /// windows.
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale = self.lock_stale;
        self.locks.retain(|guild_id, lock| {
            let keep = lock.state == LockState::Idle || now.duration_since(lock.since) < stale;
            if !keep {
                warn!("reaping stale {:?} lock for guild {guild_id}", lock.state);
            }
            keep
        });
        let ttl = self.deferred_ttl;
        for mut entry in self.deferred.iter_mut() {
            entry
                .value_mut()
                .retain(|d| now.duration_since(d.requested_at) < ttl);
        }
        self.deferred.retain(|_, queue| !queue.is_empty());
        self.limiter.prune();
    }

    /// Spawn the background sweep task.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                coordinator.sweep();
            }
        })
    }

    pub fn deferred_len(&self, guild_id: &str) -> usize {
        self.deferred.get(guild_id).map(|q| q.len()).unwrap_or(0)
    }
}
