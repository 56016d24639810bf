// Error taxonomy and propagation policy
// Every fallible path in the crate surfaces one of the typed families below;
// anyhow is reserved for binary bootstrap plumbing.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::model::format_duration_ms;

/// Structured context attached to an error for logging and diagnostics.
pub type Details = HashMap<String, serde_json::Value>;

/// Stable machine-readable error codes, grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // MEDIA
    UnsupportedUrl,
    SourceUnavailable,
    DurationLimitExceeded,
    PreloadArtifactMissing,
    ProcessingTimeout,
    BinaryMissing,
    // SESSION
    NoActiveSession,
    SessionCreationFailed,
    VoiceConnectionFailed,
    MissingPermissions,
    ChannelNotFound,
    UserNotFound,
    NotInVoiceChannel,
    // QUEUE
    QueueFull,
    DuplicateSong,
    QueueEmpty,
    InvalidPosition,
    QueueAddFailed,
    QueueRemoveFailed,
    QueueClearFailed,
    PreloadFailed,
    // VALIDATION
    InvalidId,
    InvalidQuery,
    InvalidUrl,
    MissingField,
    InvalidDuration,
    InvalidVolume,
    // NETWORK
    RequestTimeout,
    ConnectionFailed,
    RateLimited,
    ServiceUnavailable,
    InvalidResponse,
    AuthFailed,
    ServerError,
    // PLATFORM
    UnknownMessage,
    UnknownChannel,
    UnknownGuild,
    UnknownUser,
    MissingAccess,
    InvalidRequestBody,
    InteractionExpired,
    WebhookExpired,
    // SYSTEM
    MemoryLimit,
    Filesystem,
    SubprocessCreateFailed,
    SubprocessKillFailed,
    TempCleanupFailed,
    ConfigInvalid,
}

impl ErrorCode {
    /// Codes that are retried (up to 3 attempts with backoff) inside the
    /// component that produced them.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RequestTimeout
                | ErrorCode::ConnectionFailed
                | ErrorCode::ServiceUnavailable
                | ErrorCode::ServerError
                | ErrorCode::SubprocessCreateFailed
        )
    }

    /// Codes that are not logged beyond debug level.
    pub fn is_silent(self) -> bool {
        matches!(self, ErrorCode::DuplicateSong | ErrorCode::InvalidQuery)
    }

    /// Codes logged at error level; startup occurrences abort the process.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ErrorCode::MemoryLimit
                | ErrorCode::ConnectionFailed
                | ErrorCode::SessionCreationFailed
                | ErrorCode::BinaryMissing
        )
    }
}

/// Errors from media resolution and decoding (C1/C2/C3).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MediaError {
    #[error("unsupported URL: {url}")]
    UnsupportedUrl { url: String },
    #[error("media unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("duration limit exceeded ({0} > {1})", format_duration_ms(*.duration_ms), format_duration_ms(*.limit_ms))]
    DurationLimitExceeded { duration_ms: u64, limit_ms: u64 },
    #[error("preload artifact missing for {stream_key}")]
    PreloadArtifactMissing { stream_key: String },
    #[error("media processing timed out after {timeout_secs}s")]
    ProcessingTimeout { timeout_secs: u64 },
    #[error("{binary} is not installed or not available in PATH")]
    BinaryMissing { binary: String },
}

/// Errors from guild session lifecycle and voice handling (C5/C9).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("no active session for guild {guild_id}")]
    NoActiveSession { guild_id: String },
    #[error("failed to create session: {reason}")]
    CreationFailed { reason: String },
    #[error("voice connection failed: {reason}")]
    VoiceConnectionFailed { reason: String },
    #[error("missing permissions for this action")]
    MissingPermissions,
    #[error("channel {channel_id} not found")]
    ChannelNotFound { channel_id: String },
    #[error("user {user_id} not found")]
    UserNotFound { user_id: String },
    #[error("you must be in a voice channel")]
    NotInVoiceChannel,
}

/// Errors from the queue subsystem (C4).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("queue is full (cap {cap})")]
    Full { cap: usize },
    #[error("'{title}' is already queued")]
    Duplicate { title: String },
    #[error("queue is empty")]
    Empty,
    #[error("position {index} is out of bounds for queue of length {len}")]
    InvalidPosition { index: usize, len: usize },
    #[error("failed to add to queue: {reason}")]
    AddFailed { reason: String },
    #[error("failed to remove from queue: {reason}")]
    RemoveFailed { reason: String },
    #[error("failed to clear queue: {reason}")]
    ClearFailed { reason: String },
    #[error("preload failed: {reason}")]
    PreloadFailed { reason: String },
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid id: {value}")]
    InvalidId { value: String },
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },
    #[error("missing required field: {field}")]
    MissingField { field: String },
    #[error("invalid duration: {value}")]
    InvalidDuration { value: String },
    #[error("invalid volume {value}, expected 0..=100")]
    InvalidVolume { value: i64 },
}

/// Errors from outbound network calls (Spotify, chat REST).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("request timed out after {seconds}s")]
    RequestTimeout { seconds: u64 },
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{service} is unavailable")]
    ServiceUnavailable { service: String },
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
    #[error("authentication with {service} failed")]
    AuthFailed { service: String },
    #[error("server error (status {status})")]
    ServerError { status: u16 },
}

/// Errors reported by the chat platform.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlatformError {
    #[error("unknown message {message_id}")]
    UnknownMessage { message_id: String },
    #[error("unknown channel {channel_id}")]
    UnknownChannel { channel_id: String },
    #[error("unknown guild {guild_id}")]
    UnknownGuild { guild_id: String },
    #[error("unknown user {user_id}")]
    UnknownUser { user_id: String },
    #[error("missing access")]
    MissingAccess,
    #[error("invalid request body: {reason}")]
    InvalidRequestBody { reason: String },
    #[error("interaction expired")]
    InteractionExpired,
    #[error("webhook expired")]
    WebhookExpired,
}

/// Process-level errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SystemError {
    #[error("memory limit reached")]
    MemoryLimit,
    #[error("filesystem error: {reason}")]
    Filesystem { reason: String },
    #[error("failed to spawn subprocess: {reason}")]
    SubprocessCreate { reason: String },
    #[error("failed to kill subprocess: {reason}")]
    SubprocessKill { reason: String },
    #[error("temp cleanup failed: {reason}")]
    TempCleanup { reason: String },
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

/// Top-level error union carried across component boundaries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    System(#[from] SystemError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Media(e) => match e {
                MediaError::UnsupportedUrl { .. } => ErrorCode::UnsupportedUrl,
                MediaError::SourceUnavailable { .. } => ErrorCode::SourceUnavailable,
                MediaError::DurationLimitExceeded { .. } => ErrorCode::DurationLimitExceeded,
                MediaError::PreloadArtifactMissing { .. } => ErrorCode::PreloadArtifactMissing,
                MediaError::ProcessingTimeout { .. } => ErrorCode::ProcessingTimeout,
                MediaError::BinaryMissing { .. } => ErrorCode::BinaryMissing,
            },
            Error::Session(e) => match e {
                SessionError::NoActiveSession { .. } => ErrorCode::NoActiveSession,
                SessionError::CreationFailed { .. } => ErrorCode::SessionCreationFailed,
                SessionError::VoiceConnectionFailed { .. } => ErrorCode::VoiceConnectionFailed,
                SessionError::MissingPermissions => ErrorCode::MissingPermissions,
                SessionError::ChannelNotFound { .. } => ErrorCode::ChannelNotFound,
                SessionError::UserNotFound { .. } => ErrorCode::UserNotFound,
                SessionError::NotInVoiceChannel => ErrorCode::NotInVoiceChannel,
            },
            Error::Queue(e) => match e {
                QueueError::Full { .. } => ErrorCode::QueueFull,
                QueueError::Duplicate { .. } => ErrorCode::DuplicateSong,
                QueueError::Empty => ErrorCode::QueueEmpty,
                QueueError::InvalidPosition { .. } => ErrorCode::InvalidPosition,
                QueueError::AddFailed { .. } => ErrorCode::QueueAddFailed,
                QueueError::RemoveFailed { .. } => ErrorCode::QueueRemoveFailed,
                QueueError::ClearFailed { .. } => ErrorCode::QueueClearFailed,
                QueueError::PreloadFailed { .. } => ErrorCode::PreloadFailed,
            },
            Error::Validation(e) => match e {
                ValidationError::InvalidId { .. } => ErrorCode::InvalidId,
                ValidationError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
                ValidationError::InvalidUrl { .. } => ErrorCode::InvalidUrl,
                ValidationError::MissingField { .. } => ErrorCode::MissingField,
                ValidationError::InvalidDuration { .. } => ErrorCode::InvalidDuration,
                ValidationError::InvalidVolume { .. } => ErrorCode::InvalidVolume,
            },
            Error::Network(e) => match e {
                NetworkError::RequestTimeout { .. } => ErrorCode::RequestTimeout,
                NetworkError::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
                NetworkError::RateLimited { .. } => ErrorCode::RateLimited,
                NetworkError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
                NetworkError::InvalidResponse { .. } => ErrorCode::InvalidResponse,
                NetworkError::AuthFailed { .. } => ErrorCode::AuthFailed,
                NetworkError::ServerError { .. } => ErrorCode::ServerError,
            },
            Error::Platform(e) => match e {
                PlatformError::UnknownMessage { .. } => ErrorCode::UnknownMessage,
                PlatformError::UnknownChannel { .. } => ErrorCode::UnknownChannel,
                PlatformError::UnknownGuild { .. } => ErrorCode::UnknownGuild,
                PlatformError::UnknownUser { .. } => ErrorCode::UnknownUser,
                PlatformError::MissingAccess => ErrorCode::MissingAccess,
                PlatformError::InvalidRequestBody { .. } => ErrorCode::InvalidRequestBody,
                PlatformError::InteractionExpired => ErrorCode::InteractionExpired,
                PlatformError::WebhookExpired => ErrorCode::WebhookExpired,
            },
            Error::System(e) => match e {
                SystemError::MemoryLimit => ErrorCode::MemoryLimit,
                SystemError::Filesystem { .. } => ErrorCode::Filesystem,
                SystemError::SubprocessCreate { .. } => ErrorCode::SubprocessCreateFailed,
                SystemError::SubprocessKill { .. } => ErrorCode::SubprocessKillFailed,
                SystemError::TempCleanup { .. } => ErrorCode::TempCleanupFailed,
                SystemError::Config { .. } => ErrorCode::ConfigInvalid,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub fn is_silent(&self) -> bool {
        self.code().is_silent()
    }

    pub fn is_critical(&self) -> bool {
        self.code().is_critical()
    }

    /// How long the caller should wait before retrying, when the platform
    /// told us.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Network(NetworkError::RateLimited { retry_after_secs }) => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    /// Structured context for logging and the diagnostics surface.
    pub fn details(&self) -> Details {
        let mut details = Details::new();
        details.insert("code".into(), serde_json::json!(self.code()));
        match self {
            Error::Media(MediaError::DurationLimitExceeded {
                duration_ms,
                limit_ms,
            }) => {
                details.insert("durationMs".into(), serde_json::json!(duration_ms));
                details.insert("limitMs".into(), serde_json::json!(limit_ms));
            }
            Error::Media(MediaError::UnsupportedUrl { url }) => {
                details.insert("url".into(), serde_json::json!(url));
            }
            Error::Network(NetworkError::RateLimited { retry_after_secs }) => {
                details.insert("retryAfterSecs".into(), serde_json::json!(retry_after_secs));
            }
            Error::Queue(QueueError::Full { cap }) => {
                details.insert("cap".into(), serde_json::json!(cap));
            }
            _ => {}
        }
        details
    }

    /// Short, code-specific explanation suitable for an ephemeral reply.
    pub fn user_message(&self) -> String {
        match self {
            Error::Media(MediaError::DurationLimitExceeded {
                duration_ms,
                limit_ms,
            }) => format!(
                "That track is too long: {} exceeds the {} limit for this server.",
                format_duration_ms(*duration_ms),
                format_duration_ms(*limit_ms)
            ),
            Error::Media(MediaError::UnsupportedUrl { .. }) => {
                "That link is not a supported track or playlist URL.".to_string()
            }
            Error::Media(MediaError::BinaryMissing { binary }) => {
                format!("The server is missing a required tool ({binary}); playback is unavailable.")
            }
            Error::Session(SessionError::NotInVoiceChannel) => {
                "Join a voice channel first, then try again.".to_string()
            }
            Error::Session(SessionError::MissingPermissions)
            | Error::Platform(PlatformError::MissingAccess) => {
                "You do not have permission to use this control.".to_string()
            }
            Error::Queue(QueueError::Duplicate { title }) => {
                format!("'{title}' is already in the queue.")
            }
            Error::Network(NetworkError::RateLimited { retry_after_secs }) => {
                format!("Slow down a little - try again in {retry_after_secs}s.")
            }
            other => other.to_string(),
        }
    }
}

/// Retry an operation for retryable codes with exponential backoff.
/// Non-retryable errors propagate immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                debug!(
                    "retryable error ({:?}), attempt {}/{}, backing off {:?}",
                    err.code(),
                    attempt + 1,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
