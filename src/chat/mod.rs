//! Outbound chat API: a trait seam over the platform's REST surface so the
//! reference manager, dispatcher and UI updater are testable without the
//! network.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, NetworkError, PlatformError, Result};

pub mod payload;
pub mod refs;

pub use payload::{ActionRow, Button, ButtonStyle, Embed, MessagePayload};
pub use refs::MessageRefManager;

const API_BASE: &str = "https://discord.com/api/v10";

// Platform error codes we recognize in error bodies.
const CODE_UNKNOWN_MESSAGE: u32 = 10008;
const CODE_UNKNOWN_CHANNEL: u32 = 10003;
const CODE_UNKNOWN_GUILD: u32 = 10004;
const CODE_UNKNOWN_USER: u32 = 10013;
const CODE_MISSING_ACCESS: u32 = 50001;
const CODE_INVALID_WEBHOOK_TOKEN: u32 = 50027;

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post a message; returns the new message id.
    async fn send_message(&self, channel_id: &str, payload: &MessagePayload) -> Result<String>;
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<()>;
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
    /// Whether the message still exists and is editable.
    async fn message_exists(&self, channel_id: &str, message_id: &str) -> Result<bool>;
    /// Interaction follow-up via the webhook token.
    async fn create_followup(
        &self,
        interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()>;
    /// Edit the original deferred interaction response.
    async fn edit_original_response(
        &self,
        interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()>;
}

/// Production REST client.
pub struct DiscordRestClient {
    http: reqwest::Client,
    bot_token: String,
    app_id: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u32>,
    #[serde(default)]
    retry_after: Option<f64>,
}

impl DiscordRestClient {
    pub fn new(bot_token: &str, app_id: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| {
                Error::from(NetworkError::ConnectionFailed {
                    reason: e.to_string(),
                })
            })?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            app_id: app_id.to_string(),
            base_url: API_BASE.to_string(),
        })
    }

    /// Point the client at a different host (tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody {
            code: None,
            retry_after: None,
        });
        Err(classify_api_error(status.as_u16(), &body))
    }
}

fn classify_api_error(status: u16, body: &ApiErrorBody) -> Error {
    match (status, body.code) {
        (_, Some(CODE_UNKNOWN_MESSAGE)) => PlatformError::UnknownMessage {
            message_id: String::new(),
        }
        .into(),
        (_, Some(CODE_UNKNOWN_CHANNEL)) => PlatformError::UnknownChannel {
            channel_id: String::new(),
        }
        .into(),
        (_, Some(CODE_UNKNOWN_GUILD)) => PlatformError::UnknownGuild {
            guild_id: String::new(),
        }
        .into(),
        (_, Some(CODE_UNKNOWN_USER)) => PlatformError::UnknownUser {
            user_id: String::new(),
        }
        .into(),
        (_, Some(CODE_MISSING_ACCESS)) => PlatformError::MissingAccess.into(),
        (_, Some(CODE_INVALID_WEBHOOK_TOKEN)) => PlatformError::WebhookExpired.into(),
        (429, _) => NetworkError::RateLimited {
            retry_after_secs: body.retry_after.map(|s| s.ceil() as u64).unwrap_or(5),
        }
        .into(),
        (404, _) => PlatformError::UnknownMessage {
            message_id: String::new(),
        }
        .into(),
        (status, _) if status >= 500 => NetworkError::ServerError { status }.into(),
        (status, _) => NetworkError::InvalidResponse {
            reason: format!("unexpected status {status}"),
        }
        .into(),
    }
}

#[async_trait]
impl ChatApi for DiscordRestClient {
    async fn send_message(&self, channel_id: &str, payload: &MessagePayload) -> Result<String> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.auth())
            .json(payload)
            .send()
            .await
            .map_err(send_err)?;
        let response = self.check(response).await?;
        let message: MessageResponse = response.json().await.map_err(|e| {
            Error::from(NetworkError::InvalidResponse {
                reason: e.to_string(),
            })
        })?;
        debug!("posted message {} to channel {channel_id}", message.id);
        Ok(message.id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        let url = format!(
            "{}/channels/{channel_id}/messages/{message_id}",
            self.base_url
        );
        let response = self
            .http
            .patch(&url)
            .header("Authorization", self.auth())
            .json(payload)
            .send()
            .await
            .map_err(send_err)?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let url = format!(
            "{}/channels/{channel_id}/messages/{message_id}",
            self.base_url
        );
        let response = self
            .http
            .delete(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(send_err)?;
        self.check(response).await?;
        Ok(())
    }

    async fn message_exists(&self, channel_id: &str, message_id: &str) -> Result<bool> {
        let url = format!(
            "{}/channels/{channel_id}/messages/{message_id}",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(send_err)?;
        match self.check(response).await {
            Ok(_) => Ok(true),
            Err(Error::Platform(
                PlatformError::UnknownMessage { .. } | PlatformError::UnknownChannel { .. },
            )) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn create_followup(
        &self,
        interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        let url = format!("{}/webhooks/{}/{interaction_token}", self.base_url, self.app_id);
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(send_err)?;
        self.check(response).await?;
        Ok(())
    }

    async fn edit_original_response(
        &self,
        interaction_token: &str,
        payload: &MessagePayload,
    ) -> Result<()> {
        let url = format!(
            "{}/webhooks/{}/{interaction_token}/messages/@original",
            self.base_url, self.app_id
        );
        let response = self
            .http
            .patch(&url)
            .json(payload)
            .send()
            .await
            .map_err(send_err)?;
        self.check(response).await?;
        Ok(())
    }
}

fn send_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        NetworkError::RequestTimeout { seconds: 10 }.into()
    } else {
        NetworkError::ConnectionFailed {
            reason: err.to_string(),
        }
        .into()
    }
}
