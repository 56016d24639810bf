//! Inbound interaction wire types and the responses the platform mandates.

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::chat::payload::{MessagePayload, EPHEMERAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum InteractionType {
    Ping = 1,
    ApplicationCommand = 2,
    MessageComponent = 3,
    Autocomplete = 4,
    ModalSubmit = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum CallbackType {
    Pong = 1,
    ChannelMessageWithSource = 4,
    DeferredChannelMessageWithSource = 5,
    DeferredUpdateMessage = 6,
    UpdateMessage = 7,
    Modal = 9,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    pub user: User,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Guild-level permission bitfield, serialized as a decimal string.
    #[serde(default)]
    pub permissions: Option<String>,
}

const ADMINISTRATOR: u64 = 1 << 3;

impl Member {
    pub fn is_admin(&self) -> bool {
        self.permissions
            .as_deref()
            .and_then(|p| p.parse::<u64>().ok())
            .map(|bits| bits & ADMINISTRATOR != 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModalField {
    #[serde(default)]
    pub custom_id: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModalRow {
    #[serde(default)]
    pub components: Vec<ModalField>,
}

/// Payload of a command, component or modal interaction. Fields are sparse;
/// which ones are present depends on the interaction type.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InteractionData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Vec<CommandOption>,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub component_type: Option<u8>,
    #[serde(default)]
    pub components: Vec<ModalRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub application_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub token: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub data: Option<InteractionData>,
}

impl Interaction {
    /// The acting user, whether the interaction came from a guild or a DM.
    pub fn acting_user(&self) -> Option<&User> {
        self.member.as_ref().map(|m| &m.user).or(self.user.as_ref())
    }

    pub fn is_admin(&self) -> bool {
        self.member.as_ref().map(|m| m.is_admin()).unwrap_or(false)
    }

    pub fn role_ids(&self) -> &[String] {
        self.member.as_ref().map(|m| m.roles.as_slice()).unwrap_or(&[])
    }

    /// String value of a named command option.
    pub fn option_str(&self, name: &str) -> Option<String> {
        self.data
            .as_ref()?
            .options
            .iter()
            .find(|o| o.name == name)?
            .value
            .as_ref()?
            .as_str()
            .map(|s| s.to_string())
    }

    /// Value of a modal text field by its custom id.
    pub fn modal_value(&self, custom_id: &str) -> Option<String> {
        self.data
            .as_ref()?
            .components
            .iter()
            .flat_map(|row| row.components.iter())
            .find(|field| field.custom_id == custom_id)?
            .value
            .clone()
    }

    pub fn custom_id(&self) -> Option<&str> {
        self.data.as_ref()?.custom_id.as_deref()
    }

    pub fn command_name(&self) -> Option<&str> {
        self.data.as_ref()?.name.as_deref()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Message(MessagePayload),
    Modal(serde_json::Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: CallbackType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl InteractionResponse {
    pub fn pong() -> Self {
        Self {
            kind: CallbackType::Pong,
            data: None,
        }
    }

    pub fn message(payload: MessagePayload) -> Self {
        Self {
            kind: CallbackType::ChannelMessageWithSource,
            data: Some(ResponseData::Message(payload)),
        }
    }

    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self::message(MessagePayload {
            content: Some(text.into()),
            flags: Some(EPHEMERAL),
            ..Default::default()
        })
    }

    /// Silent ack for component presses; the engine edits the message.
    pub fn deferred_update() -> Self {
        Self {
            kind: CallbackType::DeferredUpdateMessage,
            data: None,
        }
    }

    /// The add-song modal with a single text input.
    pub fn add_song_modal(modal_id: &str, input_id: &str) -> Self {
        let modal = json!({
            "custom_id": modal_id,
            "title": "Add a Song",
            "components": [{
                "type": 1,
                "components": [{
                    "type": 4,
                    "custom_id": input_id,
                    "style": 1,
                    "label": "Song name or link",
                    "placeholder": "A search, a track URL, or a playlist URL",
                    "required": true
                }]
            }]
        });
        Self {
            kind: CallbackType::Modal,
            data: Some(ResponseData::Modal(modal)),
        }
    }
}
