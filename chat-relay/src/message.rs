use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Messages a client sends to the relay.
///
/// The `type` tag uses the upper snake case names of the wire protocol. Any
/// tag the relay does not know decodes to [`ClientMessage::Unknown`] so the
/// router can answer it instead of dropping the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    ChangeUsername {
        data: String,
    },
    Message {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    PrivateMessage {
        data: String,
        receiver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    RequestAdminRights,
    KickUser {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    Help,
    #[serde(other)]
    Unknown,
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Message {
        data: String,
        sender: Option<String>,
    },
    PrivateMessage {
        data: String,
        sender: Option<String>,
    },
    UsernameChanged {
        data: String,
    },
    UsernameRejected {
        data: String,
    },
    Info {
        data: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn info(data: impl Into<String>) -> Self {
        ServerMessage::Info { data: data.into() }
    }
}

impl ClientMessage {
    /// Wire name of the message kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ChangeUsername { .. } => "CHANGE_USERNAME",
            ClientMessage::Message { .. } => "MESSAGE",
            ClientMessage::PrivateMessage { .. } => "PRIVATE_MESSAGE",
            ClientMessage::RequestAdminRights => "REQUEST_ADMIN_RIGHTS",
            ClientMessage::KickUser { .. } => "KICK_USER",
            ClientMessage::Help => "HELP",
            ClientMessage::Unknown => "UNKNOWN",
        }
    }
}

/// A frame that could not be turned into a message. The frame is discarded;
/// the connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame is not a valid message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn decode<T>(text: &str) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_str(text)?)
}

pub fn decode_bytes<T>(bytes: &[u8]) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    decode(std::str::from_utf8(bytes)?)
}

/// Serializes a message to its canonical single-line JSON form.
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains a raw newline.
pub fn encode<T>(message: &T) -> serde_json::Result<String>
where
    T: Serialize,
{
    serde_json::to_string(message)
}
