//! Parsing of what the user types into the terminal client.
//!
//! A line starting with [`COMMAND_SENTINEL`] is a command; the command name
//! runs up to the first space and is matched case-insensitively. Any other
//! line is a chat message for everyone.
//!
//! Malformed commands are rejected here, before anything reaches the relay.

use thiserror::Error;

use crate::message::ClientMessage;

pub const COMMAND_SENTINEL: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
    Admin,
    Name(String),
    Kick(String),
    Private { receiver: String, message: String },
    Chat(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("usage: :PRIVATE name message")]
    MalformedPrivate,
    #[error("usage: :KICK name")]
    MissingKickTarget,
    #[error("unknown command ':{0}', try :HELP")]
    UnknownCommand(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, InputError> {
        let Some(body) = line.strip_prefix(COMMAND_SENTINEL) else {
            return Ok(Command::Chat(line.to_string()));
        };

        let (name, rest) = body.split_once(' ').unwrap_or((body, ""));
        match name.to_uppercase().as_str() {
            "EXIT" => Ok(Command::Exit),
            "HELP" => Ok(Command::Help),
            "ADMIN" => Ok(Command::Admin),
            "NAME" => Ok(Command::Name(rest.to_string())),
            "KICK" if rest.is_empty() => Err(InputError::MissingKickTarget),
            "KICK" => Ok(Command::Kick(rest.to_string())),
            "PRIVATE" => match rest.split_once(' ') {
                Some((receiver, message)) if !receiver.is_empty() && !message.is_empty() => {
                    Ok(Command::Private {
                        receiver: receiver.to_string(),
                        message: message.to_string(),
                    })
                }
                _ => Err(InputError::MalformedPrivate),
            },
            _ => Err(InputError::UnknownCommand(name.to_string())),
        }
    }

    /// The protocol message for this command; `None` for purely local ones.
    pub fn into_message(self, username: Option<&str>) -> Option<ClientMessage> {
        let sender = username.map(str::to_string);
        match self {
            Command::Exit => None,
            Command::Help => Some(ClientMessage::Help),
            Command::Admin => Some(ClientMessage::RequestAdminRights),
            Command::Name(data) => Some(ClientMessage::ChangeUsername { data }),
            Command::Kick(data) => Some(ClientMessage::KickUser { data, sender }),
            Command::Private { receiver, message } => Some(ClientMessage::PrivateMessage {
                data: message,
                receiver,
                sender,
            }),
            Command::Chat(data) => Some(ClientMessage::Message { data, sender }),
        }
    }
}
