//! Websocket wire protocol.
//!
//! Every frame is a JSON object tagged by `"type"`. Commands flow client to
//! server, events flow server to client. Fragment ordering is carried by the
//! explicit `index`, never by arrival order.

use serde::{Deserialize, Serialize};

/// Commands sent by a client over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a new generation for `conversation_id` with the given user input.
    Submit { conversation_id: String, content: String },
    /// Attach to the conversation's in-flight stream, if any.
    Subscribe { conversation_id: String },
    /// Ask the running generation to finish early.
    Stop { conversation_id: String, stream_id: String },
}

impl ClientCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ClientCommand::Submit { .. } => CommandKind::Submit,
            ClientCommand::Subscribe { .. } => CommandKind::Subscribe,
            ClientCommand::Stop { .. } => CommandKind::Stop,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            ClientCommand::Submit { conversation_id, .. }
            | ClientCommand::Subscribe { conversation_id }
            | ClientCommand::Stop { conversation_id, .. } => conversation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Submit,
    Subscribe,
    Stop,
    /// The frame could not be parsed as any command.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    Conflict,
    InvalidInput,
    NotFound,
    Internal,
}

/// Events sent by the server over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection registered with the gateway.
    Connected,

    Start {
        conversation_id: String,
        stream_id: String,
    },

    Fragment {
        stream_id: String,
        index: u32,
        text: String,
    },

    Complete {
        stream_id: String,
        message_id: String,
        final_text: String,
    },

    Error {
        stream_id: String,
        message: String,
    },

    /// Snapshot of the in-flight stream. `accumulated_text` covers fragment
    /// indices `0..next_index`.
    SubscriptionConfirmed {
        conversation_id: String,
        stream_id: String,
        accumulated_text: String,
        #[serde(default)]
        next_index: u32,
    },

    NoActiveStream {
        conversation_id: String,
    },

    /// Conversation-wide in-progress flag, sent to every connection of the user.
    Pending {
        conversation_id: String,
        pending: bool,
    },

    /// A command was refused. Never affects an existing stream.
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        command: CommandKind,
        code: RejectCode,
        message: String,
    },
}

#[cfg(test)]
impl ServerEvent {
    /// Stream id carried by per-stream lifecycle events.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Start { stream_id, .. }
            | ServerEvent::Fragment { stream_id, .. }
            | ServerEvent::Complete { stream_id, .. }
            | ServerEvent::Error { stream_id, .. }
            | ServerEvent::SubscriptionConfirmed { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Complete { .. } | ServerEvent::Error { .. })
    }
}
