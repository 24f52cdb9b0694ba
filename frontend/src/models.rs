use serde::{Deserialize, Serialize};

/// Matches the backend `Conversation` model.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Matches the backend `Message` model.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Request body for `POST /api/conversations`.
#[derive(Clone, Debug, Serialize)]
pub struct CreateConversationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Command sent to the server over the websocket.
/// Matches the backend `ClientCommand` enum (internally tagged).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Submit { conversation_id: String, content: String },
    Subscribe { conversation_id: String },
    Stop { conversation_id: String, stream_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Submit,
    Subscribe,
    Stop,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    Conflict,
    InvalidInput,
    NotFound,
    Internal,
}

/// Event received from the server.
/// Matches the backend `ServerEvent` enum (internally tagged).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
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
    Pending {
        conversation_id: String,
        pending: bool,
    },
    Rejected {
        #[serde(default)]
        conversation_id: Option<String>,
        command: CommandKind,
        code: RejectCode,
        message: String,
    },
}
