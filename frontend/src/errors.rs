use thiserror::Error;

/// Failures surfaced to the user (or logged) by the client.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ClientError {
    /// The socket could not be re-established within the retry budget.
    #[error("Connection lost after {attempts} attempts")]
    Transport { attempts: u32 },

    /// A stream ended in `error`. Partial text stays on screen.
    #[error("Generation failed: {message}")]
    Generation { message: String },

    #[error("A reply is already being generated in this conversation")]
    Conflict { conversation_id: String },

    #[error("{message}")]
    Rejected { message: String },

    #[error("Message cannot be empty")]
    EmptyMessage,

    /// Backfill returned fewer messages than have resolved locally.
    #[error("{missing} resolved message(s) in {conversation_id} not yet persisted")]
    PersistenceLag { conversation_id: String, missing: usize },

    #[error("Network error: {0}")]
    Network(String),
}

impl ClientError {
    /// Whether the error belongs in the on-screen error banner.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, ClientError::PersistenceLag { .. })
    }
}
