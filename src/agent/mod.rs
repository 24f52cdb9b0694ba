//! Generation Service seam.
//!
//! A generation is an ordered stream of [`GenerationEvent`]s. Cancellation is
//! cooperative: the registry owns a [`CancellationToken`] per stream and the
//! service is expected to wind down with [`GenerationEvent::Done`] once it fires.

mod ollama;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;
use crate::models::Message;

pub use self::ollama::OllamaAgentService;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Next piece of assistant text, in order.
    Delta { text: String },
    /// Generation finished (normally or after a stop request).
    Done,
    /// Generation failed; text produced so far is still valid.
    Failed { message: String },
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationEvent::Delta { .. })
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: String,
    /// History before the new user input, oldest first.
    pub prior_messages: Vec<Message>,
    pub user_content: String,
}

pub type GenerationStream = BoxStream<'static, GenerationEvent>;

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn begin_generation(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, AppError>;
}
