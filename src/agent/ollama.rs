use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rig::agent::MultiTurnStreamItem;
use rig::client::Nothing;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::streaming::{StreamedAssistantContent, StreamingChat};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{GenerationEvent, GenerationRequest, GenerationService, GenerationStream};
use crate::errors::AppError;
use crate::models::{Message, MessageRole};

const PREAMBLE: &str = "You are a helpful AI assistant running locally via Ollama. \
                        Be concise, accurate, and friendly. \
                        If you don't know something, say so.";

const EVENT_BUFFER: usize = 64;

/// Builds a rig [`RigMessage`] history list from stored [`Message`] records.
fn to_rig_history(messages: &[Message]) -> Vec<RigMessage> {
    messages
        .iter()
        .filter_map(|m| match m.role {
            MessageRole::User => Some(RigMessage::user(&m.content)),
            MessageRole::Assistant => Some(RigMessage::assistant(&m.content)),
            MessageRole::System => None, // system prompt is set via preamble
        })
        .collect()
}

/// Streams chat turns from a local Ollama model through rig.
/// A fresh agent is built per generation so history is replayed from the store each time.
#[derive(Clone)]
pub struct OllamaAgentService {
    client: ollama::Client,
    base_url: String,
    model: String,
}

impl OllamaAgentService {
    pub fn new(base_url: &str, model: &str) -> Result<Self, AppError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build Ollama client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
        })
    }

    fn classify(&self, message: String) -> AppError {
        if message.contains("Connection refused") || message.contains("connect") {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if message.contains("model") {
            AppError::ModelNotFound { model_name: self.model.clone() }
        } else {
            AppError::InferenceError { message }
        }
    }
}

#[async_trait]
impl GenerationService for OllamaAgentService {
    async fn begin_generation(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, AppError> {
        let agent = self.client.agent(&self.model).preamble(PREAMBLE).build();
        let history = to_rig_history(&request.prior_messages);
        let (tx, rx) = mpsc::channel::<GenerationEvent>(EVENT_BUFFER);
        let service = self.clone();

        tokio::spawn(async move {
            let conversation_id = request.conversation_id;
            let mut chunks = agent.stream_chat(request.user_content, history).await;

            let terminal = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Generation for conversation {conversation_id} cancelled");
                        break GenerationEvent::Done;
                    }
                    item = chunks.next() => match item {
                        Some(Ok(MultiTurnStreamItem::StreamAssistantItem(
                            StreamedAssistantContent::Text(text),
                        ))) => {
                            if text.text.is_empty() {
                                continue;
                            }
                            if tx.send(GenerationEvent::Delta { text: text.text }).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(MultiTurnStreamItem::FinalResponse(_))) | None => {
                            break GenerationEvent::Done;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Ollama inference failed for conversation {conversation_id}: {e}");
                            let message = service.classify(e.to_string()).to_string();
                            break GenerationEvent::Failed { message };
                        }
                    }
                }
            };
            let _ = tx.send(terminal).await;
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}
