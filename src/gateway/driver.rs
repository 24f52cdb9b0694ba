use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::agent::{GenerationEvent, GenerationStream};
use crate::db::MessageStore;
use crate::gateway::Hub;
use crate::models::{MessageRole, StreamStatus};
use crate::protocol::ServerEvent;
use crate::registry::{StreamHandle, StreamRegistry};

/// Identity of one in-flight generation.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub conversation_id: String,
    pub owner: String,
    pub handle: StreamHandle,
}

impl StreamContext {
    fn stream_id(&self) -> &str {
        &self.handle.stream_id
    }
}

enum Finish {
    Done,
    Failed(String),
}

/// Pumps one generation into the registry and out to subscribers.
///
/// Runs in its own task; a client disconnecting does not end it.
#[derive(Clone)]
pub struct GenerationDriver {
    registry: Arc<StreamRegistry>,
    hub: Arc<Hub>,
    store: Arc<dyn MessageStore>,
    stop_grace: Duration,
}

impl GenerationDriver {
    pub fn new(
        registry: Arc<StreamRegistry>,
        hub: Arc<Hub>,
        store: Arc<dyn MessageStore>,
        stop_grace: Duration,
    ) -> Self {
        Self { registry, hub, store, stop_grace }
    }

    /// Drives `events` to a terminal event. Every path ends with exactly one
    /// `complete` or `error` and clears the conversation's pending flag.
    pub async fn run(&self, ctx: StreamContext, mut events: GenerationStream) {
        let mut stop_deadline: Option<Instant> = None;

        let finish = loop {
            let next = tokio::select! {
                event = events.next() => event,
                _ = ctx.handle.cancel.cancelled(), if stop_deadline.is_none() => {
                    stop_deadline = Some(Instant::now() + self.stop_grace);
                    continue;
                }
                _ = sleep_until(stop_deadline.unwrap_or_else(Instant::now)), if stop_deadline.is_some() => {
                    warn!(
                        "Stream {} did not wind down within {:?} of stop; finishing with partial text",
                        ctx.stream_id(),
                        self.stop_grace
                    );
                    break Finish::Done;
                }
            };

            match next {
                Some(GenerationEvent::Delta { text }) => self.forward(&ctx, &text).await,
                Some(GenerationEvent::Done) => break Finish::Done,
                Some(GenerationEvent::Failed { message }) => break Finish::Failed(message),
                None if ctx.handle.cancel.is_cancelled() => break Finish::Done,
                None => break Finish::Failed("Generation ended without a result".to_string()),
            }
        };

        match finish {
            Finish::Done => self.complete(&ctx).await,
            Finish::Failed(message) => self.fail(&ctx, &message).await,
        }
        self.hub
            .broadcast_pending(&ctx.owner, &ctx.conversation_id, false)
            .await;
    }

    /// Ends a stream whose generation could not even start.
    pub async fn abort(&self, ctx: StreamContext, message: &str) {
        self.fail(&ctx, message).await;
        self.hub
            .broadcast_pending(&ctx.owner, &ctx.conversation_id, false)
            .await;
    }

    async fn forward(&self, ctx: &StreamContext, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.registry.append(ctx.stream_id(), text) {
            Ok(fragment) => {
                self.hub
                    .send_to_subscribers(
                        &ctx.conversation_id,
                        ServerEvent::Fragment {
                            stream_id: fragment.stream_id,
                            index: fragment.index,
                            text: fragment.text,
                        },
                    )
                    .await;
            }
            Err(e) => warn!("Dropping fragment for stream {}: {e}", ctx.stream_id()),
        }
    }

    async fn complete(&self, ctx: &StreamContext) {
        let Some(snapshot) = self.registry.snapshot(ctx.stream_id()) else {
            error!("Stream {} vanished before completion", ctx.stream_id());
            return;
        };
        let final_text = snapshot.accumulated_text;

        if final_text.is_empty() && snapshot.status == StreamStatus::Stopping {
            self.fail(ctx, "Generation stopped before producing any text").await;
            return;
        }

        let message = match self
            .store
            .append_message(&ctx.conversation_id, MessageRole::Assistant, &final_text)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to save assistant message for stream {}: {e}", ctx.stream_id());
                self.fail(ctx, &format!("Failed to save response: {e}")).await;
                return;
            }
        };

        if let Err(e) = self.registry.complete(ctx.stream_id(), &final_text, &message.id) {
            error!("Failed to retire stream {}: {e}", ctx.stream_id());
        }
        info!(
            "Conversation {} stream {} persisted as message {}",
            ctx.conversation_id,
            ctx.stream_id(),
            message.id
        );
        self.hub
            .send_to_subscribers(
                &ctx.conversation_id,
                ServerEvent::Complete {
                    stream_id: ctx.stream_id().to_string(),
                    message_id: message.id,
                    final_text,
                },
            )
            .await;
    }

    async fn fail(&self, ctx: &StreamContext, message: &str) {
        if let Err(e) = self.registry.fail(ctx.stream_id(), message) {
            error!("Failed to retire stream {}: {e}", ctx.stream_id());
        }
        self.hub
            .send_to_subscribers(
                &ctx.conversation_id,
                ServerEvent::Error {
                    stream_id: ctx.stream_id().to_string(),
                    message: message.to_string(),
                },
            )
            .await;
    }
}
