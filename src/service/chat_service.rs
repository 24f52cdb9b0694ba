use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{GenerationRequest, GenerationService};
use crate::config::StreamSettings;
use crate::db::MessageStore;
use crate::errors::AppError;
use crate::gateway::driver::{GenerationDriver, StreamContext};
use crate::gateway::{ConnectionId, Hub};
use crate::models::{Conversation, Message, MessageRole};
use crate::protocol::{ClientCommand, CommandKind, ServerEvent};
use crate::registry::{RetiredOutcome, StreamRegistry, Subscription};

const DEFAULT_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 60;

/// Routes protocol commands to the registry and the Generation Service and
/// serves the conversation backfill queries.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    generation: Arc<dyn GenerationService>,
    registry: Arc<StreamRegistry>,
    hub: Arc<Hub>,
    driver: GenerationDriver,
    settings: StreamSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        generation: Arc<dyn GenerationService>,
        settings: StreamSettings,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new(settings.retention));
        let hub = Arc::new(Hub::new());
        let driver = GenerationDriver::new(
            registry.clone(),
            hub.clone(),
            store.clone(),
            settings.stop_grace,
        );
        Self { store, generation, registry, hub, driver, settings }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ── Backfill queries ─────────────────────────────────────────────────────

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.store.list_conversations().await
    }

    pub async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, AppError> {
        let title = match title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => truncate_title(t),
            _ => DEFAULT_TITLE.to_string(),
        };
        let conversation = self.store.create_conversation(&title).await?;
        info!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.require_conversation(conversation_id).await?;
        self.store.list_messages(conversation_id).await
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Registers a connection and replays the user's pending flags to it.
    pub async fn connect(&self, user_id: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (conn_id, rx) = self.hub.register_connection(user_id);
        self.hub.send_to(conn_id, ServerEvent::Connected).await;
        for conversation_id in self.registry.active_for_owner(user_id) {
            self.hub
                .send_to(conn_id, ServerEvent::Pending { conversation_id, pending: true })
                .await;
        }
        (conn_id, rx)
    }

    /// Drops the connection only; in-flight generations keep running.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        self.hub.unregister_connection(conn_id);
    }

    /// Executes one command; failures are reported to the issuing connection
    /// as `rejected` and never touch an existing stream.
    pub async fn handle_command(&self, user_id: &str, conn_id: ConnectionId, command: ClientCommand) {
        let kind = command.kind();
        let conversation_id = command.conversation_id().to_string();

        let result = match command {
            ClientCommand::Submit { conversation_id, content } => self
                .submit(user_id, conn_id, &conversation_id, &content)
                .await
                .map(|_| ()),
            ClientCommand::Subscribe { conversation_id } => {
                self.subscribe(conn_id, &conversation_id).await;
                Ok(())
            }
            ClientCommand::Stop { conversation_id, stream_id } => {
                self.stop(&conversation_id, &stream_id)
            }
        };

        if let Err(e) = result {
            warn!("Rejected {kind:?} on conversation {conversation_id} from user {user_id}: {e}");
            self.reject(conn_id, Some(conversation_id), kind, &e).await;
        }
    }

    pub async fn reject(
        &self,
        conn_id: ConnectionId,
        conversation_id: Option<String>,
        command: CommandKind,
        error: &AppError,
    ) {
        self.hub
            .send_to(
                conn_id,
                ServerEvent::Rejected {
                    conversation_id,
                    command,
                    code: error.reject_code(),
                    message: error.to_string(),
                },
            )
            .await;
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Starts a generation for `conversation_id` and returns its stream id.
    /// Fails with `Conflict` if the conversation already has one in flight.
    pub async fn submit(
        &self,
        user_id: &str,
        conn_id: ConnectionId,
        conversation_id: &str,
        content: &str,
    ) -> Result<String, AppError> {
        self.validate_content(content)?;
        self.require_conversation(conversation_id).await?;

        let handle = self.registry.begin(conversation_id, user_id)?;
        let stream_id = handle.stream_id.clone();

        let (prior_messages, _) = match self.record_user_turn(conversation_id, content).await {
            Ok(recorded) => recorded,
            Err(e) => {
                self.registry.discard(&stream_id);
                return Err(e);
            }
        };

        self.hub.subscribe(conn_id, conversation_id);
        self.hub.broadcast_pending(user_id, conversation_id, true).await;
        self.hub
            .send_to_subscribers(
                conversation_id,
                ServerEvent::Start {
                    conversation_id: conversation_id.to_string(),
                    stream_id: stream_id.clone(),
                },
            )
            .await;

        let ctx = StreamContext {
            conversation_id: conversation_id.to_string(),
            owner: user_id.to_string(),
            handle,
        };
        let request = GenerationRequest {
            conversation_id: conversation_id.to_string(),
            prior_messages,
            user_content: content.to_string(),
        };
        let generation = self.generation.clone();
        let driver = self.driver.clone();
        tokio::spawn(async move {
            let cancel = ctx.handle.cancel.clone();
            match generation.begin_generation(request, cancel).await {
                Ok(events) => driver.run(ctx, events).await,
                Err(e) => driver.abort(ctx, &e.to_string()).await,
            }
        });

        Ok(stream_id)
    }

    /// Attaches the connection to the conversation, then reports where the
    /// conversation's stream stands.
    pub async fn subscribe(&self, conn_id: ConnectionId, conversation_id: &str) {
        // Attach before snapshotting so no fragment can fall between the two.
        self.hub.subscribe(conn_id, conversation_id);

        match self.registry.subscribe(conversation_id) {
            Subscription::Active(snapshot) => {
                debug!(
                    "Connection {conn_id} caught up on stream {} at index {}",
                    snapshot.stream_id, snapshot.next_index
                );
                self.hub
                    .send_to(
                        conn_id,
                        ServerEvent::SubscriptionConfirmed {
                            conversation_id: conversation_id.to_string(),
                            stream_id: snapshot.stream_id,
                            accumulated_text: snapshot.accumulated_text,
                            next_index: snapshot.next_index,
                        },
                    )
                    .await;
            }
            Subscription::Retired(retired) => {
                self.hub
                    .send_to(
                        conn_id,
                        ServerEvent::SubscriptionConfirmed {
                            conversation_id: conversation_id.to_string(),
                            stream_id: retired.stream_id.clone(),
                            accumulated_text: retired.final_text.clone(),
                            next_index: retired.next_index,
                        },
                    )
                    .await;
                let terminal = match retired.outcome {
                    RetiredOutcome::Completed { message_id } => ServerEvent::Complete {
                        stream_id: retired.stream_id,
                        message_id,
                        final_text: retired.final_text,
                    },
                    RetiredOutcome::Failed { reason } => ServerEvent::Error {
                        stream_id: retired.stream_id,
                        message: reason,
                    },
                };
                self.hub.send_to(conn_id, terminal).await;
            }
            Subscription::None => {
                self.hub
                    .send_to(
                        conn_id,
                        ServerEvent::NoActiveStream { conversation_id: conversation_id.to_string() },
                    )
                    .await;
            }
        }
    }

    pub fn stop(&self, conversation_id: &str, stream_id: &str) -> Result<(), AppError> {
        self.registry.stop(conversation_id, stream_id)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn validate_content(&self, content: &str) -> Result<(), AppError> {
        if content.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "content".to_string() });
        }
        if content.len() > self.settings.max_message_length {
            return Err(AppError::FieldTooLong {
                field_name: "content".to_string(),
                max_length: self.settings.max_message_length,
                actual_length: content.len(),
            });
        }
        Ok(())
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<Conversation, AppError> {
        self.store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })
    }

    /// Loads the history preceding this turn, then persists the user message.
    async fn record_user_turn(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(Vec<Message>, Message), AppError> {
        let history = self.store.list_messages(conversation_id).await?;
        let user_message = self
            .store
            .append_message(conversation_id, MessageRole::User, content)
            .await?;
        Ok((history, user_message))
    }
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() > MAX_TITLE_CHARS {
        format!("{}…", title.chars().take(MAX_TITLE_CHARS).collect::<String>())
    } else {
        title.to_string()
    }
}
