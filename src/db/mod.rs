//! Durable message storage.
//!
//! Only the `MessageStore` makes content durable; the registry and gateway
//! never persist stream text themselves.

pub mod conversation_repository;
pub mod memory;
pub mod message_repository;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::{Conversation, Message, MessageRole};

use self::conversation_repository::ConversationRepository;
use self::message_repository::MessageRepository;

pub use self::memory::InMemoryMessageStore;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, AppError>;

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;

    /// Conversations ordered by last activity, newest first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;

    /// Appends a message, assigning its id and timestamp, and records activity
    /// on the conversation.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<Message, AppError>;

    /// Messages of a conversation in creation order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError>;
}

/// Postgres-backed store built on the sqlx repositories.
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
    conversations: ConversationRepository,
    messages: MessageRepository,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: ConversationRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, AppError> {
        self.conversations.create(title).await
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.conversations.find_by_id(id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_all().await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<Message, AppError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to begin transaction", e))?;

        if !ConversationRepository::touch(&mut *tx, conversation_id, now).await? {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        let message = MessageRepository::insert(&mut *tx, conversation_id, role, text, now).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit message", e))?;
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.messages.find_by_conversation_id(conversation_id).await
    }
}
