use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::MessageStore;
use crate::errors::AppError;
use crate::models::{Conversation, Message, MessageRole};

/// Process-local store with sequential numeric ids.
///
/// Used when no database is configured and by the test-suite.
#[derive(Default)]
pub struct InMemoryMessageStore {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, AppError> {
        let conversation = Conversation::new(format!("c{}", self.next_id()), title.to_string());
        let mut inner = self.inner.write().await;
        inner.conversations.insert(conversation.id.clone(), conversation.clone());
        inner.messages.insert(conversation.id.clone(), Vec::new());
        Ok(conversation)
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        Ok(self.inner.read().await.conversations.get(id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let mut conversations: Vec<Conversation> =
            self.inner.read().await.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<Message, AppError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        conversation.updated_at = now;

        let message = Message {
            id: self.next_id(),
            conversation_id: conversation_id.to_string(),
            role,
            content: text.to_string(),
            created_at: now,
        };
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let inner = self.inner.read().await;
        if !inner.conversations.contains_key(conversation_id) {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        Ok(inner.messages.get(conversation_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_ids_and_keeps_order() {
        let store = InMemoryMessageStore::new();
        let conv = store.create_conversation("Greeting").await.unwrap();

        let first = store.append_message(&conv.id, MessageRole::User, "hi").await.unwrap();
        let second = store
            .append_message(&conv.id, MessageRole::Assistant, "Hello")
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let messages = store.list_messages(&conv.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "Hello"]);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = InMemoryMessageStore::new();
        let err = store
            .append_message("missing", MessageRole::User, "hi")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.list_messages("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn activity_reorders_conversations() {
        let store = InMemoryMessageStore::new();
        let older = store.create_conversation("older").await.unwrap();
        let newer = store.create_conversation("newer").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append_message(&older.id, MessageRole::User, "bump").await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);
    }
}
