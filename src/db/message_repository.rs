use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Message, MessageRole};

const COLUMNS: &str = "id, conversation_id, role, content, created_at";

/// Raw row; `role` is checked on the way out.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::try_from(row.role)
            .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Messages in creation order; ties broken by id.
    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE conversation_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list messages of conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to list messages of conversation {conversation_id}"),
                e,
            )
        })?;

        rows.into_iter().map(Message::try_from).collect()
    }

    /// Inserts a message under a freshly generated id.
    pub async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {COLUMNS}"
        ))
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(created_at)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            error!("Failed to append {role} message to conversation {conversation_id}: {e}");
            AppError::db_query("Failed to append message", e)
        })?;

        Message::try_from(row)
    }
}
