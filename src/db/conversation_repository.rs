use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::error;

use crate::errors::AppError;
use crate::models::Conversation;

const COLUMNS: &str = "id, title, created_at, updated_at";

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All conversations, most recent activity first.
    pub async fn find_all(&self) -> Result<Vec<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {COLUMNS} FROM conversations ORDER BY updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list conversations: {e}");
            AppError::db_query("Failed to list conversations", e)
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to look up conversation {id}: {e}");
            AppError::db_query(format!("Failed to look up conversation {id}"), e)
        })
    }

    /// Inserts a conversation under a freshly generated id.
    pub async fn create(&self, title: &str) -> Result<Conversation, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query_as::<_, Conversation>(&format!(
            "INSERT INTO conversations (id, title) VALUES ($1, $2) RETURNING {COLUMNS}"
        ))
        .bind(&id)
        .bind(title)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create conversation {id}: {e}");
            AppError::db_query("Failed to create conversation", e)
        })
    }

    /// Bumps `updated_at`; returns `false` if the conversation does not exist.
    pub async fn touch<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let touched: Option<(String,)> =
            sqlx::query_as("UPDATE conversations SET updated_at = $1 WHERE id = $2 RETURNING id")
                .bind(at)
                .bind(id)
                .fetch_optional(executor)
                .await
                .map_err(|e| {
                    error!("Failed to record activity on conversation {id}: {e}");
                    AppError::db_query("Failed to update conversation", e)
                })?;
        Ok(touched.is_some())
    }
}
