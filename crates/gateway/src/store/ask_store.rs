//! DiscordInteraction / ExternalAsk persistence.

use common::error::{CoreError, CoreResult};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

const SCHEMA: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskType {
    Question,
    Notification,
}

impl AskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Notification => "notification",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExternalAsk {
    pub id: String,
    pub session_id: String,
    pub ask_type: String,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
    pub priority: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub response: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub async fn create_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SCHEMA}.external_asks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            ask_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 1,
            timeout_seconds INTEGER NOT NULL DEFAULT 60,
            priority TEXT NOT NULL DEFAULT 'normal',
            thread_id TEXT,
            message_id TEXT,
            response TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_external_asks_session ON {SCHEMA}.external_asks(session_id)"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct AskStore {
    pool: PgPool,
}

impl AskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_pending(
        &self,
        id: &str,
        session_id: &str,
        ask_type: AskType,
        max_attempts: i32,
        timeout_seconds: i32,
        priority: &str,
    ) -> CoreResult<ExternalAsk> {
        let ask = sqlx::query_as::<_, ExternalAsk>(&format!(
            "INSERT INTO {SCHEMA}.external_asks (id, session_id, ask_type, max_attempts, timeout_seconds, priority) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *"
        ))
        .bind(id)
        .bind(session_id)
        .bind(ask_type.as_str())
        .bind(max_attempts)
        .bind(timeout_seconds)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;
        Ok(ask)
    }

    pub async fn mark_completed(&self, id: &str) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.external_asks SET status = 'completed', updated_at = NOW() WHERE id = $1"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_answered(&self, id: &str, response: &str) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.external_asks SET status = 'answered', response = $1, updated_at = NOW() WHERE id = $2"
        ))
        .bind(response)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_timeout(&self, id: &str) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.external_asks SET status = 'timeout', updated_at = NOW() WHERE id = $1"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_attempt(&self, id: &str, attempt: i32, thread_id: Option<&str>) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.external_asks SET attempt = $1, thread_id = COALESCE($2, thread_id), updated_at = NOW() WHERE id = $3"
        ))
        .bind(attempt)
        .bind(thread_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> CoreResult<ExternalAsk> {
        sqlx::query_as::<_, ExternalAsk>(&format!("SELECT * FROM {SCHEMA}.external_asks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("external ask {id}")))
    }
}
