//! Durable record of sessions, parent/child links, status, cost/turn counters.

use common::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

const SCHEMA: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceType {
    Ephemeral,
    Persistent,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    pub id: String,
    pub status: String,
    pub container_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub workspace_type: String,
    pub workspace_id: Option<String>,
    pub config: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub stopped_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_cost_usd: f64,
    pub total_turns: i32,
    pub error_message: Option<String>,
    pub owner_user_id: String,
}

pub async fn create_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SCHEMA}.sessions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'STARTING',
            container_id TEXT,
            parent_session_id TEXT REFERENCES {SCHEMA}.sessions(id),
            workspace_type TEXT NOT NULL DEFAULT 'EPHEMERAL',
            workspace_id TEXT,
            config JSONB NOT NULL DEFAULT '{{}}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            stopped_at TIMESTAMPTZ,
            total_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
            total_turns INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            owner_user_id TEXT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_sessions_parent ON {SCHEMA}.sessions(parent_session_id)"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_sessions_owner ON {SCHEMA}.sessions(owner_user_id, status)"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Health probe: confirm the pool can round-trip a trivial query.
    pub async fn ping(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        id: &str,
        parent_session_id: Option<&str>,
        workspace_type: WorkspaceType,
        workspace_id: Option<&str>,
        config: serde_json::Value,
        owner_user_id: &str,
    ) -> CoreResult<Session> {
        let workspace_type = match workspace_type {
            WorkspaceType::Ephemeral => "EPHEMERAL",
            WorkspaceType::Persistent => "PERSISTENT",
        };
        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO {SCHEMA}.sessions (id, parent_session_id, workspace_type, workspace_id, config, owner_user_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *"
        ))
        .bind(id)
        .bind(parent_session_id)
        .bind(workspace_type)
        .bind(workspace_id)
        .bind(config)
        .bind(owner_user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn get_by_id(&self, id: &str) -> CoreResult<Session> {
        sqlx::query_as::<_, Session>(&format!("SELECT * FROM {SCHEMA}.sessions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {id}")))
    }

    pub async fn list(
        &self,
        owner: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<(Vec<Session>, i64)> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT * FROM {SCHEMA}.sessions \
             WHERE ($1::text IS NULL OR owner_user_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(owner)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {SCHEMA}.sessions \
             WHERE ($1::text IS NULL OR owner_user_id = $1) \
               AND ($2::text IS NULL OR status = $2)"
        ))
        .bind(owner)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((sessions, total.0))
    }

    pub async fn children_of(&self, id: &str) -> CoreResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, Session>(&format!(
            "SELECT * FROM {SCHEMA}.sessions WHERE parent_session_id = $1 ORDER BY created_at"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn parent_of(&self, id: &str) -> CoreResult<Option<Session>> {
        let session = self.get_by_id(id).await?;
        match session.parent_session_id {
            Some(pid) => Ok(Some(self.get_by_id(&pid).await?)),
            None => Ok(None),
        }
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        let stopped_at_clause = if status.is_terminal() { "NOW()" } else { "NULL" };
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.sessions SET status = $1, error_message = $2, updated_at = NOW(), \
             stopped_at = {stopped_at_clause} WHERE id = $3"
        ))
        .bind(status.as_str())
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_container_id(&self, id: &str, container_id: &str) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.sessions SET container_id = $1, updated_at = NOW() WHERE id = $2"
        ))
        .bind(container_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_turn(&self, id: &str, cost_usd: f64) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.sessions SET total_turns = total_turns + 1, \
             total_cost_usd = total_cost_usd + $1, updated_at = NOW() WHERE id = $2"
        ))
        .bind(cost_usd)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        sqlx::query(&format!("DELETE FROM {SCHEMA}.sessions WHERE id = $1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_where(&self, owner: &str, status: Option<&str>) -> CoreResult<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {SCHEMA}.sessions \
             WHERE owner_user_id = $1 AND ($2::text IS NULL OR status = $2)"
        ))
        .bind(owner)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Depth from root, counted by walking `parent_session_id` — a fresh
    /// session one level under `parent_id` would sit at this depth.
    pub async fn depth_of(&self, parent_id: &str) -> CoreResult<i32> {
        let row: (i32,) = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE ancestors AS (
                SELECT id, parent_session_id, 0 AS depth FROM {SCHEMA}.sessions WHERE id = $1
                UNION ALL
                SELECT s.id, s.parent_session_id, a.depth + 1
                FROM {SCHEMA}.sessions s
                JOIN ancestors a ON s.id = a.parent_session_id
            )
            SELECT MAX(depth) + 1 FROM ancestors
            "#
        ))
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn direct_children_count(&self, parent_id: &str) -> CoreResult<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {SCHEMA}.sessions WHERE parent_session_id = $1"
        ))
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Row-locks `parent_id` and re-checks all three spawn limits against
    /// its current state before inserting the child row, all inside one
    /// transaction — this is what actually serializes concurrent spawns
    /// against the same parent per §5, rather than the advisory check in
    /// `SessionService::check_spawn_limits`.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_child_with_limit_check(
        &self,
        id: &str,
        parent_id: &str,
        max_depth: i32,
        max_children: i64,
        max_total: i64,
        workspace_type: WorkspaceType,
        workspace_id: Option<&str>,
        config: serde_json::Value,
        owner_user_id: &str,
    ) -> CoreResult<Session> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("SELECT id FROM {SCHEMA}.sessions WHERE id = $1 FOR UPDATE"))
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {parent_id}")))?;

        let depth: (i32,) = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE ancestors AS (
                SELECT id, parent_session_id, 0 AS depth FROM {SCHEMA}.sessions WHERE id = $1
                UNION ALL
                SELECT s.id, s.parent_session_id, a.depth + 1
                FROM {SCHEMA}.sessions s
                JOIN ancestors a ON s.id = a.parent_session_id
            )
            SELECT MAX(depth) + 1 FROM ancestors
            "#
        ))
        .bind(parent_id)
        .fetch_one(&mut *tx)
        .await?;
        if depth.0 >= max_depth {
            return Err(CoreError::LimitExceeded(format!("Maximum spawn depth ({max_depth}) exceeded")));
        }

        let children: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {SCHEMA}.sessions WHERE parent_session_id = $1"
        ))
        .bind(parent_id)
        .fetch_one(&mut *tx)
        .await?;
        if children.0 >= max_children {
            return Err(CoreError::LimitExceeded(format!(
                "Maximum children per session ({max_children}) exceeded"
            )));
        }

        let tree_total: (i64,) = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE root_walk AS (
                SELECT id, parent_session_id FROM {SCHEMA}.sessions WHERE id = $1
                UNION ALL
                SELECT s.id, s.parent_session_id
                FROM {SCHEMA}.sessions s
                JOIN root_walk r ON s.id = r.parent_session_id
            ),
            root AS (
                SELECT id FROM root_walk WHERE parent_session_id IS NULL
                LIMIT 1
            ),
            subtree AS (
                SELECT id FROM root
                UNION ALL
                SELECT s.id
                FROM {SCHEMA}.sessions s
                JOIN subtree t ON s.parent_session_id = t.id
            )
            SELECT COUNT(*) FROM {SCHEMA}.sessions
            WHERE id IN (SELECT id FROM subtree) AND status NOT IN ('STOPPED', 'FAILED')
            "#
        ))
        .bind(parent_id)
        .fetch_one(&mut *tx)
        .await?;
        if tree_total.0 >= max_total {
            return Err(CoreError::LimitExceeded(format!("Maximum total instances ({max_total}) exceeded")));
        }

        let workspace_type_str = match workspace_type {
            WorkspaceType::Ephemeral => "EPHEMERAL",
            WorkspaceType::Persistent => "PERSISTENT",
        };
        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO {SCHEMA}.sessions (id, parent_session_id, workspace_type, workspace_id, config, owner_user_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *"
        ))
        .bind(id)
        .bind(parent_id)
        .bind(workspace_type_str)
        .bind(workspace_id)
        .bind(config)
        .bind(owner_user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// Total live (non-terminal) sessions in the spawn tree containing
    /// `session_id`, found by walking to the root then counting the whole
    /// subtree — resolves the tree-vs-global ambiguity in §9.
    pub async fn tree_total_count(&self, session_id: &str) -> CoreResult<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE root_walk AS (
                SELECT id, parent_session_id FROM {SCHEMA}.sessions WHERE id = $1
                UNION ALL
                SELECT s.id, s.parent_session_id
                FROM {SCHEMA}.sessions s
                JOIN root_walk r ON s.id = r.parent_session_id
            ),
            root AS (
                SELECT id FROM root_walk WHERE parent_session_id IS NULL
                LIMIT 1
            ),
            subtree AS (
                SELECT id FROM root
                UNION ALL
                SELECT s.id
                FROM {SCHEMA}.sessions s
                JOIN subtree t ON s.parent_session_id = t.id
            )
            SELECT COUNT(*) FROM {SCHEMA}.sessions
            WHERE id IN (SELECT id FROM subtree) AND status NOT IN ('STOPPED', 'FAILED')
            "#
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_terminal_matches_stopped_at_invariant() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Starting.is_terminal());
    }
}
