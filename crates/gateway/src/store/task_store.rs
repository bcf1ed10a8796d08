//! Task definitions, runs, and schedule-change history.

use common::error::{CoreError, CoreResult};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

const SCHEMA: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunStatus {
    Scheduled,
    WaitingDependency,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::WaitingDependency => "WAITING_DEPENDENCY",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Task {
    pub id: String,
    pub task_name: String,
    pub template_prompt: String,
    pub required_parameters: Vec<String>,
    pub optional_parameters: serde_json::Value,
    pub schedule_cron: Option<String>,
    pub schedule_timezone: Option<String>,
    pub enabled: bool,
    pub paused: bool,
    pub task_type: String,
    pub depends_on_task_ids: Vec<String>,
    pub dependency_mode: String,
    pub notify_on_complete: bool,
    pub notify_on_error: bool,
    pub run_count: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub avg_duration_seconds: f64,
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub owner_user_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    pub session_id: Option<String>,
    pub status: String,
    pub trigger: String,
    pub parameters: serde_json::Value,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<f64>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScheduleHistoryEntry {
    pub id: String,
    pub task_id: String,
    pub action: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub triggered_by: String,
    pub user_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub async fn create_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SCHEMA}.tasks (
            id TEXT PRIMARY KEY,
            task_name TEXT NOT NULL UNIQUE,
            template_prompt TEXT NOT NULL,
            required_parameters TEXT[] NOT NULL DEFAULT '{{}}',
            optional_parameters JSONB NOT NULL DEFAULT '{{}}',
            schedule_cron TEXT,
            schedule_timezone TEXT,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            paused BOOLEAN NOT NULL DEFAULT FALSE,
            task_type TEXT NOT NULL DEFAULT 'session',
            depends_on_task_ids TEXT[] NOT NULL DEFAULT '{{}}',
            dependency_mode TEXT NOT NULL DEFAULT 'all',
            notify_on_complete BOOLEAN NOT NULL DEFAULT FALSE,
            notify_on_error BOOLEAN NOT NULL DEFAULT FALSE,
            run_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            avg_duration_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
            last_run_at TIMESTAMPTZ,
            owner_user_id TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SCHEMA}.task_runs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES {SCHEMA}.tasks(id),
            session_id TEXT,
            status TEXT NOT NULL DEFAULT 'STARTING',
            trigger TEXT NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{{}}',
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            duration_seconds DOUBLE PRECISION,
            result_summary TEXT,
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SCHEMA}.schedule_history (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES {SCHEMA}.tasks(id),
            action TEXT NOT NULL,
            before JSONB,
            after JSONB,
            triggered_by TEXT NOT NULL,
            user_id TEXT,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_task_runs_task ON {SCHEMA}.task_runs(task_id, created_at DESC)"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        id: &str,
        task_name: &str,
        template_prompt: &str,
        required_parameters: &[String],
        optional_parameters: serde_json::Value,
        schedule_cron: Option<&str>,
        schedule_timezone: Option<&str>,
        owner_user_id: &str,
    ) -> CoreResult<Task> {
        let existing = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {SCHEMA}.tasks WHERE task_name = $1 AND deleted_at IS NULL"
        ))
        .bind(task_name)
        .fetch_one(&self.pool)
        .await?;
        if existing > 0 {
            return Err(CoreError::Conflict(format!("task name '{task_name}' already exists")));
        }

        let task = sqlx::query_as::<_, Task>(&format!(
            "INSERT INTO {SCHEMA}.tasks \
             (id, task_name, template_prompt, required_parameters, optional_parameters, schedule_cron, schedule_timezone, owner_user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *"
        ))
        .bind(id)
        .bind(task_name)
        .bind(template_prompt)
        .bind(required_parameters)
        .bind(optional_parameters)
        .bind(schedule_cron)
        .bind(schedule_timezone)
        .bind(owner_user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn get_by_id(&self, id: &str) -> CoreResult<Task> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT * FROM {SCHEMA}.tasks WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    pub async fn list_scheduled(&self) -> CoreResult<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT * FROM {SCHEMA}.tasks \
             WHERE enabled AND NOT paused AND deleted_at IS NULL AND schedule_cron IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn set_schedule(
        &self,
        id: &str,
        cron: Option<&str>,
        timezone: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {SCHEMA}.tasks SET schedule_cron = $1, schedule_timezone = $2 WHERE id = $3"
        ))
        .bind(cron)
        .bind(timezone)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Partial update of a task's mutable definition fields. `None` leaves
    /// a field unchanged.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_definition(
        &self,
        id: &str,
        template_prompt: Option<&str>,
        required_parameters: Option<&[String]>,
        optional_parameters: Option<serde_json::Value>,
        enabled: Option<bool>,
        notify_on_complete: Option<bool>,
        notify_on_error: Option<bool>,
    ) -> CoreResult<Task> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "UPDATE {SCHEMA}.tasks SET \
             template_prompt = COALESCE($1, template_prompt), \
             required_parameters = COALESCE($2, required_parameters), \
             optional_parameters = COALESCE($3, optional_parameters), \
             enabled = COALESCE($4, enabled), \
             notify_on_complete = COALESCE($5, notify_on_complete), \
             notify_on_error = COALESCE($6, notify_on_error) \
             WHERE id = $7 AND deleted_at IS NULL RETURNING *"
        ))
        .bind(template_prompt)
        .bind(required_parameters)
        .bind(optional_parameters)
        .bind(enabled)
        .bind(notify_on_complete)
        .bind(notify_on_error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        Ok(task)
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> CoreResult<()> {
        sqlx::query(&format!("UPDATE {SCHEMA}.tasks SET paused = $1 WHERE id = $2"))
            .bind(paused)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str, hard: bool) -> CoreResult<()> {
        if hard {
            sqlx::query(&format!("DELETE FROM {SCHEMA}.tasks WHERE id = $1"))
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(&format!(
                "UPDATE {SCHEMA}.tasks SET deleted_at = NOW(), enabled = FALSE WHERE id = $1"
            ))
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Increment `run_count`, stamp `last_run_at`, and return the new
    /// `run_count` (used by `update_run`'s incremental average formula).
    pub async fn record_run_start(&self, task_id: &str) -> CoreResult<i32> {
        let row: (i32,) = sqlx::query_as(&format!(
            "UPDATE {SCHEMA}.tasks SET run_count = run_count + 1, last_run_at = NOW() \
             WHERE id = $1 RETURNING run_count"
        ))
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Roll `success_count`/`failure_count` and the running average
    /// duration: `avg' = round((avg * (n-1) + duration) / n)`, `n` being
    /// `run_count` after this run.
    pub async fn roll_run_counters(
        &self,
        task_id: &str,
        succeeded: bool,
        duration_seconds: f64,
    ) -> CoreResult<()> {
        let task = self.get_by_id(task_id).await?;
        let n = task.run_count.max(1) as f64;
        let new_avg = ((task.avg_duration_seconds * (n - 1.0) + duration_seconds) / n).round_ties_even();

        let query_str = if succeeded {
            format!(
                "UPDATE {SCHEMA}.tasks SET success_count = success_count + 1, avg_duration_seconds = $1 WHERE id = $2"
            )
        } else {
            format!(
                "UPDATE {SCHEMA}.tasks SET failure_count = failure_count + 1, avg_duration_seconds = $1 WHERE id = $2"
            )
        };
        sqlx::query(&query_str)
            .bind(new_avg)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_run(
        &self,
        id: &str,
        task_id: &str,
        trigger: &str,
        parameters: serde_json::Value,
        status: TaskRunStatus,
    ) -> CoreResult<TaskRun> {
        let run = sqlx::query_as::<_, TaskRun>(&format!(
            "INSERT INTO {SCHEMA}.task_runs (id, task_id, trigger, parameters, status, started_at) \
             VALUES ($1, $2, $3, $4, $5, CASE WHEN $5 = 'STARTING' THEN NOW() ELSE NULL END) RETURNING *"
        ))
        .bind(id)
        .bind(task_id)
        .bind(trigger)
        .bind(parameters)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> CoreResult<TaskRun> {
        sqlx::query_as::<_, TaskRun>(&format!("SELECT * FROM {SCHEMA}.task_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task run {id}")))
    }

    pub async fn update_run_status(
        &self,
        id: &str,
        status: TaskRunStatus,
        session_id: Option<&str>,
        result_summary: Option<&str>,
        error: Option<&str>,
    ) -> CoreResult<TaskRun> {
        let (completed_at_clause, duration_clause) = if status.is_terminal() {
            ("NOW()", "EXTRACT(EPOCH FROM (NOW() - COALESCE(started_at, NOW())))")
        } else {
            ("completed_at", "duration_seconds")
        };
        let run = sqlx::query_as::<_, TaskRun>(&format!(
            "UPDATE {SCHEMA}.task_runs SET status = $1, \
             session_id = COALESCE($2, session_id), \
             result_summary = COALESCE($3, result_summary), \
             error = COALESCE($4, error), \
             completed_at = {completed_at_clause}, \
             duration_seconds = {duration_clause} \
             WHERE id = $5 RETURNING *"
        ))
        .bind(status.as_str())
        .bind(session_id)
        .bind(result_summary)
        .bind(error)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn list_runs(&self, task_id: &str, limit: i64) -> CoreResult<Vec<TaskRun>> {
        let runs = sqlx::query_as::<_, TaskRun>(&format!(
            "SELECT * FROM {SCHEMA}.task_runs WHERE task_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    pub async fn log_schedule_change(
        &self,
        id: &str,
        task_id: &str,
        action: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        triggered_by: &str,
        user_id: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.schedule_history (id, task_id, action, before, after, triggered_by, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(id)
        .bind(task_id)
        .bind(action)
        .bind(before)
        .bind(after)
        .bind(triggered_by)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn history(&self, task_id: &str) -> CoreResult<Vec<ScheduleHistoryEntry>> {
        let rows = sqlx::query_as::<_, ScheduleHistoryEntry>(&format!(
            "SELECT * FROM {SCHEMA}.schedule_history WHERE task_id = $1 ORDER BY timestamp DESC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminal_set_matches_spec() {
        assert!(TaskRunStatus::Completed.is_terminal());
        assert!(TaskRunStatus::Failed.is_terminal());
        assert!(TaskRunStatus::Cancelled.is_terminal());
        assert!(!TaskRunStatus::Running.is_terminal());
        assert!(!TaskRunStatus::WaitingDependency.is_terminal());
    }

    #[test]
    fn avg_duration_formula_matches_round_half_to_even() {
        // avg' = round((avg*(n-1) + duration) / n), n = run_count after this run
        let avg = 10.0_f64;
        let n = 4.0_f64;
        let duration = 13.0_f64;
        let new_avg = ((avg * (n - 1.0) + duration) / n).round_ties_even();
        assert_eq!(new_avg, 11.0);
    }

    #[test]
    fn avg_duration_formula_breaks_ties_to_even() {
        // (avg=10, n=2, duration=11) -> (10*1 + 11) / 2 = 10.5, ties-to-even -> 10
        let new_avg = ((10.0_f64 * 1.0 + 11.0) / 2.0).round_ties_even();
        assert_eq!(new_avg, 10.0);
    }
}
