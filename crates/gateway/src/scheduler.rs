//! Wraps a cron engine: coalescing, misfire grace, pause/resume,
//! next-fire computation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common::error::{CoreError, CoreResult};
use cron::Schedule;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::settings;
use crate::session_service::{SessionService, WorkspaceMode};
use crate::store::task_store::TaskRunStatus;
use crate::store::TaskStore;
use crate::task_service::TaskService;

struct Job {
    schedule: Schedule,
    timezone: Tz,
    /// Guards against a scheduled fire overlapping a run still in flight
    /// (max_instances=1); a manual start always proceeds regardless.
    in_flight: Arc<Mutex<()>>,
}

#[derive(Clone)]
pub struct Scheduler {
    tasks: TaskStore,
    task_service: TaskService,
    sessions: SessionService,
    jobs: Arc<DashMap<String, Job>>,
}

fn parse_timezone(tz: Option<&str>) -> Tz {
    tz.and_then(|t| Tz::from_str(t).ok()).unwrap_or(Tz::UTC)
}

/// The `cron` crate requires a leading seconds field; task schedules are
/// authored in standard 5-field unix-cron, so a bare 5-field expression is
/// widened with `0` seconds before parsing.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_cron(expr))
}

impl Scheduler {
    pub fn new(tasks: TaskStore, task_service: TaskService, sessions: SessionService) -> Self {
        Self {
            tasks,
            task_service,
            sessions,
            jobs: Arc::new(DashMap::new()),
        }
    }

    fn job_key(task_id: &str) -> String {
        format!("task_{task_id}")
    }

    pub async fn add_task_schedule(
        &self,
        task_id: &str,
        cron_expr: &str,
        timezone: Option<&str>,
        triggered_by: &str,
        user_id: Option<&str>,
    ) -> CoreResult<()> {
        let schedule = parse_schedule(cron_expr)
            .map_err(|e| CoreError::BadRequest(format!("invalid cron expression: {e}")))?;
        let tz = parse_timezone(timezone);

        let before_task = self.tasks.get_by_id(task_id).await.ok();
        let before = before_task.as_ref().map(|t| {
            serde_json::json!({"schedule_cron": t.schedule_cron, "schedule_timezone": t.schedule_timezone})
        });

        self.tasks.set_schedule(task_id, Some(cron_expr), timezone).await?;

        self.jobs.insert(
            Self::job_key(task_id),
            Job {
                schedule,
                timezone: tz,
                in_flight: Arc::new(Mutex::new(())),
            },
        );

        self.tasks
            .log_schedule_change(
                &Uuid::new_v4().to_string(),
                task_id,
                "add",
                before,
                Some(serde_json::json!({"schedule_cron": cron_expr, "schedule_timezone": timezone})),
                triggered_by,
                user_id,
            )
            .await?;

        Ok(())
    }

    pub async fn remove_task_schedule(&self, task_id: &str, triggered_by: &str, user_id: Option<&str>) -> CoreResult<()> {
        self.jobs.remove(&Self::job_key(task_id));
        self.tasks.set_schedule(task_id, None, None).await?;
        self.tasks
            .log_schedule_change(&Uuid::new_v4().to_string(), task_id, "remove", None, None, triggered_by, user_id)
            .await?;
        Ok(())
    }

    pub async fn pause(&self, task_id: &str, user_id: Option<&str>) -> CoreResult<()> {
        self.tasks.set_paused(task_id, true).await?;
        self.tasks
            .log_schedule_change(&Uuid::new_v4().to_string(), task_id, "pause", None, None, "api", user_id)
            .await?;
        Ok(())
    }

    pub async fn resume(&self, task_id: &str, user_id: Option<&str>) -> CoreResult<()> {
        self.tasks.set_paused(task_id, false).await?;
        self.tasks
            .log_schedule_change(&Uuid::new_v4().to_string(), task_id, "resume", None, None, "api", user_id)
            .await?;
        Ok(())
    }

    pub fn next_fire_times(cron_expr: &str, timezone: Option<&str>, n: usize) -> CoreResult<Vec<DateTime<Utc>>> {
        let schedule = parse_schedule(cron_expr)
            .map_err(|e| CoreError::BadRequest(format!("invalid cron expression: {e}")))?;
        let tz = parse_timezone(timezone);
        let now = Utc::now().with_timezone(&tz);
        Ok(schedule.after(&now).take(n).map(|dt| dt.with_timezone(&Utc)).collect())
    }

    /// Re-register every enabled, non-paused, non-deleted task with a
    /// schedule. Failure on one task logs and continues with the rest.
    pub async fn reload_all_schedules(&self) -> CoreResult<()> {
        let tasks = self.tasks.list_scheduled().await?;
        for task in tasks {
            let Some(cron_expr) = &task.schedule_cron else { continue };
            if let Err(e) = self
                .add_task_schedule(&task.id, cron_expr, task.schedule_timezone.as_deref(), "startup_reload", None)
                .await
            {
                tracing::error!(task_id = %task.id, error = %e, "failed to reload schedule for task");
            }
        }
        Ok(())
    }

    /// Background loop: every tick, check each registered job's schedule
    /// against the clock and fire any that are due, honoring
    /// `misfire_grace_time=300s` and `max_instances=1`.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut last_checked: HashMap<String, DateTime<Utc>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler shutting down");
                    return;
                }
                _ = tick.tick() => {
                    self.check_due_jobs(&mut last_checked).await;
                }
            }
        }
    }

    async fn check_due_jobs(&self, last_checked: &mut HashMap<String, DateTime<Utc>>) {
        let s = settings();
        let grace = chrono::Duration::seconds(s.misfire_grace_secs);
        let now = Utc::now();

        for entry in self.jobs.iter() {
            let task_id = entry.key().strip_prefix("task_").unwrap_or(entry.key()).to_string();
            let job = entry.value();

            let since = last_checked.get(&task_id).copied().unwrap_or(now - chrono::Duration::seconds(1));
            let now_in_tz = now.with_timezone(&job.timezone);
            let since_in_tz = since.with_timezone(&job.timezone);

            let due = job
                .schedule
                .after(&since_in_tz)
                .take_while(|fire| *fire <= now_in_tz)
                .last();

            last_checked.insert(task_id.clone(), now);

            let Some(fire_time) = due else { continue };
            if now.signed_duration_since(fire_time.with_timezone(&Utc)) > grace {
                tracing::warn!(task_id = %task_id, "misfire grace exceeded, skipping");
                continue;
            }

            let Ok(lock) = job.in_flight.clone().try_lock_owned() else {
                tracing::info!(task_id = %task_id, "scheduled fire coalesced: run already in flight");
                continue;
            };

            let task_id = task_id.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let _lock = lock;
                if let Err(e) = this.fire(&task_id).await {
                    tracing::error!(task_id = %task_id, error = %e, "scheduled task fire failed");
                }
            });
        }
    }

    async fn fire(&self, task_id: &str) -> CoreResult<()> {
        let task = match self.tasks.get_by_id(task_id).await {
            Ok(t) => t,
            Err(_) => {
                tracing::info!(task_id, "task missing or deleted since scheduling, skipping");
                return Ok(());
            }
        };
        if !task.enabled || task.paused {
            tracing::info!(task_id, "task disabled or paused since scheduling, skipping");
            return Ok(());
        }

        let (run, filled_prompt) = self
            .task_service
            .start(task_id, task.optional_parameters.clone(), "scheduled")
            .await?;

        if run.status == TaskRunStatus::WaitingDependency.as_str() {
            return Ok(());
        }

        let result = self
            .sessions
            .create(&task.owner_user_id, None, WorkspaceMode::Ephemeral, "/workspace", serde_json::json!({}), Some(&filled_prompt))
            .await;

        match result {
            Ok(created) => {
                self.task_service
                    .update_run(&run.id, TaskRunStatus::Running, Some(&created.session_id), None, None)
                    .await?;
                self.task_service.track_run_completion(run.id.clone(), created.session_id.clone());
            }
            Err(e) => {
                self.task_service
                    .update_run(&run.id, TaskRunStatus::Failed, None, None, Some(&e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_validator_rejects_too_few_fields() {
        assert!(Schedule::from_str("* * *").is_err());
    }

    #[test]
    fn cron_validator_accepts_standard_five_field_style_expression() {
        assert!(Schedule::from_str("0 0 9 * * *").is_ok());
    }

    #[test]
    fn parse_schedule_normalizes_five_field_unix_cron() {
        assert!(parse_schedule("0 9 * * *").is_ok());
    }

    #[test]
    fn job_key_is_prefixed_with_task() {
        assert_eq!(Scheduler::job_key("abc"), "task_abc");
    }
}
