//! Task definitions, runs, parameter validation, template substitution,
//! run statistics.

use std::time::Duration;

use common::bus::{keys, BusClient};
use common::error::{CoreError, CoreResult};
use regex::Regex;
use uuid::Uuid;

use crate::config::settings;
use crate::platform_bridge::PlatformBridge;
use crate::store::task_store::{Task, TaskRun, TaskRunStatus};
use crate::store::TaskStore;

static TASK_NAME_RE: &str = r"^[a-z0-9-]+$";
static PLACEHOLDER_RE: &str = r"\{([a-zA-Z0-9_]+)\}";

#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    platform: PlatformBridge,
    bus: BusClient,
}

impl TaskService {
    pub fn new(store: TaskStore, platform: PlatformBridge, bus: BusClient) -> Self {
        Self { store, platform, bus }
    }

    /// Spawns a background task that polls the session's result key until
    /// the spawned session's turn finishes, then rolls the run to
    /// `Completed`/`Failed` accordingly — this is what lets
    /// `dependencies_satisfied` ever observe a completed dependency and
    /// `notify_on_complete` ever fire (§3, §4.H). Runs detached from the
    /// caller (HTTP handler or scheduler tick) so neither blocks on it.
    pub fn track_run_completion(&self, run_id: String, session_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(settings().task_run_timeout_secs);
            loop {
                match service.bus.get(&keys::result(&session_id)).await {
                    Ok(Some(raw)) => {
                        if let Ok(result) = serde_json::from_str::<serde_json::Value>(&raw) {
                            let subtype = result.get("subtype").and_then(|v| v.as_str()).unwrap_or("error");
                            let result_summary = result.get("result").and_then(|v| v.as_str());
                            let status = if subtype == "success" { TaskRunStatus::Completed } else { TaskRunStatus::Failed };
                            let error = (status == TaskRunStatus::Failed).then_some("agent run ended with an error");
                            let _ = service.update_run(&run_id, status, Some(&session_id), result_summary, error).await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(run_id, error = %e, "failed to poll task run result");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(run_id, session_id, "task run timed out waiting for session result, leaving run in its current status");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        task_name: &str,
        template_prompt: &str,
        required_parameters: &[String],
        optional_parameters: serde_json::Value,
        schedule_cron: Option<&str>,
        schedule_timezone: Option<&str>,
        owner_user_id: &str,
    ) -> CoreResult<Task> {
        let name_re = Regex::new(TASK_NAME_RE).expect("static regex");
        if !name_re.is_match(task_name) {
            return Err(CoreError::BadRequest(format!(
                "task_name '{task_name}' must match {TASK_NAME_RE}"
            )));
        }

        let placeholders = extract_placeholders(template_prompt);
        for required in required_parameters {
            if !placeholders.contains(required) {
                return Err(CoreError::BadRequest(format!(
                    "required parameter '{required}' does not appear in template_prompt"
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        self.store
            .create(
                &id,
                task_name,
                template_prompt,
                required_parameters,
                optional_parameters,
                schedule_cron,
                schedule_timezone,
                owner_user_id,
            )
            .await
    }

    /// Partial update. Re-validates the required-parameters-in-template
    /// invariant whenever either side of it changes.
    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        id: &str,
        template_prompt: Option<&str>,
        required_parameters: Option<&[String]>,
        optional_parameters: Option<serde_json::Value>,
        enabled: Option<bool>,
        notify_on_complete: Option<bool>,
        notify_on_error: Option<bool>,
    ) -> CoreResult<Task> {
        if template_prompt.is_some() || required_parameters.is_some() {
            let current = self.store.get_by_id(id).await?;
            let effective_template = template_prompt.unwrap_or(&current.template_prompt);
            let effective_required = required_parameters.unwrap_or(&current.required_parameters);
            let placeholders = extract_placeholders(effective_template);
            for required in effective_required {
                if !placeholders.contains(required) {
                    return Err(CoreError::BadRequest(format!(
                        "required parameter '{required}' does not appear in template_prompt"
                    )));
                }
            }
        }

        self.store
            .update_definition(
                id,
                template_prompt,
                required_parameters,
                optional_parameters,
                enabled,
                notify_on_complete,
                notify_on_error,
            )
            .await
    }

    /// Fill missing optional parameters with their defaults and reject if
    /// any required parameter is still absent.
    fn validate_task_parameters(
        &self,
        task: &Task,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> CoreResult<serde_json::Map<String, serde_json::Value>> {
        let mut filled = parameters.clone();

        if let Some(defaults) = task.optional_parameters.as_object() {
            for (name, default) in defaults {
                filled.entry(name.clone()).or_insert_with(|| default.clone());
            }
        }

        for required in &task.required_parameters {
            if !filled.contains_key(required) {
                return Err(CoreError::BadRequest(format!(
                    "missing required parameter '{required}'"
                )));
            }
        }

        Ok(filled)
    }

    /// Exact placeholder substitution. Fails if any `{name}` remains
    /// unsubstituted after filling every known parameter.
    fn fill_template(
        &self,
        template: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> CoreResult<String> {
        let mut filled = template.to_string();
        for (name, value) in parameters {
            let value_str = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            filled = filled.replace(&format!("{{{name}}}"), &value_str);
        }

        let remaining = extract_placeholders(&filled);
        if !remaining.is_empty() {
            return Err(CoreError::BadRequest(format!(
                "unsubstituted template placeholders: {:?}",
                remaining
            )));
        }

        Ok(filled)
    }

    /// Returns the created run and the filled prompt. The caller (Scheduler
    /// or HTTP handler) is responsible for creating the session and seeding
    /// the prompt onto its input queue.
    pub async fn start(
        &self,
        task_id: &str,
        parameters: serde_json::Value,
        trigger: &str,
    ) -> CoreResult<(TaskRun, String)> {
        let task = self.store.get_by_id(task_id).await?;
        if !task.enabled || task.paused {
            return Err(CoreError::Conflict(format!("task {task_id} is disabled or paused")));
        }

        let params_obj = parameters.as_object().cloned().unwrap_or_default();

        if !task.depends_on_task_ids.is_empty() {
            let satisfied = self.dependencies_satisfied(&task).await?;
            if !satisfied {
                let run = self
                    .store
                    .create_run(
                        &Uuid::new_v4().to_string(),
                        task_id,
                        trigger,
                        serde_json::Value::Object(params_obj),
                        TaskRunStatus::WaitingDependency,
                    )
                    .await?;
                return Ok((run, String::new()));
            }
        }

        let filled_params = self.validate_task_parameters(&task, &params_obj)?;
        let filled_prompt = self.fill_template(&task.template_prompt, &filled_params)?;

        let run = self
            .store
            .create_run(
                &Uuid::new_v4().to_string(),
                task_id,
                trigger,
                serde_json::Value::Object(filled_params),
                TaskRunStatus::Starting,
            )
            .await?;

        self.store.record_run_start(task_id).await?;

        Ok((run, filled_prompt))
    }

    async fn dependencies_satisfied(&self, task: &Task) -> CoreResult<bool> {
        let mut completed = 0usize;
        let total = task.depends_on_task_ids.len();
        for dep_id in &task.depends_on_task_ids {
            let runs = self.store.list_runs(dep_id, 1).await?;
            if runs.first().is_some_and(|r| r.status == TaskRunStatus::Completed.as_str()) {
                completed += 1;
            }
        }
        Ok(match task.dependency_mode.as_str() {
            "any" => completed > 0,
            _ => completed == total,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_run(
        &self,
        run_id: &str,
        status: TaskRunStatus,
        session_id: Option<&str>,
        result_summary: Option<&str>,
        error: Option<&str>,
    ) -> CoreResult<TaskRun> {
        let run = self
            .store
            .update_run_status(run_id, status, session_id, result_summary, error)
            .await?;

        if status.is_terminal() {
            let duration = run.duration_seconds.unwrap_or(0.0);
            let succeeded = status == TaskRunStatus::Completed;
            self.store.roll_run_counters(&run.task_id, succeeded, duration).await?;

            let task = self.store.get_by_id(&run.task_id).await?;
            let should_notify = (succeeded && task.notify_on_complete)
                || (!succeeded && task.notify_on_error);
            if should_notify {
                let message = format!(
                    "Task '{}' run {} finished with status {}",
                    task.task_name,
                    run.id,
                    status.as_str()
                );
                if let Some(sid) = &run.session_id {
                    let _ = self.platform.notify(sid, &message, "normal", None).await;
                }
            }
        }

        Ok(run)
    }

    pub async fn list_runs(&self, task_id: &str, limit: i64) -> CoreResult<Vec<TaskRun>> {
        self.store.list_runs(task_id, limit).await
    }

    pub async fn delete(&self, id: &str, hard: bool) -> CoreResult<()> {
        self.store.delete(id, hard).await
    }

    pub async fn get(&self, id: &str) -> CoreResult<Task> {
        self.store.get_by_id(id).await
    }
}

fn extract_placeholders(template: &str) -> std::collections::HashSet<String> {
    let re = Regex::new(PLACEHOLDER_RE).expect("static regex");
    re.captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_placeholders_finds_all_names() {
        let found = extract_placeholders("hello {name}, your id is {id}");
        assert!(found.contains("name"));
        assert!(found.contains("id"));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn task_name_regex_matches_spec() {
        let re = Regex::new(TASK_NAME_RE).unwrap();
        assert!(re.is_match("nightly-backup"));
        assert!(re.is_match("abc123"));
        assert!(!re.is_match("Nightly_Backup"));
        assert!(!re.is_match("has space"));
    }
}
