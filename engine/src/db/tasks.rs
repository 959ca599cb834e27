/// Agent task and step persistence
///
/// This module is the durable Task/Step store and the single source of truth
/// for task status, iteration counters, retry counts and idempotency history.
/// Every mutation is one committed transition scoped to a single task's rows.
/// All queries use parameterized statements.
use anyhow::{anyhow, Context, Result};
use sdk::errors::EngineError;
use sdk::types::{
    AgentTaskListItem, AgentTaskResponse, RunMode, StepStatus, StepType, TaskStatus,
};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::agent::planner::MAX_TOOL_RETRIES;
use crate::config::AgentConfig;

/// Hard bounds for list-by-document queries
pub const MIN_LIST_LIMIT: i64 = 1;
pub const MAX_LIST_LIMIT: i64 = 50;

/// Clamp a caller supplied list limit into `MIN_LIST_LIMIT..=MAX_LIST_LIMIT`
pub fn clamp_list_limit(limit: i64) -> i64 {
    limit.clamp(MIN_LIST_LIMIT, MAX_LIST_LIMIT)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fields needed to insert a task row
#[derive(Debug, Clone)]
pub struct NewTask {
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub knowledge_base_id: Option<i64>,
    pub run_mode: RunMode,
    pub requirement: Option<String>,
    pub project_params: Option<String>,
    pub created_by: Option<i64>,
    pub max_iterations: i64,
}

/// Fields needed to open a step
#[derive(Debug, Clone)]
pub struct StartStep {
    pub task_id: i64,
    pub iteration_no: i64,
    pub step_code: String,
    pub step_name: String,
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub reason: Option<String>,
    pub args_json: String,
    pub idempotency_key: Option<String>,
    pub timeout_ms: u64,
}

/// Task row
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub knowledge_base_id: Option<i64>,
    pub run_mode: RunMode,
    pub requirement: Option<String>,
    pub project_params: Option<String>,
    pub max_iterations: i64,
    pub current_iteration: i64,
    pub status: TaskStatus,
    pub final_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Step row
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: i64,
    pub task_id: i64,
    pub iteration_no: i64,
    pub step_code: String,
    pub step_name: String,
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub status: StepStatus,
    pub reason: Option<String>,
    pub args_json: Option<String>,
    pub idempotency_key: Option<String>,
    pub retry_count: i64,
    pub timeout_ms: i64,
    pub observation: Option<String>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// A task together with its steps ordered by iteration, then creation
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task: TaskRecord,
    pub steps: Vec<StepRecord>,
}

impl TaskSnapshot {
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Progress payload serialised into the detail view
    pub fn payload(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .steps
            .iter()
            .map(|step| {
                json!({
                    "id": step.step_code,
                    "name": step.step_name,
                    "type": step.step_type.as_str(),
                    "tool": step.tool_name,
                    "status": step.status.as_str(),
                    "reason": step.reason,
                    "error": step.error_message,
                    "observation": step.observation,
                    "retryCount": step.retry_count,
                    "timeoutMs": step.timeout_ms,
                    "idempotencyKey": step.idempotency_key,
                    "startedAt": step.started_at,
                    "finishedAt": step.finished_at,
                })
            })
            .collect();

        json!({
            "mode": self.task.run_mode.as_str(),
            "maxIterations": self.task.max_iterations,
            "currentIteration": self.task.current_iteration,
            "total": self.steps.len(),
            "success": self.count_steps(StepStatus::Success),
            "failed": self.count_steps(StepStatus::Failed),
            "finalSummary": self.task.final_summary,
            "steps": steps,
        })
    }

    pub fn to_response(&self) -> AgentTaskResponse {
        task_response(&self.task, self.payload().to_string())
    }
}

/// Task row annotated with step counts computed at read time
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: i64,
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub run_mode: RunMode,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub total_steps: i64,
    pub success_steps: i64,
    pub failed_steps: i64,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl From<TaskSummary> for AgentTaskListItem {
    fn from(summary: TaskSummary) -> Self {
        AgentTaskListItem {
            id: summary.id.to_string(),
            document_id: summary.document_id,
            section_id: summary.section_id,
            run_mode: summary.run_mode,
            status: summary.status,
            error_message: summary.error_message,
            total_steps: summary.total_steps,
            success_steps: summary.success_steps,
            failed_steps: summary.failed_steps,
            created_at: summary.created_at,
            finished_at: summary.finished_at,
        }
    }
}

/// Deadlines after which restart recovery treats RUNNING work as abandoned
///
/// A step is stale once every attempt it may make has timed out. A task is
/// stale once it has no open step and nothing happened for longer than a
/// planning call may take. Work inside those bounds may belong to another
/// live process sharing the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Attempts a tool step may make, each bounded by its `timeout_ms`
    pub step_attempts: i64,
    pub step_grace_ms: i64,
    pub task_idle_ms: i64,
}

impl ReconcilePolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        let grace = to_millis(config.reconcile_grace_ms);
        Self {
            step_attempts: MAX_TOOL_RETRIES + 1,
            step_grace_ms: grace.saturating_add(
                to_millis(config.max_retry_backoff_ms).saturating_mul(MAX_TOOL_RETRIES),
            ),
            task_idle_ms: grace.saturating_add(to_millis(config.planner_timeout_ms)),
        }
    }
}

fn to_millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Counts of rows touched by crash recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub steps_failed: u64,
    pub tasks_failed: u64,
}

pub(crate) fn task_response(task: &TaskRecord, payload: String) -> AgentTaskResponse {
    AgentTaskResponse {
        id: task.id.to_string(),
        document_id: task.document_id,
        section_id: task.section_id,
        run_mode: task.run_mode,
        status: task.status,
        error_message: task.error_message.clone(),
        response: payload,
        created_at: task.created_at,
        finished_at: task.finished_at,
    }
}

const TASK_COLUMNS: &str = "id, document_id, section_id, knowledge_base_id, run_mode, requirement, \
     project_params, max_iterations, current_iteration, status, final_summary, error_message, \
     created_by, created_at, started_at, finished_at";

const STEP_COLUMNS: &str = "id, task_id, iteration_no, step_code, step_name, step_type, tool_name, \
     status, reason, args_json, idempotency_key, retry_count, timeout_ms, observation, \
     error_message, started_at, finished_at";

fn parse_run_mode(raw: &str) -> Result<RunMode> {
    match raw {
        "STANDARD" => Ok(RunMode::Standard),
        "FAST_DRAFT" => Ok(RunMode::FastDraft),
        other => Err(anyhow!("Unknown run mode in store: {}", other)),
    }
}

fn parse_task_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| anyhow!("Unknown task status in store: {}", raw))
}

fn task_from_row(r: &SqliteRow) -> Result<TaskRecord> {
    Ok(TaskRecord {
        id: r.get("id"),
        document_id: r.get("document_id"),
        section_id: r.get("section_id"),
        knowledge_base_id: r.get("knowledge_base_id"),
        run_mode: parse_run_mode(r.get::<&str, _>("run_mode"))?,
        requirement: r.get("requirement"),
        project_params: r.get("project_params"),
        max_iterations: r.get("max_iterations"),
        current_iteration: r.get("current_iteration"),
        status: parse_task_status(r.get::<&str, _>("status"))?,
        final_summary: r.get("final_summary"),
        error_message: r.get("error_message"),
        created_by: r.get("created_by"),
        created_at: r.get("created_at"),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
    })
}

fn step_from_row(r: &SqliteRow) -> Result<StepRecord> {
    let step_type: &str = r.get("step_type");
    let status: &str = r.get("status");
    Ok(StepRecord {
        id: r.get("id"),
        task_id: r.get("task_id"),
        iteration_no: r.get("iteration_no"),
        step_code: r.get("step_code"),
        step_name: r.get("step_name"),
        step_type: StepType::parse(step_type)
            .ok_or_else(|| anyhow!("Unknown step type in store: {}", step_type))?,
        tool_name: r.get("tool_name"),
        status: StepStatus::parse(status)
            .ok_or_else(|| anyhow!("Unknown step status in store: {}", status))?,
        reason: r.get("reason"),
        args_json: r.get("args_json"),
        idempotency_key: r.get("idempotency_key"),
        retry_count: r.get("retry_count"),
        timeout_ms: r.get("timeout_ms"),
        observation: r.get("observation"),
        error_message: r.get("error_message"),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
    })
}

/// Task/Step repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    /// Create a new task repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a task with status RUNNING and `current_iteration = 0`
    pub async fn create_task(&self, new_task: &NewTask) -> Result<TaskRecord> {
        let now = now_millis();

        let result = sqlx::query(
            "INSERT INTO agent_tasks (document_id, section_id, knowledge_base_id, run_mode, \
             requirement, project_params, max_iterations, current_iteration, status, created_by, \
             created_at, started_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(new_task.document_id)
        .bind(new_task.section_id)
        .bind(new_task.knowledge_base_id)
        .bind(new_task.run_mode.as_str())
        .bind(&new_task.requirement)
        .bind(&new_task.project_params)
        .bind(new_task.max_iterations)
        .bind(TaskStatus::Running.as_str())
        .bind(new_task.created_by)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create agent task")?;

        Ok(TaskRecord {
            id: result.last_insert_rowid(),
            document_id: new_task.document_id,
            section_id: new_task.section_id,
            knowledge_base_id: new_task.knowledge_base_id,
            run_mode: new_task.run_mode,
            requirement: new_task.requirement.clone(),
            project_params: new_task.project_params.clone(),
            max_iterations: new_task.max_iterations,
            current_iteration: 0,
            status: TaskStatus::Running,
            final_summary: None,
            error_message: None,
            created_by: new_task.created_by,
            created_at: now,
            started_at: now,
            finished_at: None,
        })
    }

    /// Advance the owning task's iteration and open a RUNNING step
    ///
    /// Both writes commit together. The iteration update runs first so the
    /// transaction takes the write lock before it reads anything.
    pub async fn start_step(&self, step: &StartStep) -> Result<i64> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let advanced = sqlx::query(
            "UPDATE agent_tasks SET current_iteration = ? \
             WHERE id = ? AND status = 'RUNNING' AND ? >= 1 \
             AND ? >= current_iteration AND ? <= max_iterations",
        )
        .bind(step.iteration_no)
        .bind(step.task_id)
        .bind(step.iteration_no)
        .bind(step.iteration_no)
        .bind(step.iteration_no)
        .execute(&mut *tx)
        .await
        .context("Failed to advance task iteration")?;

        if advanced.rows_affected() == 0 {
            let row = sqlx::query(
                "SELECT status, current_iteration, max_iterations FROM agent_tasks WHERE id = ?",
            )
            .bind(step.task_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to inspect agent task")?;
            tx.rollback().await.ok();

            let Some(row) = row else {
                return Err(EngineError::TaskNotFound(step.task_id).into());
            };
            if parse_task_status(row.get::<&str, _>("status"))?.is_terminal() {
                return Err(EngineError::TaskAlreadyTerminal(step.task_id).into());
            }
            return Err(EngineError::IterationOutOfRange {
                task_id: step.task_id,
                requested: step.iteration_no,
                current: row.get("current_iteration"),
                max: row.get("max_iterations"),
            }
            .into());
        }

        let inserted = sqlx::query(
            "INSERT INTO agent_steps (task_id, iteration_no, step_code, step_name, step_type, \
             tool_name, status, reason, args_json, idempotency_key, retry_count, timeout_ms, \
             started_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(step.task_id)
        .bind(step.iteration_no)
        .bind(&step.step_code)
        .bind(&step.step_name)
        .bind(step.step_type.as_str())
        .bind(&step.tool_name)
        .bind(StepStatus::Running.as_str())
        .bind(&step.reason)
        .bind(&step.args_json)
        .bind(&step.idempotency_key)
        .bind(step.timeout_ms as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert agent step")?;

        tx.commit().await.context("Failed to commit step start")?;

        Ok(inserted.last_insert_rowid())
    }

    /// Move a RUNNING step to its terminal status
    pub async fn finish_step(
        &self,
        step_id: i64,
        success: bool,
        observation: Option<&str>,
        error: Option<&str>,
        retry_count: u32,
    ) -> Result<()> {
        let now = now_millis();
        let status = if success {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };

        let result = sqlx::query(
            "UPDATE agent_steps SET status = ?, observation = ?, error_message = ?, \
             retry_count = ?, finished_at = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(status.as_str())
        .bind(observation)
        .bind(error)
        .bind(retry_count as i64)
        .bind(now)
        .bind(step_id)
        .execute(&self.pool)
        .await
        .context("Failed to finish agent step")?;

        if result.rows_affected() == 0 {
            return Err(match self.get_step(step_id).await? {
                Some(_) => EngineError::StepAlreadyFinished(step_id),
                None => EngineError::StepNotFound(step_id),
            }
            .into());
        }

        Ok(())
    }

    /// Whether a step carrying this idempotency key already succeeded.
    /// Blank or absent keys never match.
    pub async fn has_successful_idempotency_step(
        &self,
        task_id: i64,
        idempotency_key: Option<&str>,
    ) -> Result<bool> {
        let Some(key) = idempotency_key.filter(|k| !k.trim().is_empty()) else {
            return Ok(false);
        };

        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM agent_steps WHERE task_id = ? AND idempotency_key = ? \
             AND status = 'SUCCESS' LIMIT 1",
        )
        .bind(task_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check idempotency key")?;

        Ok(found.is_some())
    }

    /// Terminal SUCCESS transition
    pub async fn finish_task_success(&self, task_id: i64, summary: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agent_tasks SET status = 'SUCCESS', final_summary = ?, error_message = NULL, \
             finished_at = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(summary)
        .bind(now_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark agent task successful")?;

        self.ensure_terminal_transition(task_id, result.rows_affected())
            .await
    }

    /// Terminal FAILED transition. Steps of the task still RUNNING (a worker
    /// that aborted mid-step) fail with it.
    pub async fn finish_task_failed(&self, task_id: i64, error: &str) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let result = sqlx::query(
            "UPDATE agent_tasks SET status = 'FAILED', error_message = ?, final_summary = NULL, \
             finished_at = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(error)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark agent task failed")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back")?;
            return self.ensure_terminal_transition(task_id, 0).await;
        }

        sqlx::query(
            "UPDATE agent_steps SET status = 'FAILED', error_message = ?, finished_at = ? \
             WHERE task_id = ? AND status = 'RUNNING'",
        )
        .bind(error)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("Failed to fail open agent steps")?;

        tx.commit().await.context("Failed to commit task failure")?;
        Ok(())
    }

    async fn ensure_terminal_transition(&self, task_id: i64, rows_affected: u64) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM agent_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to inspect agent task")?;
        Err(match exists {
            Some(_) => EngineError::TaskAlreadyTerminal(task_id),
            None => EngineError::TaskNotFound(task_id),
        }
        .into())
    }

    /// Load a task row without its steps
    pub async fn get_task_record(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agent_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch agent task")?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Load a task and its ordered steps
    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskSnapshot>> {
        let Some(task) = self.get_task_record(task_id).await? else {
            return Ok(None);
        };
        let steps = self.get_task_steps(task_id).await?;
        Ok(Some(TaskSnapshot { task, steps }))
    }

    /// All steps of a task ordered by iteration, then creation
    pub async fn get_task_steps(&self, task_id: i64) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agent_steps WHERE task_id = ? ORDER BY iteration_no ASC, id ASC",
            STEP_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch agent steps")?;

        rows.iter().map(step_from_row).collect()
    }

    /// Load a single step
    pub async fn get_step(&self, step_id: i64) -> Result<Option<StepRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agent_steps WHERE id = ?",
            STEP_COLUMNS
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch agent step")?;

        row.as_ref().map(step_from_row).transpose()
    }

    /// Most recent tasks for a document with aggregate step counts, newest first
    pub async fn list_tasks_by_document(
        &self,
        document_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskSummary>> {
        let rows = sqlx::query(
            "SELECT t.id, t.document_id, t.section_id, t.run_mode, t.status, t.error_message, \
             t.created_at, t.finished_at, \
             COUNT(s.id) AS total_steps, \
             COALESCE(SUM(CASE WHEN s.status = 'SUCCESS' THEN 1 ELSE 0 END), 0) AS success_steps, \
             COALESCE(SUM(CASE WHEN s.status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed_steps \
             FROM agent_tasks t LEFT JOIN agent_steps s ON s.task_id = t.id \
             WHERE t.document_id = ? \
             GROUP BY t.id \
             ORDER BY t.created_at DESC, t.id DESC \
             LIMIT ?",
        )
        .bind(document_id)
        .bind(clamp_list_limit(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list agent tasks")?;

        rows.iter()
            .map(|r| {
                Ok(TaskSummary {
                    id: r.get("id"),
                    document_id: r.get("document_id"),
                    section_id: r.get("section_id"),
                    run_mode: parse_run_mode(r.get::<&str, _>("run_mode"))?,
                    status: parse_task_status(r.get::<&str, _>("status"))?,
                    error_message: r.get("error_message"),
                    total_steps: r.get("total_steps"),
                    success_steps: r.get("success_steps"),
                    failed_steps: r.get("failed_steps"),
                    created_at: r.get("created_at"),
                    finished_at: r.get("finished_at"),
                })
            })
            .collect()
    }

    /// Fail RUNNING steps and tasks that are past the policy's deadlines, in
    /// one transaction
    ///
    /// A task qualifies only when every open step of it is stale as well, so
    /// tasks are judged before their steps are closed.
    pub async fn reconcile_interrupted(
        &self,
        reason: &str,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileReport> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let tasks = sqlx::query(
            "UPDATE agent_tasks SET status = 'FAILED', error_message = ?, final_summary = NULL, \
             finished_at = ? \
             WHERE status = 'RUNNING' \
             AND NOT EXISTS (SELECT 1 FROM agent_steps s \
                 WHERE s.task_id = agent_tasks.id AND s.status = 'RUNNING' \
                 AND s.started_at + s.timeout_ms * ? + ? > ?) \
             AND MAX(agent_tasks.started_at, COALESCE((SELECT MAX(COALESCE(s.finished_at, s.started_at)) \
                 FROM agent_steps s WHERE s.task_id = agent_tasks.id), 0)) + ? <= ?",
        )
        .bind(reason)
        .bind(now)
        .bind(policy.step_attempts)
        .bind(policy.step_grace_ms)
        .bind(now)
        .bind(policy.task_idle_ms)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to fail interrupted tasks")?;

        let steps = sqlx::query(
            "UPDATE agent_steps SET status = 'FAILED', error_message = ?, finished_at = ? \
             WHERE status = 'RUNNING' \
             AND started_at + timeout_ms * ? + ? <= ?",
        )
        .bind(reason)
        .bind(now)
        .bind(policy.step_attempts)
        .bind(policy.step_grace_ms)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to fail interrupted steps")?;

        tx.commit().await.context("Failed to commit reconciliation")?;

        Ok(ReconcileReport {
            steps_failed: steps.rows_affected(),
            tasks_failed: tasks.rows_affected(),
        })
    }
}
