//! Task Lifecycle Service
//!
//! Creates task rows, hands each one to a bounded worker pool and exposes the
//! read side of the store. Every submitted run is supervised: its outcome,
//! including a panic inside the worker, always ends in exactly one terminal
//! store transition followed by exactly one terminal bus event.

use sdk::errors::EngineError;
use sdk::types::{AgentTaskCreateRequest, AgentTaskListItem, AgentTaskResponse, RunMode};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{AgentContext, AgentCore};
use crate::config::AgentConfig;
use crate::db::{
    into_engine_error, NewTask, ReconcilePolicy, ReconcileReport, TaskRepository, TaskSnapshot,
};
use crate::message_bus::{Event, MessageBus};

/// List size used when the caller supplies none
pub const DEFAULT_LIST_LIMIT: i64 = 10;

/// Error message recorded on work interrupted by a restart
pub const INTERRUPTED_MESSAGE: &str = "interrupted: process restarted";

/// Terminal result of one supervised run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(String),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }
}

/// Handle returned by `create_and_run` before the run starts
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: i64,
    pub run_mode: RunMode,
    pub max_iterations: i64,
    completion: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the terminal transition
    pub async fn wait(self) -> Result<TaskOutcome, EngineError> {
        self.completion
            .await
            .map_err(|e| EngineError::WorkerAborted(e.to_string()))
    }
}

pub struct TaskService {
    task_repo: Arc<TaskRepository>,
    core: Arc<AgentCore>,
    bus: Arc<MessageBus>,
    config: AgentConfig,
    workers: Arc<Semaphore>,
}

impl TaskService {
    pub fn new(
        task_repo: Arc<TaskRepository>,
        core: Arc<AgentCore>,
        bus: Arc<MessageBus>,
        config: AgentConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            task_repo,
            core,
            bus,
            config,
            workers,
        }
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Fail steps and tasks left RUNNING by a process that is gone. Work
    /// still inside its step or planner deadline is left alone, since another
    /// process may own it.
    pub async fn recover(&self) -> Result<ReconcileReport, EngineError> {
        let policy = ReconcilePolicy::from_config(&self.config);
        let report = self
            .task_repo
            .reconcile_interrupted(INTERRUPTED_MESSAGE, &policy)
            .await
            .map_err(into_engine_error)?;

        if report.tasks_failed > 0 || report.steps_failed > 0 {
            warn!(
                "Reconciled {} interrupted task(s) and {} step(s)",
                report.tasks_failed, report.steps_failed
            );
        }
        Ok(report)
    }

    /// Persist a task and queue it for a worker. Returns without waiting for
    /// the run.
    pub async fn create_and_run(
        &self,
        request: AgentTaskCreateRequest,
    ) -> Result<TaskHandle, EngineError> {
        let document_id = request
            .document_id
            .ok_or_else(|| EngineError::InvalidArgument("documentId is required".to_string()))?;
        let run_mode = RunMode::from_nullable(request.run_mode.as_deref());
        let max_iterations = self.config.max_iterations_for(run_mode);

        let task = self
            .task_repo
            .create_task(&NewTask {
                document_id,
                section_id: request.section_id,
                knowledge_base_id: request.knowledge_base_id,
                run_mode,
                requirement: request.requirement,
                project_params: request.project_params,
                created_by: request.created_by,
                max_iterations,
            })
            .await
            .map_err(into_engine_error)?;

        info!(
            task_id = task.id,
            "Created agent task for document {} ({} mode, {} iterations)",
            document_id,
            run_mode,
            max_iterations
        );
        self.bus
            .publish(Event::TaskCreated {
                task_id: task.id,
                document_id,
                max_iterations,
            })
            .await;

        let task_id = task.id;
        let ctx = AgentContext::from_task(&task, self.config.observation_window);
        let core = Arc::clone(&self.core);
        let task_repo = Arc::clone(&self.task_repo);
        let bus = Arc::clone(&self.bus);
        let workers = Arc::clone(&self.workers);

        let completion = tokio::spawn(async move {
            let outcome = match workers.acquire_owned().await {
                Ok(permit) => {
                    // Inner spawn so a panic in the run surfaces as a JoinError here
                    let run = tokio::spawn(async move {
                        let _permit = permit;
                        let mut ctx = ctx;
                        core.run(&mut ctx).await
                    });
                    match run.await {
                        Ok(Ok(summary)) => TaskOutcome::Succeeded(summary),
                        Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                        Err(e) => {
                            TaskOutcome::Failed(EngineError::WorkerAborted(e.to_string()).to_string())
                        }
                    }
                }
                Err(_) => TaskOutcome::Failed(
                    EngineError::WorkerAborted("worker pool closed".to_string()).to_string(),
                ),
            };
            complete(&task_repo, &bus, task_id, outcome).await
        });

        Ok(TaskHandle {
            task_id,
            run_mode,
            max_iterations,
            completion,
        })
    }

    /// Task detail. Fails with `TaskNotFound` for unknown ids.
    pub async fn get_task(&self, task_id: i64) -> Result<AgentTaskResponse, EngineError> {
        Ok(self.get_snapshot(task_id).await?.to_response())
    }

    pub async fn get_snapshot(&self, task_id: i64) -> Result<TaskSnapshot, EngineError> {
        self.task_repo
            .get_task(task_id)
            .await
            .map_err(into_engine_error)?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Newest tasks of a document with step counts. The limit defaults to
    /// `DEFAULT_LIST_LIMIT` and is clamped to 1..=50.
    pub async fn list_tasks_by_document(
        &self,
        document_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<AgentTaskListItem>, EngineError> {
        let document_id = document_id
            .ok_or_else(|| EngineError::InvalidArgument("documentId is required".to_string()))?;

        let summaries = self
            .task_repo
            .list_tasks_by_document(document_id, limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await
            .map_err(into_engine_error)?;

        Ok(summaries.into_iter().map(AgentTaskListItem::from).collect())
    }
}

/// Apply the terminal transition for a finished run and announce it.
///
/// A store failure while recording success is itself recorded as a failure.
async fn complete(
    task_repo: &TaskRepository,
    bus: &MessageBus,
    task_id: i64,
    outcome: TaskOutcome,
) -> TaskOutcome {
    let outcome = match outcome {
        TaskOutcome::Succeeded(summary) => {
            match task_repo.finish_task_success(task_id, &summary).await {
                Ok(()) => TaskOutcome::Succeeded(summary),
                Err(e) => {
                    let message = into_engine_error(e).to_string();
                    record_failure(task_repo, task_id, &message).await;
                    TaskOutcome::Failed(message)
                }
            }
        }
        TaskOutcome::Failed(message) => {
            record_failure(task_repo, task_id, &message).await;
            TaskOutcome::Failed(message)
        }
    };

    let event = match &outcome {
        TaskOutcome::Succeeded(summary) => {
            info!(task_id, "Agent task succeeded");
            Event::TaskSucceeded {
                task_id,
                summary: summary.clone(),
            }
        }
        TaskOutcome::Failed(message) => {
            error!(task_id, "Agent task failed: {}", message);
            Event::TaskFailed {
                task_id,
                error: message.clone(),
            }
        }
    };
    bus.publish(event).await;
    outcome
}

async fn record_failure(task_repo: &TaskRepository, task_id: i64, message: &str) {
    if let Err(e) = task_repo.finish_task_failed(task_id, message).await {
        error!(task_id, "Failed to record task failure: {:#}", e);
    }
}
