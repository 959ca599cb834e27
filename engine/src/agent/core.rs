//! Agent Core
//!
//! This module implements the Loop Controller that runs one task through an
//! iterative plan-act-observe cycle:
//!
//! 1. Ask the planner for the next action
//! 2. Finish: record a finish step and return the summary
//! 3. Tool call: skip it if its idempotency key already succeeded, otherwise
//!    persist a RUNNING step, invoke the tool under a timeout, retry
//!    recoverable failures with backoff and record the terminal status
//! 4. Fold the observation into working memory and plan again
//!
//! The controller never marks the task terminal itself. It returns the
//! summary or the error to the Task Lifecycle Service, which owns that
//! transition.
//!
//! # Limits
//!
//! - `max_iterations` per task, fixed at creation from the run mode
//! - `planner_timeout_ms` per planning call
//! - `timeoutMs` per tool attempt, floored at `min_tool_timeout_ms`

use sdk::errors::{EngineError, EngineErrorExt};
use sdk::types::{StepStatus, StepType, ToolArgs};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::planner::{self, Decision, Planner};
use super::AgentContext;
use crate::config::AgentConfig;
use crate::db::{into_engine_error, StartStep, TaskRepository};
use crate::message_bus::{Event, MessageBus};
use crate::tools::{ToolName, ToolRegistry};

/// Loop Controller for one task at a time
pub struct AgentCore {
    /// Planner producing the next action
    planner: Planner,

    /// Tool registry for dispatching tool calls
    tools: Arc<ToolRegistry>,

    /// Task repository for persistence
    task_repo: Arc<TaskRepository>,

    /// Bus receiving a `StepFinished` event per terminal step
    bus: Arc<MessageBus>,

    config: AgentConfig,
}

impl AgentCore {
    /// Create a new agent core
    pub fn new(
        planner: Planner,
        tools: Arc<ToolRegistry>,
        task_repo: Arc<TaskRepository>,
        bus: Arc<MessageBus>,
        config: AgentConfig,
    ) -> Self {
        Self {
            planner,
            tools,
            task_repo,
            bus,
            config,
        }
    }

    /// Run the loop to completion.
    ///
    /// Returns the finish summary, or the error that ended the run: a planning
    /// failure, an unknown tool, exhausted tool retries, an exhausted
    /// iteration budget or a store failure.
    pub async fn run(&self, ctx: &mut AgentContext) -> Result<String, EngineError> {
        info!(
            task_id = ctx.task_id,
            "Starting agent loop ({} mode, {} iterations max)",
            ctx.run_mode,
            ctx.max_iterations
        );

        for iteration in 1..=ctx.max_iterations {
            ctx.iteration = iteration;
            debug!(
                task_id = ctx.task_id,
                iteration,
                "Task {} iteration {}/{}",
                ctx.task_id,
                iteration,
                ctx.max_iterations
            );

            let decision = match self.planner.decide(ctx, &self.tools).await {
                Ok(decision) => decision,
                Err(e @ EngineError::PlanningFailed(_)) => {
                    self.record_rejected_plan(ctx, None, "", &e).await?;
                    error!(task_id = ctx.task_id, iteration, "Planning failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!(task_id = ctx.task_id, iteration, "Planner call failed: {}", e);
                    return Err(e);
                }
            };

            match decision {
                Decision::Finish { summary, reason } => {
                    return self.finish(ctx, summary, reason).await;
                }
                Decision::Tool { tool, args, reason } => {
                    let Some(name) = ToolName::parse(&tool).filter(|t| self.tools.is_registered(*t))
                    else {
                        let e = EngineError::UnknownTool(ToolName::normalize(&tool));
                        self.record_rejected_plan(ctx, Some(&tool), &reason, &e).await?;
                        error!(task_id = ctx.task_id, iteration, "Planner chose an unknown tool: {}", tool);
                        return Err(e);
                    };
                    self.execute(ctx, name, args, reason).await?;
                }
            }
        }

        let e = EngineError::IterationBudgetExhausted {
            max: ctx.max_iterations,
        };
        error!(task_id = ctx.task_id, "{}", e);
        Err(e)
    }

    /// Record the finish step and hand the summary back
    async fn finish(
        &self,
        ctx: &mut AgentContext,
        summary: String,
        reason: String,
    ) -> Result<String, EngineError> {
        let observation = format!("FINISH: {}", summary);
        let start = StartStep {
            task_id: ctx.task_id,
            iteration_no: ctx.iteration,
            step_code: step_code(ctx.iteration),
            step_name: "finish".to_string(),
            step_type: StepType::Finish,
            tool_name: None,
            reason: non_blank(reason),
            args_json: "{}".to_string(),
            idempotency_key: None,
            timeout_ms: 0,
        };
        self.record_step(ctx, start, Ok(&observation)).await?;

        ctx.observe(&observation);
        ctx.final_summary = Some(summary.clone());
        info!(task_id = ctx.task_id, iteration = ctx.iteration, "Agent loop finished");
        Ok(summary)
    }

    /// Execute one tool call with idempotency and retry handling
    async fn execute(
        &self,
        ctx: &mut AgentContext,
        tool: ToolName,
        args: ToolArgs,
        reason: String,
    ) -> Result<(), EngineError> {
        let args_json = args.to_json();
        let idempotency_key = tool
            .supports_idempotency()
            .then(|| planner::idempotency_key(ctx.task_id, tool.as_str(), &args_json));
        let timeout_ms = planner::resolve_timeout_ms(&args, &self.config);
        let max_retries = planner::resolve_max_retries(&args, &self.config);

        let already_done = self
            .task_repo
            .has_successful_idempotency_step(ctx.task_id, idempotency_key.as_deref())
            .await
            .map_err(into_engine_error)?;

        if already_done {
            // The key stays on the original step only
            let observation = format!("TOOL[{}] skipped: already completed", tool);
            let start = StartStep {
                task_id: ctx.task_id,
                iteration_no: ctx.iteration,
                step_code: step_code(ctx.iteration),
                step_name: tool.as_str().to_string(),
                step_type: StepType::ToolCall,
                tool_name: Some(tool.as_str().to_string()),
                reason: non_blank(reason),
                args_json,
                idempotency_key: None,
                timeout_ms,
            };
            self.record_step(ctx, start, Ok(&observation)).await?;
            ctx.observe(&observation);
            info!(task_id = ctx.task_id, iteration = ctx.iteration, "Skipped {}: already completed", tool);
            return Ok(());
        }

        let step_id = self
            .task_repo
            .start_step(&StartStep {
                task_id: ctx.task_id,
                iteration_no: ctx.iteration,
                step_code: step_code(ctx.iteration),
                step_name: tool.as_str().to_string(),
                step_type: StepType::ToolCall,
                tool_name: Some(tool.as_str().to_string()),
                reason: non_blank(reason),
                args_json,
                idempotency_key,
                timeout_ms,
            })
            .await
            .map_err(into_engine_error)?;

        let mut attempt: u32 = 0;
        loop {
            let result = match timeout(
                Duration::from_millis(timeout_ms),
                self.tools.invoke(tool, ctx, &args),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::ToolTimeout { timeout_ms }),
            };

            match result {
                Ok(text) => {
                    let observation = format!("TOOL[{}] {}", tool, text);
                    self.task_repo
                        .finish_step(step_id, true, Some(&observation), None, attempt)
                        .await
                        .map_err(into_engine_error)?;
                    self.publish_step(ctx, Some(tool.as_str()), StepStatus::Success)
                        .await;
                    ctx.observe(&observation);
                    debug!(
                        task_id = ctx.task_id,
                        iteration = ctx.iteration,
                        "Tool {} succeeded after {} retries",
                        tool,
                        attempt
                    );
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && attempt < max_retries => {
                    let delay = planner::backoff_ms(&self.config, attempt);
                    warn!(
                        task_id = ctx.task_id,
                        iteration = ctx.iteration,
                        "Tool {} attempt {} failed, retrying in {}ms: {}",
                        tool,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    // Failure text goes to working memory, not the step row
                    let observation = format!("TOOL[{}] FAILED: {}", tool, e);
                    let exhausted = EngineError::ToolRetriesExhausted {
                        tool: tool.as_str().to_string(),
                        attempts: attempt + 1,
                        error: e.to_string(),
                    };
                    let message = exhausted.to_string();
                    self.task_repo
                        .finish_step(step_id, false, None, Some(&message), attempt)
                        .await
                        .map_err(into_engine_error)?;
                    self.publish_step(ctx, Some(tool.as_str()), StepStatus::Failed)
                        .await;
                    ctx.observe(&observation);
                    error!(task_id = ctx.task_id, iteration = ctx.iteration, "{}", message);
                    return Err(exhausted);
                }
            }
        }
    }

    /// Persist a FAILED decision step for a plan the loop refuses to run
    async fn record_rejected_plan(
        &self,
        ctx: &AgentContext,
        tool: Option<&str>,
        reason: &str,
        cause: &EngineError,
    ) -> Result<(), EngineError> {
        let start = StartStep {
            task_id: ctx.task_id,
            iteration_no: ctx.iteration,
            step_code: step_code(ctx.iteration),
            step_name: "plan".to_string(),
            step_type: StepType::Decision,
            tool_name: tool.map(|t| t.trim().to_string()),
            reason: non_blank(reason.to_string()),
            args_json: "{}".to_string(),
            idempotency_key: None,
            timeout_ms: 0,
        };
        self.record_step(ctx, start, Err(&cause.to_string())).await
    }

    /// Start and immediately finish a step that runs no tool
    async fn record_step(
        &self,
        ctx: &AgentContext,
        start: StartStep,
        outcome: Result<&str, &str>,
    ) -> Result<(), EngineError> {
        let tool = start.tool_name.clone();
        let step_id = self
            .task_repo
            .start_step(&start)
            .await
            .map_err(into_engine_error)?;

        let (status, finished) = match outcome {
            Ok(observation) => (
                StepStatus::Success,
                self.task_repo
                    .finish_step(step_id, true, Some(observation), None, 0)
                    .await,
            ),
            Err(message) => (
                StepStatus::Failed,
                self.task_repo
                    .finish_step(step_id, false, None, Some(message), 0)
                    .await,
            ),
        };
        finished.map_err(into_engine_error)?;

        self.publish_step(ctx, tool.as_deref(), status).await;
        Ok(())
    }

    async fn publish_step(&self, ctx: &AgentContext, tool: Option<&str>, status: StepStatus) {
        self.bus
            .publish(Event::StepFinished {
                task_id: ctx.task_id,
                iteration: ctx.iteration,
                step_code: step_code(ctx.iteration),
                tool: tool.map(String::from),
                status,
            })
            .await;
    }
}

fn step_code(iteration: i64) -> String {
    format!("LOOP_{}", iteration)
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
