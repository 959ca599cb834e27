//! Error types and handling
//!
//! This module provides the error types used throughout the Quill engine.
//! All errors implement the `EngineErrorExt` trait which provides user-friendly
//! hints and indicates whether an operation that raised them may be retried.

use thiserror::Error;

/// Trait for engine error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors may be retried by the agent loop. Non-recoverable
    /// errors end the task immediately.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Store**: SQLite failures and illegal state transitions
/// - **Planning**: The model produced no usable action
/// - **Tool**: Dispatch, execution and timeout failures
/// - **Budget**: The iteration limit was reached without a finish signal
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EngineErrorExt};
///
/// let error = EngineError::ToolExecutionFailed("connection reset".to_string());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::UnknownTool("delete_everything".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Lookup errors
    #[error("Agent task not found: {0}")]
    TaskNotFound(i64),

    #[error("Agent step not found: {0}")]
    StepNotFound(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // State machine violations
    #[error("Agent task {0} is already terminal")]
    TaskAlreadyTerminal(i64),

    #[error("Agent step {0} is already finished")]
    StepAlreadyFinished(i64),

    #[error("Iteration {requested} out of range for task {task_id} (current {current}, max {max})")]
    IterationOutOfRange {
        task_id: i64,
        requested: i64,
        current: i64,
        max: i64,
    },

    // Planning errors
    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Iteration budget exhausted after {max} iterations without finish")]
    IterationBudgetExhausted { max: i64 },

    #[error("LLM call timed out")]
    LLMTimeout,

    #[error("Model gateway error: {0}")]
    Gateway(String),

    // Tool errors
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("tool timeout: {timeout_ms}ms")]
    ToolTimeout { timeout_ms: u64 },

    #[error("Tool {tool} failed after {attempts} attempt(s): {error}")]
    ToolRetriesExhausted {
        tool: String,
        attempts: u32,
        error: String,
    },

    // Worker errors
    #[error("Agent worker aborted: {0}")]
    WorkerAborted(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Task store operation failed. Check the data directory",

            Self::TaskNotFound(_) => "No agent task exists with that id",
            Self::StepNotFound(_) => "No agent step exists with that id",
            Self::InvalidArgument(_) => "Check the request fields and try again",

            Self::TaskAlreadyTerminal(_) => "The task has already finished",
            Self::StepAlreadyFinished(_) => "The step has already finished",
            Self::IterationOutOfRange { .. } => "Internal iteration bookkeeping error",

            Self::PlanningFailed(_) => "The model did not propose a usable action",
            Self::IterationBudgetExhausted { .. } => {
                "Task did not converge. Try a narrower requirement or the STANDARD mode"
            }
            Self::LLMTimeout => "Model took too long to respond. Try again",
            Self::Gateway(_) => "Model backend unavailable. Check base_url and API key",

            Self::UnknownTool(_) => "The requested tool is not available",
            Self::ToolExecutionFailed(_) => "Tool operation failed",
            Self::ToolTimeout { .. } => "Tool took too long. Raise tool_timeout_ms if expected",
            Self::ToolRetriesExhausted { .. } => "Tool kept failing after all retries",

            Self::WorkerAborted(_) => "The background worker stopped unexpectedly",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Retrying will not change the outcome
            Self::Config(_)
            | Self::TaskNotFound(_)
            | Self::StepNotFound(_)
            | Self::InvalidArgument(_)
            | Self::TaskAlreadyTerminal(_)
            | Self::StepAlreadyFinished(_)
            | Self::IterationOutOfRange { .. }
            | Self::PlanningFailed(_)
            | Self::IterationBudgetExhausted { .. }
            | Self::UnknownTool(_)
            | Self::ToolRetriesExhausted { .. }
            | Self::WorkerAborted(_) => false,

            Self::Database(_)
            | Self::LLMTimeout
            | Self::Gateway(_)
            | Self::ToolExecutionFailed(_)
            | Self::ToolTimeout { .. }
            | Self::Io(_) => true,
        }
    }
}
