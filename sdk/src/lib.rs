//! Quill SDK
//!
//! Shared library providing the error taxonomy, tool argument helpers and the
//! request/response shapes exchanged with the agent task engine.

/// Error types and handling
pub mod errors;

/// Tool argument, status and task view types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, EngineErrorExt};
pub use types::{
    AgentTaskCreateRequest, AgentTaskListItem, AgentTaskResponse, RunMode, StepStatus, StepType,
    TaskStatus, ToolArgs, ToolError,
};
