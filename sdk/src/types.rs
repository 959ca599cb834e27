//! Tool argument, status and task view types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Named configuration profile selecting the iteration budget and the
/// preferred tool chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    #[default]
    Standard,
    FastDraft,
}

impl RunMode {
    /// Parse a client supplied mode. Blank or unrecognised values fall back to
    /// `Standard`.
    pub fn from_nullable(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()) {
            Some(s) if s == "FAST_DRAFT" => RunMode::FastDraft,
            _ => RunMode::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Standard => "STANDARD",
            RunMode::FastDraft => "FAST_DRAFT",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(TaskStatus::Running),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Step status. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(StepStatus::Running),
            "SUCCESS" => Some(StepStatus::Success),
            "FAILED" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of step recorded for an iteration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// A tool invocation (or its idempotent skip)
    ToolCall,
    /// The planner ended the loop
    Finish,
    /// The planner produced an action that could not be executed
    Decision,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::ToolCall => "tool_call",
            StepType::Finish => "finish",
            StepType::Decision => "decision",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tool_call" => Some(StepType::ToolCall),
            "finish" => Some(StepType::Finish),
            "decision" => Some(StepType::Decision),
            _ => None,
        }
    }
}

/// Arguments handed to a tool handler. Wraps the JSON object the planner
/// produced; keys serialise in sorted order so equal maps give equal text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ToolArgs {
    pub params: Map<String, Value>,
}

impl ToolArgs {
    /// Create an empty argument map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an arbitrary JSON value. Non-objects yield an empty map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(params) => Self { params },
            _ => Self::default(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Get a string parameter
    pub fn param_str(&self, key: &str) -> Result<String, ToolError> {
        self.param_str_opt(key)
            .ok_or_else(|| ToolError::MissingParameter(key.to_string()))
    }

    /// Get an optional string parameter
    pub fn param_str_opt(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// Get an optional integer parameter. Numeric strings are accepted.
    pub fn param_i64_opt(&self, key: &str) -> Option<i64> {
        match self.params.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get an integer parameter
    pub fn param_i64(&self, key: &str) -> Result<i64, ToolError> {
        match self.params.get(key) {
            None => Err(ToolError::MissingParameter(key.to_string())),
            Some(_) => self
                .param_i64_opt(key)
                .ok_or_else(|| ToolError::InvalidParameter(key.to_string())),
        }
    }

    /// Serialise to the JSON text stored alongside a step
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Tool argument errors
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Task creation request accepted at the service boundary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskCreateRequest {
    pub document_id: Option<i64>,
    #[serde(default)]
    pub section_id: Option<i64>,
    #[serde(default)]
    pub knowledge_base_id: Option<i64>,
    #[serde(default)]
    pub run_mode: Option<String>,
    #[serde(default)]
    pub requirement: Option<String>,
    #[serde(default)]
    pub project_params: Option<String>,
    #[serde(default)]
    pub created_by: Option<i64>,
}

/// Task detail view. `response` carries the serialised progress payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskResponse {
    pub id: String,
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub run_mode: RunMode,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub response: String,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Lightweight list-by-document row for progress polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskListItem {
    pub id: String,
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
