//! Tool registry and dispatch
//!
//! The tool catalog is closed: `ToolName` enumerates every tool the planner
//! may pick. Handlers are bound to names in a registration table built at
//! startup, and names that are not registered are rejected at the dispatch
//! boundary.

pub mod document;
pub mod memory;

pub use document::{DocumentOps, DocumentTool, DraftProgress};
pub use memory::MemoryDocumentOps;

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ToolArgs;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::AgentContext;

/// Tools the planner may invoke
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ToolName {
    RetrieveKnowledge,
    GenerateOutline,
    PersistOutline,
    ComposeSections,
    ComposeFullDraft,
    SplitPersistDraft,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::RetrieveKnowledge,
        ToolName::GenerateOutline,
        ToolName::PersistOutline,
        ToolName::ComposeSections,
        ToolName::ComposeFullDraft,
        ToolName::SplitPersistDraft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::RetrieveKnowledge => "retrieve_knowledge",
            ToolName::GenerateOutline => "generate_outline",
            ToolName::PersistOutline => "persist_outline",
            ToolName::ComposeSections => "compose_sections",
            ToolName::ComposeFullDraft => "compose_full_draft",
            ToolName::SplitPersistDraft => "split_persist_draft",
        }
    }

    /// Trim, lowercase and replace spaces with underscores
    pub fn normalize(raw: &str) -> String {
        raw.trim().to_lowercase().replace(' ', "_")
    }

    /// Resolve a planner supplied name
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = Self::normalize(raw);
        Self::ALL.into_iter().find(|t| t.as_str() == normalized)
    }

    /// Cursor driven tools are legitimately repeated with equal arguments and
    /// never carry an idempotency key.
    pub fn supports_idempotency(&self) -> bool {
        !matches!(self, ToolName::ComposeSections)
    }

    /// One-line description shown to the planner
    pub fn description(&self) -> &'static str {
        match self {
            ToolName::RetrieveKnowledge => {
                "Search the knowledge base for passages relevant to the task and keep them in working memory. Args: query?, topK?, minScore?"
            }
            ToolName::GenerateOutline => {
                "Generate a section outline from the requirement and retrieved knowledge"
            }
            ToolName::PersistOutline => "Save the generated outline as the document's section tree",
            ToolName::ComposeSections => {
                "Write section bodies one batch at a time, advancing a cursor. Args: batchSize? (1-5)"
            }
            ToolName::ComposeFullDraft => {
                "Write a whole-document draft split into sections, kept in memory only"
            }
            ToolName::SplitPersistDraft => {
                "Split the full draft by section and write it into the document"
            }
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bound tool implementation
///
/// Returns the human readable text that follows `TOOL[name]` in the
/// observation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &mut AgentContext, args: &ToolArgs) -> Result<String, EngineError>;
}

/// Registry of tools that can be dispatched by the agent loop.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Create an empty registry with no tools bound.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bind all six document tools to one document-operations backend
    pub fn with_document_ops(ops: Arc<dyn DocumentOps>) -> Self {
        let mut registry = Self::empty();
        for tool in ToolName::ALL {
            registry.register(tool, Arc::new(DocumentTool::new(tool, Arc::clone(&ops))));
        }
        registry
    }

    /// Bind a handler, replacing any previous binding for that name
    pub fn register(&mut self, tool: ToolName, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(tool, handler);
    }

    pub fn is_registered(&self, tool: ToolName) -> bool {
        self.handlers.contains_key(&tool)
    }

    /// Registered tools in catalog order
    pub fn registered(&self) -> Vec<ToolName> {
        ToolName::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Dispatch a call.
    ///
    /// Fails with `UnknownTool` when nothing is bound to the name and with
    /// `ToolExecutionFailed` when the handler fails.
    pub async fn invoke(
        &self,
        tool: ToolName,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<String, EngineError> {
        let Some(handler) = self.handlers.get(&tool) else {
            warn!("Unknown tool requested: {}", tool);
            return Err(EngineError::UnknownTool(tool.as_str().to_string()));
        };

        debug!(task_id = ctx.task_id, "Dispatching tool '{}'", tool);

        handler.call(ctx, args).await.map_err(|e| match e {
            EngineError::ToolExecutionFailed(_) => e,
            other => EngineError::ToolExecutionFailed(other.to_string()),
        })
    }

    /// Catalog lines for the planner prompt, one `- name: description` per tool
    pub fn describe(&self) -> String {
        self.registered()
            .iter()
            .map(|t| format!("- {}: {}", t.as_str(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool names joined by `|` for the decision schema
    pub fn names(&self) -> String {
        self.registered()
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}
