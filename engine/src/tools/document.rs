//! Document-operations tools
//!
//! The six catalog tools share one backend implementing `DocumentOps`. Each
//! operation returns a count; the handler turns it into the observation text
//! the planner reads back. Intermediate artifacts (hits, outline, draft,
//! section cursor) live in the task's `DraftMemory` so a run never shares
//! scratch state with another run.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ToolArgs;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ToolHandler, ToolName};
use crate::agent::AgentContext;

/// A retrieved knowledge passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub chunk_id: i64,
    pub source: String,
    pub content: String,
    pub score: f64,
}

/// One node of a generated outline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub title: String,
    #[serde(default)]
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    pub fn leaf(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including the root
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(OutlineNode::count).sum::<usize>()
    }
}

/// One section of a whole-document draft
#[derive(Debug, Clone, PartialEq)]
pub struct DraftSection {
    pub title: String,
    pub content: String,
    pub used_chunk_ids: Vec<i64>,
}

/// Per-task scratch state written by the document tools
#[derive(Debug, Clone, Default)]
pub struct DraftMemory {
    pub global_hits: Vec<KnowledgeHit>,
    pub last_section_hits: Vec<KnowledgeHit>,
    pub outline: Vec<OutlineNode>,
    pub outline_persisted: bool,
    pub full_draft: Vec<DraftSection>,
    pub written_sections: usize,
    pub section_cursor: usize,
    pub section_total: Option<usize>,
}

impl DraftMemory {
    pub fn progress(&self) -> DraftProgress {
        let section_total = self.section_total.unwrap_or(0);
        DraftProgress {
            has_global_hits: !self.global_hits.is_empty(),
            has_outline: !self.outline.is_empty(),
            outline_persisted: self.outline_persisted,
            has_full_draft: !self.full_draft.is_empty(),
            written_section_count: self.written_sections,
            section_cursor: self.section_cursor,
            section_total,
            has_pending_sections: self.section_cursor < section_total,
        }
    }
}

/// Document progress flags shown to the planner and used by the fallback plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DraftProgress {
    pub has_global_hits: bool,
    pub has_outline: bool,
    pub outline_persisted: bool,
    pub has_full_draft: bool,
    pub written_section_count: usize,
    pub section_cursor: usize,
    pub section_total: usize,
    pub has_pending_sections: bool,
}

/// Document-operations collaborator behind the catalog tools
#[async_trait]
pub trait DocumentOps: Send + Sync {
    /// Returns the number of knowledge hits kept in working memory
    async fn retrieve_knowledge(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;

    /// Returns the number of top-level outline nodes
    async fn generate_outline(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;

    /// Returns the number of sections created
    async fn persist_outline(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;

    /// Returns the number of sections written in this batch
    async fn compose_sections(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;

    /// Returns the number of sections in the draft
    async fn compose_full_draft(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;

    /// Returns the number of sections written from the draft
    async fn split_persist_draft(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError>;
}

/// Binds one catalog tool to the shared `DocumentOps` backend
pub struct DocumentTool {
    tool: ToolName,
    ops: Arc<dyn DocumentOps>,
}

impl DocumentTool {
    pub fn new(tool: ToolName, ops: Arc<dyn DocumentOps>) -> Self {
        Self { tool, ops }
    }
}

#[async_trait]
impl ToolHandler for DocumentTool {
    async fn call(&self, ctx: &mut AgentContext, args: &ToolArgs) -> Result<String, EngineError> {
        let text = match self.tool {
            ToolName::RetrieveKnowledge => {
                let hits = self.ops.retrieve_knowledge(ctx, args).await?;
                format!("knowledge retrieval done, {} hits", hits)
            }
            ToolName::GenerateOutline => {
                let roots = self.ops.generate_outline(ctx, args).await?;
                format!("outline generated, {} top-level sections", roots)
            }
            ToolName::PersistOutline => {
                let created = self.ops.persist_outline(ctx, args).await?;
                format!("outline persisted, {} sections created", created)
            }
            ToolName::ComposeSections => {
                let written = self.ops.compose_sections(ctx, args).await?;
                format!("section batch composed, {} sections written", written)
            }
            ToolName::ComposeFullDraft => {
                let sections = self.ops.compose_full_draft(ctx, args).await?;
                format!("full draft generated, {} sections", sections)
            }
            ToolName::SplitPersistDraft => {
                let persisted = self.ops.split_persist_draft(ctx, args).await?;
                format!("draft split and persisted, {} sections written", persisted)
            }
        };
        Ok(text)
    }
}
