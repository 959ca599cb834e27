//! Process-local document backend
//!
//! `MemoryDocumentOps` keeps each document's section tree in memory and uses
//! the Model Gateway for everything that needs a model: embedding-based
//! retrieval over a directory of knowledge files and chat-generated outline,
//! section and draft text. Composed sections render to markdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::ToolArgs;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::document::{DocumentOps, DraftSection, KnowledgeHit, OutlineNode};
use crate::agent::AgentContext;
use crate::config::KnowledgeConfig;
use crate::llm::{extract_json_object, ModelGateway};

const DEFAULT_MIN_SCORE: f64 = 0.05;
const SECTION_TOP_K: usize = 6;
const SECTION_MIN_SCORE: f64 = 0.08;
const MAX_PASSAGE_CHARS: usize = 900;

const OUTLINE_SYSTEM_PROMPT: &str = r#"You are a document architect. Produce a document outline.
Return JSON only:
{"outline":[{"title":"Chapter","children":[{"title":"Subsection"}]}]}
Rules:
1) Concise, professional titles;
2) 3 to 8 top-level chapters;
3) Omit empty children arrays."#;

const SECTION_SYSTEM_PROMPT: &str = r#"You are an enterprise document writer.
Return JSON only:
{"content":"markdown body","usedChunkIds":[1,2]}
Rules:
1) Write only about the current section, never about neighbouring sections;
2) Prefer facts, terms and numbers from the knowledge passages and never invent them;
3) If the passages are thin, add the minimum needed and say it is based on available passages;
4) Do not repeat the section title and do not use code fences;
5) usedChunkIds must come from the supplied passages;
6) Do not leave [chunk#123] markers in the body."#;

const DRAFT_SYSTEM_PROMPT: &str = r#"You are a document writer. Produce a complete first draft.
Return JSON only:
{"sections":[{"title":"Section title","content":"markdown body","usedChunkIds":[1,2]}]}
Rules:
1) Markdown bodies, no code fences;
2) usedChunkIds must come from the supplied passages."#;

/// A passage of a knowledge file
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeChunk {
    pub id: i64,
    pub source: String,
    pub text: String,
}

/// A section of an in-memory document
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub title: String,
    pub level: usize,
    pub sort_index: usize,
    pub content: Option<String>,
    pub chunk_refs: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct OutlineReply {
    #[serde(default)]
    outline: Vec<OutlineNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectionReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    html: String,
    #[serde(default)]
    used_chunk_ids: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DraftReply {
    #[serde(default)]
    sections: Vec<DraftReplySection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftReplySection {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    used_chunk_ids: Vec<serde_json::Value>,
}

pub struct MemoryDocumentOps {
    gateway: Arc<dyn ModelGateway>,
    chunks: Vec<KnowledgeChunk>,
    embeddings: OnceCell<Vec<Vec<f64>>>,
    documents: RwLock<HashMap<i64, Vec<Section>>>,
    next_section_id: AtomicI64,
    default_top_k: usize,
    chunk_marker: Regex,
}

impl MemoryDocumentOps {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        chunks: Vec<KnowledgeChunk>,
        default_top_k: usize,
    ) -> Result<Self> {
        Ok(Self {
            gateway,
            chunks,
            embeddings: OnceCell::new(),
            documents: RwLock::new(HashMap::new()),
            next_section_id: AtomicI64::new(1),
            default_top_k: default_top_k.max(1),
            chunk_marker: Regex::new(r"\s*\[chunk#\d+\]")?,
        })
    }

    /// Build from config, loading every .md/.txt file under `knowledge.dir`
    pub fn from_config(gateway: Arc<dyn ModelGateway>, config: &KnowledgeConfig) -> Result<Self> {
        let chunks = match &config.dir {
            Some(dir) => load_knowledge_dir(dir, config.chunk_chars)?,
            None => Vec::new(),
        };
        info!("Loaded {} knowledge chunks", chunks.len());
        Self::new(gateway, chunks, config.top_k)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Sections of a document in tree order
    pub async fn sections(&self, document_id: i64) -> Vec<Section> {
        let documents = self.documents.read().await;
        documents
            .get(&document_id)
            .map(|s| order_sections(s))
            .unwrap_or_default()
    }

    /// Render the written sections of a document as markdown
    pub async fn render_markdown(&self, document_id: i64) -> String {
        let mut out = String::new();
        for section in self.sections(document_id).await {
            let hashes = "#".repeat(section.level.clamp(1, 6));
            out.push_str(&format!("{} {}\n\n", hashes, section.title));
            if let Some(content) = section.content.as_deref().filter(|c| !c.trim().is_empty()) {
                out.push_str(content.trim());
                out.push_str("\n\n");
            }
        }
        out.trim_end().to_string()
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<KnowledgeHit>, EngineError> {
        if self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self
            .embeddings
            .get_or_try_init(|| async {
                let mut vectors = Vec::with_capacity(self.chunks.len());
                for chunk in &self.chunks {
                    vectors.push(self.gateway.embedding(&chunk.text).await?);
                }
                debug!("Embedded {} knowledge chunks", vectors.len());
                Ok::<_, EngineError>(vectors)
            })
            .await?;

        let query_vector = self.gateway.embedding(query).await?;

        let mut hits: Vec<KnowledgeHit> = self
            .chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, vector)| KnowledgeHit {
                chunk_id: chunk.id,
                source: chunk.source.clone(),
                content: chunk.text.clone(),
                score: cosine_similarity(&query_vector, vector),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k.max(1));
        Ok(hits)
    }

    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String, EngineError> {
        Ok(self.gateway.chat(system_prompt, user_prompt).await?)
    }

    fn target_sections(&self, ctx: &AgentContext, all: Vec<Section>) -> Vec<Section> {
        match ctx.section_id {
            Some(id) => all.into_iter().filter(|s| s.id == id).collect(),
            None => all,
        }
    }

    async fn write_section(&self, document_id: i64, section_id: i64, content: &str, refs: Vec<i64>) {
        let content = self.chunk_marker.replace_all(content, "").trim().to_string();
        if content.is_empty() {
            return;
        }
        let mut documents = self.documents.write().await;
        if let Some(section) = documents
            .get_mut(&document_id)
            .and_then(|sections| sections.iter_mut().find(|s| s.id == section_id))
        {
            section.content = Some(content);
            section.chunk_refs = refs;
        }
    }

    async fn compose_one(
        &self,
        ctx: &mut AgentContext,
        section: &Section,
        path: &str,
    ) -> Result<(), EngineError> {
        let query = format!(
            "{} {} {}",
            path,
            section.title,
            ctx.requirement.as_deref().unwrap_or("")
        );
        let mut hits = self.search(&query, SECTION_TOP_K, SECTION_MIN_SCORE).await?;
        ctx.draft.last_section_hits = hits.clone();
        if hits.is_empty() {
            hits = ctx.draft.global_hits.iter().take(8).cloned().collect();
        }

        let user_prompt = format!(
            "Section title: {}\nSection path: {}\nRequirement: {}\nProject parameters: {}\nKnowledge passages:\n{}",
            section.title,
            path,
            or_default(ctx.requirement.as_deref(), "Write a professional, submission-ready section"),
            or_default(ctx.project_params.as_deref(), "(none)"),
            or_default(Some(&retrieval_context(&hits, 10)), "(none)"),
        );
        let raw = self.chat(SECTION_SYSTEM_PROMPT, &user_prompt).await?;

        let (content, used) = match extract_json_object(&raw)
            .and_then(|json| serde_json::from_str::<SectionReply>(json).ok())
        {
            Some(reply) => {
                let body = if reply.content.trim().is_empty() {
                    reply.html
                } else {
                    reply.content
                };
                (body, parse_ids(&reply.used_chunk_ids))
            }
            None => (raw.trim().to_string(), Vec::new()),
        };

        let refs = resolve_refs(&used, &hits);
        self.write_section(ctx.document_id, section.id, &content, refs)
            .await;
        info!(
            task_id = ctx.task_id,
            section_id = section.id,
            hits = hits.len(),
            "Section composed: {}",
            section.title
        );
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.next_section_id.fetch_add(1, Ordering::SeqCst)
    }

    fn build_sections(
        &self,
        nodes: &[OutlineNode],
        parent_id: Option<i64>,
        level: usize,
        out: &mut Vec<Section>,
    ) {
        let mut sort_index = 0;
        for node in nodes {
            let title = node.title.trim();
            if title.is_empty() {
                continue;
            }
            let id = self.next_id();
            out.push(Section {
                id,
                parent_id,
                title: title.to_string(),
                level,
                sort_index,
                content: None,
                chunk_refs: Vec::new(),
            });
            sort_index += 1;
            self.build_sections(&node.children, Some(id), level + 1, out);
        }
    }
}

#[async_trait]
impl DocumentOps for MemoryDocumentOps {
    async fn retrieve_knowledge(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        let top_k = args
            .param_i64_opt("topK")
            .map(|k| k.max(1) as usize)
            .unwrap_or(self.default_top_k);
        let min_score = args
            .params
            .get("minScore")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_MIN_SCORE);
        let query = resolve_query(ctx, args);

        let hits = self.search(&query, top_k, min_score).await?;
        ctx.draft.global_hits = hits;
        Ok(ctx.draft.global_hits.len())
    }

    async fn generate_outline(
        &self,
        ctx: &mut AgentContext,
        _args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        let existing = self.sections(ctx.document_id).await;
        if !existing.is_empty() {
            ctx.draft.outline = to_outline_nodes(&existing);
            return Ok(ctx.draft.outline.len());
        }

        let user_prompt = format!(
            "Requirement: {}\nProject parameters: {}\nKnowledge passages:\n{}",
            or_default(ctx.requirement.as_deref(), "Plan the document outline from scratch"),
            or_default(ctx.project_params.as_deref(), "(none)"),
            or_default(Some(&retrieval_context(&ctx.draft.global_hits, 12)), "(none)"),
        );
        let raw = self.chat(OUTLINE_SYSTEM_PROMPT, &user_prompt).await?;

        let mut nodes: Vec<OutlineNode> = extract_json_object(&raw)
            .and_then(|json| serde_json::from_str::<OutlineReply>(json).ok())
            .map(|reply| clean_outline(reply.outline))
            .unwrap_or_default();
        if nodes.is_empty() {
            warn!(task_id = ctx.task_id, "Outline reply unusable, using a single overview section");
            nodes = vec![OutlineNode::leaf("Overview")];
        }

        ctx.draft.outline = nodes;
        Ok(ctx.draft.outline.len())
    }

    async fn persist_outline(
        &self,
        ctx: &mut AgentContext,
        _args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        // Section runs write into an existing tree
        if ctx.section_id.is_some() {
            ctx.draft.outline_persisted = true;
            return Ok(0);
        }

        let mut documents = self.documents.write().await;
        let sections = documents.entry(ctx.document_id).or_default();
        if !sections.is_empty() {
            ctx.draft.outline_persisted = true;
            ctx.draft.section_total = Some(sections.len());
            return Ok(0);
        }
        if ctx.draft.outline.is_empty() {
            return Err(EngineError::ToolExecutionFailed(
                "Outline not found, cannot persist".to_string(),
            ));
        }

        let mut created = Vec::new();
        self.build_sections(&ctx.draft.outline, None, 1, &mut created);
        let count = created.len();
        sections.extend(created);

        ctx.draft.outline_persisted = true;
        ctx.draft.section_total = Some(count);
        Ok(count)
    }

    async fn compose_sections(
        &self,
        ctx: &mut AgentContext,
        args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        let all = self.sections(ctx.document_id).await;
        let paths = section_paths(&all);
        let targets = self.target_sections(ctx, all);
        let total = targets.len();
        let cursor = ctx.draft.section_cursor;
        let batch_size = args.param_i64_opt("batchSize").unwrap_or(2).clamp(1, 5) as usize;
        let end = total.min(cursor + batch_size);

        ctx.draft.section_total = Some(total);
        if cursor >= total {
            return Ok(0);
        }

        let mut success = 0;
        let mut failed = 0;
        for (index, section) in targets.iter().enumerate().take(end).skip(cursor) {
            let path = paths.get(&section.id).cloned().unwrap_or_default();
            match self.compose_one(ctx, section, &path).await {
                Ok(()) => success += 1,
                Err(e) => {
                    failed += 1;
                    warn!(task_id = ctx.task_id, section_id = section.id, "Compose section failed: {}", e);
                    ctx.observe(format!("SECTION[{}] FAILED: {}", section.title, e));
                }
            }
            ctx.draft.section_cursor = index + 1;
        }

        ctx.draft.written_sections += success;
        if success == 0 && failed > 0 {
            return Err(EngineError::ToolExecutionFailed(
                "every section in the batch failed".to_string(),
            ));
        }
        Ok(success)
    }

    async fn compose_full_draft(
        &self,
        ctx: &mut AgentContext,
        _args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        let user_prompt = format!(
            "Requirement: {}\nProject parameters: {}\nKnowledge passages:\n{}",
            or_default(ctx.requirement.as_deref(), "Write a complete first draft"),
            or_default(ctx.project_params.as_deref(), "(none)"),
            or_default(Some(&retrieval_context(&ctx.draft.global_hits, 16)), "(none)"),
        );
        let raw = self.chat(DRAFT_SYSTEM_PROMPT, &user_prompt).await?;

        let sections: Vec<DraftSection> = extract_json_object(&raw)
            .and_then(|json| serde_json::from_str::<DraftReply>(json).ok())
            .map(|reply| {
                reply
                    .sections
                    .into_iter()
                    .filter(|s| !s.title.trim().is_empty() && !s.content.trim().is_empty())
                    .map(|s| DraftSection {
                        title: s.title.trim().to_string(),
                        content: s.content,
                        used_chunk_ids: parse_ids(&s.used_chunk_ids),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ctx.draft.full_draft = sections;
        Ok(ctx.draft.full_draft.len())
    }

    async fn split_persist_draft(
        &self,
        ctx: &mut AgentContext,
        _args: &ToolArgs,
    ) -> Result<usize, EngineError> {
        if ctx.draft.full_draft.is_empty() {
            return Err(EngineError::ToolExecutionFailed(
                "Full draft not found".to_string(),
            ));
        }

        {
            let mut documents = self.documents.write().await;
            let sections = documents.entry(ctx.document_id).or_default();
            if sections.is_empty() && ctx.section_id.is_none() {
                let nodes: Vec<OutlineNode> = ctx
                    .draft
                    .full_draft
                    .iter()
                    .map(|d| OutlineNode::leaf(d.title.clone()))
                    .collect();
                let mut created = Vec::new();
                self.build_sections(&nodes, None, 1, &mut created);
                sections.extend(created);
            }
        }

        let by_title: HashMap<String, i64> = self
            .sections(ctx.document_id)
            .await
            .into_iter()
            .map(|s| (normalize_title(&s.title), s.id))
            .collect();

        let drafts = ctx.draft.full_draft.clone();
        let mut persisted = 0;
        for draft in drafts {
            let Some(&section_id) = by_title.get(&normalize_title(&draft.title)) else {
                continue;
            };
            let refs = resolve_refs(&draft.used_chunk_ids, &ctx.draft.global_hits);
            self.write_section(ctx.document_id, section_id, &draft.content, refs)
                .await;
            persisted += 1;
        }

        ctx.draft.written_sections = persisted;
        ctx.draft.section_total = Some(by_title.len());
        ctx.draft.section_cursor = by_title.len();
        Ok(persisted)
    }
}

/// Read every .md/.txt file under `dir` (sorted by path) into chunks
pub fn load_knowledge_dir(dir: &Path, chunk_chars: usize) -> Result<Vec<KnowledgeChunk>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read knowledge dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("md") | Some("txt")
                )
        })
        .collect();
    files.sort();

    let mut chunks = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read knowledge file {}", path.display()))?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        for piece in chunk_text(&text, chunk_chars) {
            chunks.push(KnowledgeChunk {
                id: chunks.len() as i64 + 1,
                source: source.clone(),
                text: piece,
            });
        }
    }
    Ok(chunks)
}

/// Split text on blank lines, packing paragraphs into pieces of at most
/// `max_chars` characters. Oversized paragraphs are cut on char boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let paragraph_len = paragraph.chars().count();
        if paragraph_len > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = paragraph.chars().collect();
            for window in chars.chunks(max_chars) {
                pieces.push(window.iter().collect());
            }
            continue;
        }

        let joined_len = current.chars().count() + 2 + paragraph_len;
        if !current.is_empty() && joined_len > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn resolve_query(ctx: &AgentContext, args: &ToolArgs) -> String {
    if let Some(query) = args.param_str_opt("query").filter(|q| !q.trim().is_empty()) {
        return query.trim().to_string();
    }
    let joined = format!(
        "document {} {} {}",
        ctx.document_id,
        ctx.requirement.as_deref().unwrap_or(""),
        ctx.project_params.as_deref().unwrap_or("")
    );
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn or_default<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim(),
        _ => fallback,
    }
}

fn retrieval_context(hits: &[KnowledgeHit], limit: usize) -> String {
    hits.iter()
        .take(limit)
        .map(|hit| {
            let normalized = hit.content.split_whitespace().collect::<Vec<_>>().join(" ");
            let clipped: String = normalized.chars().take(MAX_PASSAGE_CHARS).collect();
            format!("- [chunk#{}] {}", hit.chunk_id, clipped)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_ids(values: &[serde_json::Value]) -> Vec<i64> {
    values
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect()
}

/// Map cited chunk ids onto the hits they came from. Falls back to the first
/// eight hits when nothing cited matches.
fn resolve_refs(used: &[i64], hits: &[KnowledgeHit]) -> Vec<i64> {
    let known: Vec<i64> = hits.iter().map(|h| h.chunk_id).collect();
    let mut refs: Vec<i64> = Vec::new();
    for id in used {
        if known.contains(id) && !refs.contains(id) {
            refs.push(*id);
        }
        if refs.len() >= 12 {
            break;
        }
    }
    if refs.is_empty() {
        refs = known.into_iter().take(8).collect();
    }
    refs
}

fn clean_outline(nodes: Vec<OutlineNode>) -> Vec<OutlineNode> {
    nodes
        .into_iter()
        .filter(|n| !n.title.trim().is_empty())
        .map(|n| OutlineNode {
            title: n.title.trim().to_string(),
            children: clean_outline(n.children),
        })
        .collect()
}

fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<String>()
}

fn order_sections(sections: &[Section]) -> Vec<Section> {
    let mut children: HashMap<Option<i64>, Vec<&Section>> = HashMap::new();
    for section in sections {
        children.entry(section.parent_id).or_default().push(section);
    }
    for list in children.values_mut() {
        list.sort_by_key(|s| s.sort_index);
    }

    fn walk(parent: Option<i64>, children: &HashMap<Option<i64>, Vec<&Section>>, out: &mut Vec<Section>) {
        for section in children.get(&parent).into_iter().flatten() {
            out.push((*section).clone());
            walk(Some(section.id), children, out);
        }
    }

    let mut ordered = Vec::with_capacity(sections.len());
    walk(None, &children, &mut ordered);
    ordered
}

fn section_paths(sections: &[Section]) -> HashMap<i64, String> {
    let by_id: HashMap<i64, &Section> = sections.iter().map(|s| (s.id, s)).collect();
    sections
        .iter()
        .map(|section| {
            let mut titles = Vec::new();
            let mut cursor = Some(section);
            // Bounded walk in case of a malformed parent chain
            for _ in 0..32 {
                let Some(current) = cursor else { break };
                titles.push(current.title.as_str());
                cursor = current.parent_id.and_then(|p| by_id.get(&p).copied());
            }
            titles.reverse();
            (section.id, titles.join(" > "))
        })
        .collect()
}

fn to_outline_nodes(ordered: &[Section]) -> Vec<OutlineNode> {
    fn build(parent: Option<i64>, sections: &[Section]) -> Vec<OutlineNode> {
        sections
            .iter()
            .filter(|s| s.parent_id == parent)
            .map(|s| OutlineNode {
                title: s.title.clone(),
                children: build(Some(s.id), sections),
            })
            .collect()
    }
    build(None, ordered)
}
