//! Planner
//!
//! Turns the Agent Context into the next action by asking the Model Gateway
//! for a JSON decision. Replies that cannot be parsed either fail the run or,
//! when `fallback_on_unparseable_plan` is set, are replaced by the next step
//! of the run mode's recommended tool chain.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sdk::errors::EngineError;
use sdk::types::{RunMode, ToolArgs};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::AgentContext;
use crate::config::AgentConfig;
use crate::llm::{extract_json_object, ModelGateway};
use crate::tools::{DraftProgress, ToolName, ToolRegistry};

/// Summary recorded when the model finishes without one
pub const DEFAULT_FINISH_SUMMARY: &str = "Task completed";

/// Upper bound for a per-call `maxRetries` override
pub const MAX_TOOL_RETRIES: i64 = 5;

/// Next action chosen by the planner
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Invoke a tool. The name is kept raw so the loop can report names that
    /// are not in the catalog.
    Tool {
        tool: String,
        args: ToolArgs,
        reason: String,
    },
    /// End the run with a summary
    Finish { summary: String, reason: String },
}

pub struct Planner {
    gateway: Arc<dyn ModelGateway>,
    timeout: Duration,
    prompt_observations: usize,
    fallback_on_unparseable: bool,
}

impl Planner {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: &AgentConfig) -> Self {
        Self {
            gateway,
            timeout: Duration::from_millis(config.planner_timeout_ms),
            prompt_observations: config.prompt_observations,
            fallback_on_unparseable: config.fallback_on_unparseable_plan,
        }
    }

    /// Ask the model for the next action.
    ///
    /// Gateway failures and timeouts propagate unchanged. An unusable reply is
    /// a `PlanningFailed` error unless the fallback plan is enabled.
    pub async fn decide(
        &self,
        ctx: &AgentContext,
        tools: &ToolRegistry,
    ) -> Result<Decision, EngineError> {
        let system_prompt = system_prompt(tools);
        let user_prompt = user_prompt(ctx, self.prompt_observations);

        let raw = match timeout(self.timeout, self.gateway.chat(&system_prompt, &user_prompt)).await
        {
            Ok(reply) => reply?,
            Err(_) => return Err(EngineError::LLMTimeout),
        };

        if let Some(decision) = parse_decision(&raw) {
            debug!(task_id = ctx.task_id, iteration = ctx.iteration, "Planner decision: {:?}", decision);
            return Ok(decision);
        }

        if self.fallback_on_unparseable {
            let decision = fallback_decision(ctx.run_mode, &ctx.progress());
            warn!(
                task_id = ctx.task_id,
                iteration = ctx.iteration,
                "Planner reply unusable, following fallback plan"
            );
            return Ok(decision);
        }

        Err(EngineError::PlanningFailed(format!(
            "unusable planner reply: {}",
            clip(&raw, 200)
        )))
    }
}

pub fn system_prompt(tools: &ToolRegistry) -> String {
    format!(
        r#"You are the planning brain of a document-writing agent. Follow ReAct:
- Work out what is still missing, then pick the single most useful tool;
- Run at most one tool per turn;
- Reply FINISH once the goal is met.

Reply with JSON only:
{{
  "action":"TOOL|FINISH",
  "tool":"{names}",
  "args":{{}},
  "reason":"short reason",
  "finalSummary":"only for FINISH"
}}

Available tools:
{catalog}

Constraints:
1) STANDARD mode chain: retrieve_knowledge -> generate_outline -> persist_outline -> compose_sections (repeat until no pending sections) -> FINISH
2) FAST_DRAFT mode chain: retrieve_knowledge -> compose_full_draft -> split_persist_draft -> FINISH
3) Do not repeat completed steps that need no retry."#,
        names = tools.names(),
        catalog = tools.describe(),
    )
}

pub fn user_prompt(ctx: &AgentContext, max_observations: usize) -> String {
    let progress = ctx.progress();
    let latest = ctx.observations.latest(max_observations);
    let observations = if latest.is_empty() {
        "- (none yet)".to_string()
    } else {
        latest
            .iter()
            .map(|o| format!("- {}", o))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Task:\n\
         - runMode: {}\n\
         - documentId: {}\n\
         - sectionId: {}\n\
         - requirement: {}\n\
         - projectParams: {}\n\
         \n\
         State:\n\
         - iteration: {}/{}\n\
         - hasOutline: {}\n\
         - hasGlobalHits: {}\n\
         - outlinePersisted: {}\n\
         - hasFullDraft: {}\n\
         - writtenSectionCount: {}\n\
         - sectionProgress: {}/{}\n\
         - hasPendingSections: {}\n\
         \n\
         Latest observations (newest first, at most {}):\n\
         {}",
        ctx.run_mode,
        ctx.document_id,
        ctx.section_id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string()),
        ctx.requirement.as_deref().unwrap_or(""),
        ctx.project_params.as_deref().unwrap_or(""),
        ctx.iteration,
        ctx.max_iterations,
        progress.has_outline,
        progress.has_global_hits,
        progress.outline_persisted,
        progress.has_full_draft,
        progress.written_section_count,
        progress.section_cursor,
        progress.section_total,
        progress.has_pending_sections,
        max_observations,
        observations,
    )
}

/// Parse a planner reply. Returns `None` when the reply holds no usable
/// action.
pub fn parse_decision(raw: &str) -> Option<Decision> {
    let json = extract_json_object(raw)?;
    let root: Value = serde_json::from_str(json).ok()?;

    let text = |key: &str| {
        root.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let action = text("action").to_uppercase();
    let tool = text("tool");
    let reason = text("reason");

    let finishing = action == "FINISH" || ToolName::normalize(&tool) == "finish";
    if finishing {
        let summary = text("finalSummary");
        let summary = if summary.is_empty() {
            DEFAULT_FINISH_SUMMARY.to_string()
        } else {
            summary
        };
        return Some(Decision::Finish { summary, reason });
    }

    if action != "TOOL" || tool.is_empty() {
        return None;
    }

    let args = root
        .get("args")
        .cloned()
        .map(ToolArgs::from_value)
        .unwrap_or_default();

    Some(Decision::Tool { tool, args, reason })
}

/// Next step of the run mode's recommended chain, derived from progress
pub fn fallback_decision(mode: RunMode, progress: &DraftProgress) -> Decision {
    let tool = |tool: ToolName, args: ToolArgs, reason: &str| Decision::Tool {
        tool: tool.as_str().to_string(),
        args,
        reason: reason.to_string(),
    };

    match mode {
        RunMode::FastDraft => {
            if !progress.has_global_hits {
                tool(ToolName::RetrieveKnowledge, ToolArgs::new(), "fallback: retrieve first")
            } else if !progress.has_full_draft {
                tool(ToolName::ComposeFullDraft, ToolArgs::new(), "fallback: compose full draft")
            } else if progress.written_section_count == 0 {
                tool(ToolName::SplitPersistDraft, ToolArgs::new(), "fallback: persist draft")
            } else {
                Decision::Finish {
                    summary: "Task completed: sections written in FAST_DRAFT mode".to_string(),
                    reason: "fallback finish".to_string(),
                }
            }
        }
        RunMode::Standard => {
            if !progress.has_global_hits {
                tool(ToolName::RetrieveKnowledge, ToolArgs::new(), "fallback: retrieve for outline")
            } else if !progress.has_outline {
                tool(ToolName::GenerateOutline, ToolArgs::new(), "fallback: generate outline")
            } else if !progress.outline_persisted {
                tool(ToolName::PersistOutline, ToolArgs::new(), "fallback: persist outline")
            } else if progress.written_section_count == 0 {
                tool(ToolName::ComposeSections, compose_args(progress), "fallback: compose sections")
            } else if progress.has_pending_sections {
                tool(
                    ToolName::ComposeSections,
                    compose_args(progress),
                    "fallback: continue compose sections",
                )
            } else {
                Decision::Finish {
                    summary: "Task completed: sections written in STANDARD mode".to_string(),
                    reason: "fallback finish".to_string(),
                }
            }
        }
    }
}

fn compose_args(progress: &DraftProgress) -> ToolArgs {
    ToolArgs::new()
        .with_param("batchSize", json!(2))
        .with_param("timeoutMs", json!(180000))
        .with_param("maxRetries", json!(0))
        .with_param("cursor", json!(progress.section_cursor))
}

/// Stable key for one logical action of a task
pub fn idempotency_key(task_id: i64, tool: &str, args_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", task_id, tool, args_json).as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-call timeout: `timeoutMs` arg or the configured default, floored at
/// the configured minimum
pub fn resolve_timeout_ms(args: &ToolArgs, config: &AgentConfig) -> u64 {
    args.param_i64_opt("timeoutMs")
        .filter(|ms| *ms > 0)
        .map(|ms| ms as u64)
        .unwrap_or(config.tool_timeout_ms)
        .max(config.min_tool_timeout_ms)
}

/// Per-call retry budget: `maxRetries` arg or the configured default, clamped
/// to `0..=MAX_TOOL_RETRIES`
pub fn resolve_max_retries(args: &ToolArgs, config: &AgentConfig) -> u32 {
    args.param_i64_opt("maxRetries")
        .unwrap_or(i64::from(config.tool_max_retries))
        .clamp(0, MAX_TOOL_RETRIES) as u32
}

/// Delay before retrying after failed attempt `attempt` (0-based)
pub fn backoff_ms(config: &AgentConfig, attempt: u32) -> u64 {
    config
        .tool_retry_backoff_ms
        .saturating_mul(u64::from(attempt) + 1)
        .min(config.max_retry_backoff_ms)
}

fn clip(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LLMError, Result as LLMResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<LLMResult<String>>>);

    #[async_trait]
    impl ModelGateway for Scripted {
        async fn chat(&self, _system: &str, _user: &str) -> LLMResult<String> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LLMError::InvalidRequest("exhausted".to_string())))
        }

        async fn embedding(&self, _text: &str) -> LLMResult<Vec<f64>> {
            Ok(vec![0.0])
        }
    }

    fn planner(reply: LLMResult<String>, fallback: bool) -> Planner {
        let config = AgentConfig {
            fallback_on_unparseable_plan: fallback,
            ..AgentConfig::default()
        };
        Planner::new(Arc::new(Scripted(Mutex::new(vec![reply]))), &config)
    }

    fn ctx() -> AgentContext {
        AgentContext::new(1, 10, RunMode::Standard, 14, 30)
    }

    #[test]
    fn test_parse_tool_decision() {
        let raw = r#"{"action":"tool","tool":"Generate Outline","args":{"x":1},"reason":"need structure"}"#;
        match parse_decision(raw).unwrap() {
            Decision::Tool { tool, args, reason } => {
                assert_eq!(tool, "Generate Outline");
                assert_eq!(args.param_i64_opt("x"), Some(1));
                assert_eq!(reason, "need structure");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_finish_with_blank_summary() {
        let raw = "```json\n{\"action\":\"FINISH\",\"finalSummary\":\"  \"}\n```";
        assert_eq!(
            parse_decision(raw),
            Some(Decision::Finish {
                summary: DEFAULT_FINISH_SUMMARY.to_string(),
                reason: String::new(),
            })
        );
    }

    #[test]
    fn test_parse_finish_tool_name() {
        let raw = r#"{"action":"TOOL","tool":"finish","finalSummary":"done"}"#;
        assert!(matches!(
            parse_decision(raw),
            Some(Decision::Finish { summary, .. }) if summary == "done"
        ));
    }

    #[test]
    fn test_parse_rejects_unusable_replies() {
        assert_eq!(parse_decision("I think we should outline"), None);
        assert_eq!(parse_decision(r#"{"action":"WAIT","tool":"x"}"#), None);
        assert_eq!(parse_decision(r#"{"action":"TOOL","tool":"  "}"#), None);
    }

    #[test]
    fn test_fallback_standard_chain() {
        let mut progress = DraftProgress::default();
        let next = |p: &DraftProgress| match fallback_decision(RunMode::Standard, p) {
            Decision::Tool { tool, .. } => tool,
            Decision::Finish { .. } => "finish".to_string(),
        };

        assert_eq!(next(&progress), "retrieve_knowledge");
        progress.has_global_hits = true;
        assert_eq!(next(&progress), "generate_outline");
        progress.has_outline = true;
        assert_eq!(next(&progress), "persist_outline");
        progress.outline_persisted = true;
        assert_eq!(next(&progress), "compose_sections");
        progress.written_section_count = 2;
        progress.has_pending_sections = true;
        assert_eq!(next(&progress), "compose_sections");
        progress.has_pending_sections = false;
        assert_eq!(next(&progress), "finish");
    }

    #[test]
    fn test_fallback_fast_draft_chain() {
        let progress = DraftProgress {
            has_global_hits: true,
            ..DraftProgress::default()
        };
        assert!(matches!(
            fallback_decision(RunMode::FastDraft, &progress),
            Decision::Tool { tool, .. } if tool == "compose_full_draft"
        ));
    }

    #[test]
    fn test_compose_args_carry_cursor() {
        let progress = DraftProgress {
            has_global_hits: true,
            has_outline: true,
            outline_persisted: true,
            section_cursor: 4,
            ..DraftProgress::default()
        };
        match fallback_decision(RunMode::Standard, &progress) {
            Decision::Tool { args, .. } => {
                assert_eq!(args.param_i64_opt("cursor"), Some(4));
                assert_eq!(args.param_i64_opt("maxRetries"), Some(0));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_hex() {
        let a = idempotency_key(1, "generate_outline", "{}");
        assert_eq!(a, idempotency_key(1, "generate_outline", "{}"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, idempotency_key(2, "generate_outline", "{}"));
        assert_ne!(a, idempotency_key(1, "generate_outline", r#"{"x":1}"#));
    }

    #[test]
    fn test_resolve_overrides() {
        let config = AgentConfig::default();

        assert_eq!(resolve_timeout_ms(&ToolArgs::new(), &config), config.tool_timeout_ms);
        let short = ToolArgs::new().with_param("timeoutMs", json!(10));
        assert_eq!(resolve_timeout_ms(&short, &config), config.min_tool_timeout_ms);

        assert_eq!(resolve_max_retries(&ToolArgs::new(), &config), config.tool_max_retries);
        let many = ToolArgs::new().with_param("maxRetries", json!(99));
        assert_eq!(resolve_max_retries(&many, &config), 5);
        let negative = ToolArgs::new().with_param("maxRetries", json!(-3));
        assert_eq!(resolve_max_retries(&negative, &config), 0);
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let config = AgentConfig::default();
        assert_eq!(backoff_ms(&config, 0), 800);
        assert_eq!(backoff_ms(&config, 1), 1600);
        assert_eq!(backoff_ms(&config, 10), 5000);
    }

    #[test]
    fn test_user_prompt_lists_newest_observations_first() {
        let mut ctx = ctx();
        ctx.iteration = 3;
        ctx.observe("first");
        ctx.observe("second");
        let prompt = user_prompt(&ctx, 6);
        assert!(prompt.contains("- iteration: 3/14"));
        let second = prompt.find("- second").unwrap();
        let first = prompt.find("- first").unwrap();
        assert!(second < first);
    }

    #[tokio::test]
    async fn test_decide_unusable_reply_fails_without_fallback() {
        let planner = planner(Ok("no json here".to_string()), false);
        let err = planner.decide(&ctx(), &ToolRegistry::empty()).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanningFailed(_)));
    }

    #[tokio::test]
    async fn test_decide_unusable_reply_uses_fallback() {
        let planner = planner(Ok("no json here".to_string()), true);
        let decision = planner.decide(&ctx(), &ToolRegistry::empty()).await.unwrap();
        assert!(matches!(decision, Decision::Tool { tool, .. } if tool == "retrieve_knowledge"));
    }

    #[tokio::test]
    async fn test_decide_gateway_error_propagates() {
        let planner = planner(Err(LLMError::RateLimitExceeded), true);
        let err = planner.decide(&ctx(), &ToolRegistry::empty()).await.unwrap_err();
        assert!(matches!(err, EngineError::Gateway(_)));
    }
}
