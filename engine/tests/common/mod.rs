//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use quill_engine::agent::{AgentContext, AgentCore, Planner, TaskService};
use quill_engine::config::AgentConfig;
use quill_engine::db::{Database, TaskRepository};
use quill_engine::llm::{LLMError, ModelGateway, Result as LLMResult};
use quill_engine::message_bus::MessageBus;
use quill_engine::tools::{ToolHandler, ToolName, ToolRegistry};
use sdk::errors::EngineError;
use sdk::types::ToolArgs;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Replays planner replies in order, then keeps repeating the last one
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl ScriptedGateway {
    pub fn new<S: AsRef<str>>(replies: &[S]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.as_ref().to_string()).collect()),
            last: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn chat(&self, _system: &str, _user: &str) -> LLMResult<String> {
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                Ok(reply)
            }
            None => last
                .clone()
                .ok_or_else(|| LLMError::InvalidRequest("no scripted reply".to_string())),
        }
    }

    async fn embedding(&self, text: &str) -> LLMResult<Vec<f64>> {
        Ok(vec![text.len() as f64, 1.0])
    }
}

/// Succeeds with a fixed text and counts its calls
pub struct Succeeding {
    pub text: String,
    pub calls: AtomicU32,
}

impl Succeeding {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ToolHandler for Succeeding {
    async fn call(&self, _ctx: &mut AgentContext, _args: &ToolArgs) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

/// Fails the first `failures` calls, then succeeds
pub struct Flaky {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl Flaky {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ToolHandler for Flaky {
    async fn call(&self, _ctx: &mut AgentContext, _args: &ToolArgs) -> Result<String, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(EngineError::ToolExecutionFailed(format!(
                "backend unavailable (call {})",
                call
            )))
        } else {
            Ok(format!("succeeded on call {}", call))
        }
    }
}

/// Sleeps longer than any test timeout
pub struct Hanging;

#[async_trait]
impl ToolHandler for Hanging {
    async fn call(&self, _ctx: &mut AgentContext, _args: &ToolArgs) -> Result<String, EngineError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".to_string())
    }
}

/// Signals `started` on entry, then blocks until `release` is notified
pub struct Gated {
    pub started: Notify,
    pub release: Notify,
}

impl Gated {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ToolHandler for Gated {
    async fn call(&self, _ctx: &mut AgentContext, _args: &ToolArgs) -> Result<String, EngineError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok("released".to_string())
    }
}

/// Panics inside the worker
pub struct Panicking;

#[async_trait]
impl ToolHandler for Panicking {
    async fn call(&self, _ctx: &mut AgentContext, _args: &ToolArgs) -> Result<String, EngineError> {
        panic!("handler bug")
    }
}

/// Fast retries and short timeouts for tests
pub fn test_config() -> AgentConfig {
    AgentConfig {
        tool_timeout_ms: 2000,
        min_tool_timeout_ms: 10,
        tool_max_retries: 2,
        tool_retry_backoff_ms: 1,
        max_retry_backoff_ms: 5,
        planner_timeout_ms: 2000,
        ..AgentConfig::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub repo: Arc<TaskRepository>,
    pub bus: Arc<MessageBus>,
    pub core: Arc<AgentCore>,
    pub service: TaskService,
}

impl Harness {
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("quill.db")
    }
}

pub async fn harness(
    gateway: Arc<dyn ModelGateway>,
    tools: Vec<(ToolName, Arc<dyn ToolHandler>)>,
    config: AgentConfig,
) -> Harness {
    harness_in(TempDir::new().unwrap(), gateway, tools, config).await
}

/// Build the service over `quill.db` inside an existing directory
pub async fn harness_in(
    dir: TempDir,
    gateway: Arc<dyn ModelGateway>,
    tools: Vec<(ToolName, Arc<dyn ToolHandler>)>,
    config: AgentConfig,
) -> Harness {
    let db = Database::new(&dir.path().join("quill.db")).await.unwrap();
    let repo = Arc::new(db.tasks());
    let bus = Arc::new(MessageBus::new());

    let mut registry = ToolRegistry::empty();
    for (name, handler) in tools {
        registry.register(name, handler);
    }

    let core = Arc::new(AgentCore::new(
        Planner::new(gateway, &config),
        Arc::new(registry),
        Arc::clone(&repo),
        Arc::clone(&bus),
        config.clone(),
    ));
    let service = TaskService::new(Arc::clone(&repo), Arc::clone(&core), Arc::clone(&bus), config);

    Harness {
        dir,
        repo,
        bus,
        core,
        service,
    }
}

pub fn tool(name: &str) -> String {
    format!(
        r#"{{"action":"TOOL","tool":"{}","args":{{}},"reason":"next in chain"}}"#,
        name
    )
}

pub fn finish(summary: &str) -> String {
    format!(
        r#"{{"action":"FINISH","finalSummary":"{}","reason":"done"}}"#,
        summary
    )
}
