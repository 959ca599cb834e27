//! End-to-end document runs over the in-memory document backend
//!
//! The planner reply is deliberately unusable so the runs follow the
//! fallback chain of each run mode through the real document tools.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use quill_engine::agent::TaskService;
use quill_engine::config::{AgentConfig, Config};
use quill_engine::db::Database;
use quill_engine::handlers::build_service;
use quill_engine::llm::{ModelGateway, Result as LLMResult};
use quill_engine::tools::memory::load_knowledge_dir;
use quill_engine::tools::{DocumentOps, MemoryDocumentOps};
use sdk::types::{AgentTaskCreateRequest, StepStatus, TaskStatus};

/// Answers by prompt role
struct RoleGateway;

#[async_trait]
impl ModelGateway for RoleGateway {
    async fn chat(&self, system_prompt: &str, _user_prompt: &str) -> LLMResult<String> {
        let reply = if system_prompt.starts_with("You are a document architect") {
            r#"{"outline":[{"title":"Background"},{"title":"Approach"}]}"#
        } else if system_prompt.starts_with("You are an enterprise document writer") {
            r#"{"content":"Grounded body [chunk#1]","usedChunkIds":[1]}"#
        } else if system_prompt.starts_with("You are a document writer") {
            r#"{"sections":[{"title":"Summary","content":"Draft summary","usedChunkIds":[1]},{"title":"Plan","content":"Draft plan"}]}"#
        } else {
            "let me think about it"
        };
        Ok(reply.to_string())
    }

    async fn embedding(&self, text: &str) -> LLMResult<Vec<f64>> {
        Ok(vec![1.0, text.len() as f64 / 100.0])
    }
}

struct Pipeline {
    _dir: TempDir,
    ops: Arc<MemoryDocumentOps>,
    service: TaskService,
}

async fn pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let knowledge = dir.path().join("kb");
    std::fs::create_dir(&knowledge).unwrap();
    std::fs::write(
        knowledge.join("notes.md"),
        "Quill writes documents.\n\nIt keeps every step in SQLite.",
    )
    .unwrap();

    let config = Config {
        agent: AgentConfig {
            fallback_on_unparseable_plan: true,
            ..AgentConfig::default()
        },
        ..Config::default()
    };

    let gateway: Arc<dyn ModelGateway> = Arc::new(RoleGateway);
    let chunks = load_knowledge_dir(&knowledge, 800).unwrap();
    let ops = Arc::new(MemoryDocumentOps::new(Arc::clone(&gateway), chunks, 8).unwrap());
    let database = Database::new(&dir.path().join("quill.db")).await.unwrap();
    let service = build_service(
        &config,
        &database,
        gateway,
        Arc::clone(&ops) as Arc<dyn DocumentOps>,
    );

    Pipeline {
        _dir: dir,
        ops,
        service,
    }
}

#[tokio::test]
async fn test_standard_run_writes_outline_sections() {
    let p = pipeline().await;
    assert_eq!(p.ops.chunk_count(), 1);

    let handle = p
        .service
        .create_and_run(AgentTaskCreateRequest {
            document_id: Some(10),
            requirement: Some("draft intro".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let task_id = handle.task_id;
    assert!(handle.wait().await.unwrap().is_success());

    let snapshot = p.service.get_snapshot(task_id).await.unwrap();
    assert_eq!(snapshot.task.status, TaskStatus::Success);
    let tools: Vec<_> = snapshot
        .steps
        .iter()
        .map(|s| s.tool_name.as_deref().unwrap_or("finish"))
        .collect();
    assert_eq!(
        tools,
        vec![
            "retrieve_knowledge",
            "generate_outline",
            "persist_outline",
            "compose_sections",
            "finish"
        ]
    );
    assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(
        snapshot.task.final_summary.as_deref(),
        Some("Task completed: sections written in STANDARD mode")
    );

    let sections = p.ops.sections(10).await;
    assert_eq!(sections.len(), 2);
    for section in &sections {
        assert_eq!(section.content.as_deref(), Some("Grounded body"));
        assert_eq!(section.chunk_refs, vec![1]);
    }

    let markdown = p.ops.render_markdown(10).await;
    assert!(markdown.starts_with("# Background"));
    assert!(markdown.contains("# Approach"));
    assert!(!markdown.contains("[chunk#"));
}

#[tokio::test]
async fn test_fast_draft_run_splits_full_draft() {
    let p = pipeline().await;

    let handle = p
        .service
        .create_and_run(AgentTaskCreateRequest {
            document_id: Some(20),
            run_mode: Some("FAST_DRAFT".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let task_id = handle.task_id;
    assert_eq!(handle.max_iterations, 10);
    assert!(handle.wait().await.unwrap().is_success());

    let snapshot = p.service.get_snapshot(task_id).await.unwrap();
    let tools: Vec<_> = snapshot
        .steps
        .iter()
        .map(|s| s.tool_name.as_deref().unwrap_or("finish"))
        .collect();
    assert_eq!(
        tools,
        vec![
            "retrieve_knowledge",
            "compose_full_draft",
            "split_persist_draft",
            "finish"
        ]
    );

    let sections = p.ops.sections(20).await;
    let titles: Vec<_> = sections.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Summary", "Plan"]);
    assert_eq!(sections[0].content.as_deref(), Some("Draft summary"));
}
