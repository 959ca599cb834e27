//! Integration tests for the Task Lifecycle Service
//!
//! Covers submission, mode budgets, terminal events, worker failures and
//! restart reconciliation.

mod common;

use common::{
    finish, harness, harness_in, test_config, tool, Gated, Panicking, ScriptedGateway, Succeeding,
};
use quill_engine::agent::service::INTERRUPTED_MESSAGE;
use quill_engine::agent::TaskOutcome;
use quill_engine::db::{Database, NewTask, ReconcilePolicy, ReconcileReport, StartStep};
use quill_engine::message_bus::{Event, EventType};
use quill_engine::tools::{ToolHandler, ToolName};
use sdk::errors::EngineError;
use sdk::types::{AgentTaskCreateRequest, RunMode, StepStatus, StepType, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn request(document_id: i64, mode: Option<&str>) -> AgentTaskCreateRequest {
    AgentTaskCreateRequest {
        document_id: Some(document_id),
        run_mode: mode.map(str::to_string),
        requirement: Some("draft intro".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_mode_selects_iteration_budget() {
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness(gateway, vec![], test_config()).await;

    let fast = h
        .service
        .create_and_run(request(1, Some("fast_draft")))
        .await
        .unwrap();
    assert_eq!(fast.run_mode, RunMode::FastDraft);
    assert_eq!(fast.max_iterations, 10);

    let standard = h.service.create_and_run(request(1, None)).await.unwrap();
    assert_eq!(standard.run_mode, RunMode::Standard);
    assert_eq!(standard.max_iterations, 14);

    let unknown = h
        .service
        .create_and_run(request(1, Some("turbo")))
        .await
        .unwrap();
    assert_eq!(unknown.run_mode, RunMode::Standard);

    for handle in [fast, standard, unknown] {
        let task_id = handle.task_id;
        assert!(handle.wait().await.unwrap().is_success());
        let task = h.service.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.id, task_id.to_string());
    }
}

#[tokio::test]
async fn test_missing_document_is_rejected() {
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness(gateway, vec![], test_config()).await;

    let result = h
        .service
        .create_and_run(AgentTaskCreateRequest::default())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));

    let listed = h.service.list_tasks_by_document(None, None).await;
    assert!(matches!(listed, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness(gateway, vec![], test_config()).await;

    assert!(matches!(
        h.service.get_task(9999).await,
        Err(EngineError::TaskNotFound(9999))
    ));
    assert!(matches!(
        h.service.get_snapshot(9999).await,
        Err(EngineError::TaskNotFound(9999))
    ));
}

#[tokio::test]
async fn test_each_task_publishes_one_terminal_event() {
    let gateway = ScriptedGateway::new(&[tool("retrieve_knowledge"), finish("done")]);
    let h = harness(
        gateway,
        vec![(ToolName::RetrieveKnowledge, Succeeding::new("ok") as Arc<dyn ToolHandler>)],
        test_config(),
    )
    .await;
    let mut events = h.bus.subscribe(EventType::All).await;

    let mut handles = Vec::new();
    for document_id in 1..=4 {
        handles.push(h.service.create_and_run(request(document_id, None)).await.unwrap());
    }
    let ids: Vec<i64> = handles.iter().map(|handle| handle.task_id).collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let mut created: HashMap<i64, usize> = HashMap::new();
    let mut terminal: HashMap<i64, usize> = HashMap::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        if let Event::TaskCreated { task_id, .. } = event {
            *created.entry(task_id).or_default() += 1;
        }
        if event.is_terminal() {
            *terminal.entry(event.task_id()).or_default() += 1;
        }
    }

    for id in ids {
        assert_eq!(created.get(&id), Some(&1), "task {} created events", id);
        assert_eq!(terminal.get(&id), Some(&1), "task {} terminal events", id);
    }
}

#[tokio::test]
async fn test_concurrent_tasks_share_the_worker_pool() {
    let mut config = test_config();
    config.worker_pool_size = 1;
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness(gateway, vec![], config).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(h.service.create_and_run(request(21, None)).await.unwrap());
    }
    for handle in handles {
        assert!(handle.wait().await.unwrap().is_success());
    }

    let items = h
        .service
        .list_tasks_by_document(Some(21), None)
        .await
        .unwrap();
    assert_eq!(items.len(), 5);
    for item in &items {
        assert_eq!(item.status, TaskStatus::Success);
        assert_eq!(item.total_steps, 1);
        assert_eq!(item.success_steps, 1);
        assert_eq!(item.failed_steps, 0);
    }
}

#[tokio::test]
async fn test_panicking_tool_aborts_the_worker() {
    let gateway = ScriptedGateway::new(&[tool("generate_outline")]);
    let h = harness(
        gateway,
        vec![(ToolName::GenerateOutline, Arc::new(Panicking) as Arc<dyn ToolHandler>)],
        test_config(),
    )
    .await;
    let mut failures = h.bus.subscribe(EventType::TaskFailed).await;

    let handle = h.service.create_and_run(request(30, None)).await.unwrap();
    let task_id = handle.task_id;
    let outcome = handle.wait().await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.starts_with("Agent worker aborted")));

    let snapshot = h.service.get_snapshot(task_id).await.unwrap();
    assert_eq!(snapshot.task.status, TaskStatus::Failed);
    assert_eq!(snapshot.steps.len(), 1);
    assert_eq!(snapshot.steps[0].status, StepStatus::Failed);
    assert!(snapshot.steps[0].finished_at.is_some());

    let event = failures.recv().await.unwrap();
    assert_eq!(event.task_id(), task_id);
}

#[tokio::test]
async fn test_list_limit_is_clamped() {
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness(gateway, vec![], test_config()).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(h.service.create_and_run(request(40, None)).await.unwrap());
    }
    let newest = handles.last().map(|handle| handle.task_id).unwrap();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    for limit in [0, -5] {
        let items = h
            .service
            .list_tasks_by_document(Some(40), Some(limit))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, newest.to_string());
    }

    let items = h
        .service
        .list_tasks_by_document(Some(40), Some(1000))
        .await
        .unwrap();
    assert_eq!(items.len(), 3);

    let other = h
        .service
        .list_tasks_by_document(Some(41), None)
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_recover_fails_interrupted_work() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("quill.db");

    // A previous process left a task and a step RUNNING
    let (task_id, step_id) = {
        let db = Database::new(&db_path).await.unwrap();
        let repo = db.tasks();
        let task = repo
            .create_task(&NewTask {
                document_id: 50,
                section_id: None,
                knowledge_base_id: None,
                run_mode: RunMode::Standard,
                requirement: None,
                project_params: None,
                created_by: None,
                max_iterations: 14,
            })
            .await
            .unwrap();
        let step_id = repo
            .start_step(&StartStep {
                task_id: task.id,
                iteration_no: 1,
                step_code: "LOOP_1".to_string(),
                step_name: "retrieve_knowledge".to_string(),
                step_type: StepType::ToolCall,
                tool_name: Some("retrieve_knowledge".to_string()),
                reason: None,
                args_json: "{}".to_string(),
                idempotency_key: None,
                timeout_ms: 0,
            })
            .await
            .unwrap();
        db.close().await.unwrap();
        (task.id, step_id)
    };

    // Deadlines already passed for the abandoned rows
    let mut config = test_config();
    config.planner_timeout_ms = 0;
    config.max_retry_backoff_ms = 0;
    config.reconcile_grace_ms = 0;
    let gateway = ScriptedGateway::new(&[finish("done")]);
    let h = harness_in(temp_dir, gateway, vec![], config).await;
    let service = &h.service;

    let report = service.recover().await.unwrap();
    assert_eq!(report.tasks_failed, 1);
    assert_eq!(report.steps_failed, 1);

    let snapshot = service.get_snapshot(task_id).await.unwrap();
    assert_eq!(snapshot.task.status, TaskStatus::Failed);
    assert_eq!(
        snapshot.task.error_message.as_deref(),
        Some("interrupted: process restarted")
    );
    let step = h.repo.get_step(step_id).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Failed);

    let again = service.recover().await.unwrap();
    assert_eq!(again.tasks_failed, 0);
    assert_eq!(again.steps_failed, 0);
}

#[tokio::test]
async fn test_recover_from_another_process_spares_live_task() {
    let gateway = ScriptedGateway::new(&[tool("retrieve_knowledge"), finish("done")]);
    let gate = Gated::new();
    let h = harness(
        gateway,
        vec![(ToolName::RetrieveKnowledge, Arc::clone(&gate) as Arc<dyn ToolHandler>)],
        test_config(),
    )
    .await;

    let handle = h.service.create_and_run(request(60, None)).await.unwrap();
    let task_id = handle.task_id;
    gate.started.notified().await;

    // A second process opens the same database while the step is open
    let other = Database::new(&h.db_path()).await.unwrap();
    let policy = ReconcilePolicy::from_config(&test_config());
    let report = other
        .tasks()
        .reconcile_interrupted(INTERRUPTED_MESSAGE, &policy)
        .await
        .unwrap();
    assert_eq!(report, ReconcileReport::default());
    other.close().await.unwrap();

    gate.release.notify_one();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded("done".to_string()));

    let snapshot = h.service.get_snapshot(task_id).await.unwrap();
    assert_eq!(snapshot.task.status, TaskStatus::Success);
    assert!(snapshot.task.error_message.is_none());
    assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Success));
}

#[tokio::test]
async fn test_step_events_are_queued_before_wait_returns() {
    let gateway = ScriptedGateway::new(&[
        tool("retrieve_knowledge"),
        tool("generate_outline"),
        finish("done"),
    ]);
    let h = harness(
        gateway,
        vec![
            (ToolName::RetrieveKnowledge, Succeeding::new("passages") as Arc<dyn ToolHandler>),
            (ToolName::GenerateOutline, Succeeding::new("outline") as Arc<dyn ToolHandler>),
        ],
        test_config(),
    )
    .await;
    let mut events = h.bus.subscribe(EventType::StepFinished).await;

    let handle = h.service.create_and_run(request(70, None)).await.unwrap();
    let task_id = handle.task_id;
    assert!(handle.wait().await.unwrap().is_success());

    let mut codes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::StepFinished {
            task_id: id,
            step_code,
            ..
        } = event
        {
            assert_eq!(id, task_id);
            codes.push(step_code);
        }
    }
    assert_eq!(codes, vec!["LOOP_1", "LOOP_2", "LOOP_3"]);
}
