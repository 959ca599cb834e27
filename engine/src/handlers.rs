//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Create a task, follow its steps and wait for the terminal state
//! - show: Show a task and its steps
//! - list: Show the newest tasks of a document
//! - recover: Fail work left RUNNING by a process that is gone

use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{AgentCore, Planner, TaskService};
use crate::config::Config;
use crate::db::{Database, TaskSnapshot};
use crate::llm::{ModelGateway, OpenAIGateway};
use crate::message_bus::{Event, EventType, MessageBus};
use crate::tools::{DocumentOps, MemoryDocumentOps, ToolRegistry};
use sdk::types::AgentTaskCreateRequest;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Arguments of `quill run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub knowledge_base_id: Option<i64>,
    pub mode: String,
    pub requirement: Option<String>,
    pub params: Option<String>,
    pub output: Option<PathBuf>,
}

/// Wire the Task Lifecycle Service over an open database
pub fn build_service(
    config: &Config,
    database: &Database,
    gateway: Arc<dyn ModelGateway>,
    ops: Arc<dyn DocumentOps>,
) -> TaskService {
    let task_repo = Arc::new(database.tasks());
    let bus = Arc::new(MessageBus::new());
    let core = Arc::new(AgentCore::new(
        Planner::new(gateway, &config.agent),
        Arc::new(ToolRegistry::with_document_ops(ops)),
        Arc::clone(&task_repo),
        Arc::clone(&bus),
        config.agent.clone(),
    ));
    TaskService::new(task_repo, core, bus, config.agent.clone())
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}

/// Run a task and wait for it
///
/// Reconciles abandoned work first, then prints the task's step events
/// until the run completes.
pub async fn handle_run(args: RunArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;

    let gateway: Arc<dyn ModelGateway> = Arc::new(
        OpenAIGateway::from_config(&config.llm).context("Failed to create model gateway")?,
    );
    let ops = Arc::new(MemoryDocumentOps::from_config(
        Arc::clone(&gateway),
        &config.knowledge,
    )?);
    let service = build_service(config, &database, gateway, Arc::clone(&ops) as Arc<dyn DocumentOps>);
    service.recover().await?;

    let mut events = service.bus().subscribe(EventType::StepFinished).await;
    let handle = service
        .create_and_run(AgentTaskCreateRequest {
            document_id: Some(args.document_id),
            section_id: args.section_id,
            knowledge_base_id: args.knowledge_base_id,
            run_mode: Some(args.mode.clone()),
            requirement: args.requirement.clone(),
            project_params: args.params.clone(),
            created_by: None,
        })
        .await?;
    let task_id = handle.task_id;

    if let OutputFormat::Text = format {
        println!(
            "Task {} started ({} mode, up to {} iterations)",
            task_id, handle.run_mode, handle.max_iterations
        );
        println!();
    }

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome?,
            Some(event) = events.recv() => print_step_event(&event, task_id, format),
        }
    };
    // Step events are queued before the terminal transition
    while let Ok(event) = events.try_recv() {
        print_step_event(&event, task_id, format);
    }

    let snapshot = service.get_snapshot(task_id).await?;
    print_snapshot(&snapshot, format)?;

    if let Some(path) = &args.output {
        let markdown = ops.render_markdown(args.document_id).await;
        tokio::fs::write(path, markdown)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if let OutputFormat::Text = format {
            println!("Markdown written to {}", path.display());
        }
    }

    database.close().await?;

    if outcome.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Task {} failed", task_id))
    }
}

/// Task service for commands that submit nothing. The document backend
/// starts without knowledge.
fn query_service(config: &Config, database: &Database) -> Result<TaskService> {
    let gateway: Arc<dyn ModelGateway> = Arc::new(
        OpenAIGateway::from_config(&config.llm).context("Failed to create model gateway")?,
    );
    let ops = Arc::new(MemoryDocumentOps::new(
        Arc::clone(&gateway),
        Vec::new(),
        config.knowledge.top_k,
    )?);
    Ok(build_service(config, database, gateway, ops))
}

/// Show a task and all its steps
pub async fn handle_show(task_id: i64, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let service = query_service(config, &database)?;

    let snapshot = service.get_snapshot(task_id).await?;
    print_snapshot(&snapshot, format)?;

    database.close().await
}

/// Show the newest tasks of a document
pub async fn handle_list(
    document_id: i64,
    limit: Option<i64>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let service = query_service(config, &database)?;

    let items = service
        .list_tasks_by_document(Some(document_id), limit)
        .await?;

    match format {
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No tasks for document {}", document_id);
            } else {
                println!("Tasks for document {} ({} shown):", document_id, items.len());
                println!();
            }

            for item in &items {
                println!("Task {}: {}", item.id, item.status.as_str());
                println!("  Mode: {}", item.run_mode);
                println!(
                    "  Steps: {} total, {} succeeded, {} failed",
                    item.total_steps, item.success_steps, item.failed_steps
                );
                if let Some(error) = &item.error_message {
                    println!("  Error: {}", error);
                }
                println!("  Created: {}", format_millis(Some(item.created_at)));
                println!("  Finished: {}", format_millis(item.finished_at));
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "tasks": items,
                "count": items.len()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await
}

/// Fail steps and tasks left RUNNING past their deadlines
pub async fn handle_recover(config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let service = query_service(config, &database)?;
    let report = service.recover().await?;

    match format {
        OutputFormat::Text => {
            println!(
                "Reconciled {} task(s) and {} step(s)",
                report.tasks_failed, report.steps_failed
            );
        }
        OutputFormat::Json => {
            let output = json!({
                "tasksFailed": report.tasks_failed,
                "stepsFailed": report.steps_failed
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await
}

fn print_step_event(event: &Event, task_id: i64, format: OutputFormat) {
    if let (
        Event::StepFinished {
            task_id: id,
            iteration,
            step_code,
            tool,
            status,
        },
        OutputFormat::Text,
    ) = (event, format)
    {
        if *id == task_id {
            println!(
                "  [{}] {} {} {}",
                iteration,
                step_code,
                tool.as_deref().unwrap_or("-"),
                status.as_str()
            );
        }
    }
}

fn print_snapshot(snapshot: &TaskSnapshot, format: OutputFormat) -> Result<()> {
    let task = &snapshot.task;

    match format {
        OutputFormat::Text => {
            println!("Task {}: {}", task.id, task.status.as_str());
            println!("  Document: {}", task.document_id);
            if let Some(section_id) = task.section_id {
                println!("  Section: {}", section_id);
            }
            println!("  Mode: {}", task.run_mode);
            println!(
                "  Iterations: {}/{}",
                task.current_iteration, task.max_iterations
            );
            if let Some(summary) = &task.final_summary {
                println!("  Summary: {}", summary);
            }
            if let Some(error) = &task.error_message {
                println!("  Error: {}", error);
            }
            println!("  Created: {}", format_millis(Some(task.created_at)));
            println!("  Finished: {}", format_millis(task.finished_at));

            println!();
            println!("Steps ({} total):", snapshot.steps.len());
            println!();

            for step in &snapshot.steps {
                println!(
                    "Step {} [{}] {}: {}",
                    step.iteration_no,
                    step.step_type.as_str(),
                    step.step_name,
                    step.status.as_str()
                );
                if let Some(reason) = &step.reason {
                    println!("  Reason: {}", reason);
                }
                if step.retry_count > 0 {
                    println!("  Retries: {}", step.retry_count);
                }
                if let Some(observation) = &step.observation {
                    println!("  {}", observation);
                }
                if let Some(error) = &step.error_message {
                    println!("  Error: {}", error);
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "task": snapshot.to_response(),
                "payload": snapshot.payload(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::db::NewTask;
    use sdk::errors::EngineError;
    use sdk::types::RunMode;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        Config {
            core: CoreConfig {
                data_dir: dir.path().to_path_buf(),
                ..CoreConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(None), "-");
        assert_eq!(format_millis(Some(0)), "1970-01-01 00:00:00");
    }

    #[tokio::test]
    async fn test_show_unknown_task_is_not_found() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let err = handle_show(9999, &config, OutputFormat::Json)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::TaskNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn test_list_and_recover_use_the_task_service() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let database = Database::new(&config.database_path()).await.unwrap();
        database
            .tasks()
            .create_task(&NewTask {
                document_id: 5,
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
        database.close().await.unwrap();

        handle_list(5, Some(0), &config, OutputFormat::Json)
            .await
            .unwrap();
        handle_list(6, None, &config, OutputFormat::Text)
            .await
            .unwrap();
        handle_recover(&config, OutputFormat::Json).await.unwrap();

        // The fresh task is inside its planner deadline
        let database = Database::new(&config.database_path()).await.unwrap();
        let items = database.tasks().list_tasks_by_document(5, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, sdk::types::TaskStatus::Running);
        database.close().await.unwrap();
    }
}
