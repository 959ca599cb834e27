//! Per-run Agent Context
//!
//! In-memory state owned by one Loop Controller run: the task fields the
//! planner and tools need, the running iteration, working memory and the
//! document tools' draft memory. Nothing here is persisted; the durable trace
//! of a run is its task and step rows.

use sdk::types::RunMode;

use super::WorkingMemory;
use crate::db::TaskRecord;
use crate::tools::document::DraftMemory;
use crate::tools::DraftProgress;

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub task_id: i64,
    pub document_id: i64,
    pub section_id: Option<i64>,
    pub knowledge_base_id: Option<i64>,
    pub run_mode: RunMode,
    pub requirement: Option<String>,
    pub project_params: Option<String>,
    pub created_by: Option<i64>,
    pub max_iterations: i64,
    /// Iteration currently being executed, 0 before the first one
    pub iteration: i64,
    pub observations: WorkingMemory,
    pub draft: DraftMemory,
    pub final_summary: Option<String>,
}

impl AgentContext {
    pub fn new(
        task_id: i64,
        document_id: i64,
        run_mode: RunMode,
        max_iterations: i64,
        observation_window: usize,
    ) -> Self {
        Self {
            task_id,
            document_id,
            section_id: None,
            knowledge_base_id: None,
            run_mode,
            requirement: None,
            project_params: None,
            created_by: None,
            max_iterations,
            iteration: 0,
            observations: WorkingMemory::with_window(observation_window),
            draft: DraftMemory::default(),
            final_summary: None,
        }
    }

    /// Mirror a freshly created task row
    pub fn from_task(task: &TaskRecord, observation_window: usize) -> Self {
        Self {
            section_id: task.section_id,
            knowledge_base_id: task.knowledge_base_id,
            requirement: task.requirement.clone(),
            project_params: task.project_params.clone(),
            created_by: task.created_by,
            ..Self::new(
                task.id,
                task.document_id,
                task.run_mode,
                task.max_iterations,
                observation_window,
            )
        }
    }

    /// Append to working memory
    pub fn observe(&mut self, observation: impl AsRef<str>) {
        self.observations.push(observation);
    }

    pub fn progress(&self) -> DraftProgress {
        self.draft.progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::TaskStatus;

    #[test]
    fn test_from_task_mirrors_fields() {
        let task = TaskRecord {
            id: 5,
            document_id: 10,
            section_id: Some(3),
            knowledge_base_id: Some(2),
            run_mode: RunMode::FastDraft,
            requirement: Some("draft intro".to_string()),
            project_params: Some("{\"region\":\"EU\"}".to_string()),
            max_iterations: 10,
            current_iteration: 0,
            status: TaskStatus::Running,
            final_summary: None,
            error_message: None,
            created_by: Some(7),
            created_at: 1,
            started_at: 1,
            finished_at: None,
        };

        let ctx = AgentContext::from_task(&task, 4);
        assert_eq!(ctx.task_id, 5);
        assert_eq!(ctx.section_id, Some(3));
        assert_eq!(ctx.run_mode, RunMode::FastDraft);
        assert_eq!(ctx.max_iterations, 10);
        assert_eq!(ctx.iteration, 0);
        assert_eq!(ctx.observations.window(), 4);
        assert!(ctx.final_summary.is_none());
    }

    #[test]
    fn test_observe_and_progress() {
        let mut ctx = AgentContext::new(1, 10, RunMode::Standard, 14, 30);
        ctx.observe("TOOL[retrieve_knowledge] knowledge retrieval done, 0 hits");
        assert_eq!(ctx.observations.len(), 1);
        assert_eq!(ctx.progress(), DraftProgress::default());
    }
}
