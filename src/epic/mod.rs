//! Epic planning and sub-issue preparation.
//!
//! Epics are too large for one agent invocation. A planning subprocess
//! produces a numbered plan, the parser turns it into ordered subtasks,
//! and one hosting issue is opened per subtask. The runner then executes
//! them strictly sequentially inside the parent's worktree.

mod parser;

pub use parser::parse_subtasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{Backend, ExecuteOptions};
use crate::errors::PlanError;
use crate::hosting::HostingCli;
use crate::task::Task;

/// One planned unit of an epic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub title: String,
    pub description: String,
    /// 1-indexed, gap-free after dedup.
    pub order: u32,
    pub depends_on: Vec<u32>,
}

/// The parsed plan for an epic.
#[derive(Debug, Clone)]
pub struct EpicPlan {
    pub parent: Task,
    pub subtasks: Vec<PlannedSubtask>,
    pub total_effort: u32,
    pub plan_output: String,
}

/// A hosting issue created for one subtask.
#[derive(Debug, Clone)]
pub struct CreatedIssue {
    pub number: u64,
    pub url: String,
    pub subtask: PlannedSubtask,
}

/// Plans epics by running a dedicated planning subprocess.
pub struct EpicPlanner {
    backend: Arc<dyn Backend>,
    planning_model: Option<String>,
}

impl EpicPlanner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            planning_model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.planning_model = Some(model.into());
        self
    }

    fn planning_prompt(task: &Task) -> String {
        format!(
            "You are planning an epic that is too large for a single agent run.\n\n\
             ## EPIC {}\n{}\n\n{}\n\n\
             Break this epic into 3-5 sequential subtasks. Each subtask must be \
             independently completable and build on the previous ones.\n\n\
             Respond with a numbered list only, one subtask per line:\n\
             1. **Subtask title** - one-sentence description\n\
             Do not include anything else in your answer.",
            task.id, task.title, task.description
        )
    }

    /// Run the planner and parse its output. Parse failure is fatal for
    /// the epic flow.
    pub async fn plan(&self, task: &Task) -> Result<EpicPlan> {
        let mut opts = ExecuteOptions::new(Self::planning_prompt(task), task.project_path.clone());
        opts.model = self.planning_model.clone();

        let result = self
            .backend
            .execute(opts)
            .await
            .context("planning subprocess failed")?;

        if result.output.trim().is_empty() {
            return Err(PlanError::EmptyOutput.into());
        }
        let subtasks = parse_subtasks(&result.output)?;
        info!(task_id = %task.id, count = subtasks.len(), "epic planned");

        Ok(EpicPlan {
            parent: task.clone(),
            total_effort: subtasks.len() as u32,
            subtasks,
            plan_output: result.output,
        })
    }
}

/// Open one hosting issue per planned subtask, linking back to the parent.
pub async fn create_sub_issues(hosting: &HostingCli, plan: &EpicPlan) -> Result<Vec<CreatedIssue>> {
    let mut created = Vec::with_capacity(plan.subtasks.len());
    for subtask in &plan.subtasks {
        let body = format!(
            "{}\n\n---\nPart {} of {} of epic {}: {}",
            subtask.description,
            subtask.order,
            plan.subtasks.len(),
            plan.parent.id,
            plan.parent.title
        );
        let issue = hosting
            .create_issue(&subtask.title, &body)
            .await
            .with_context(|| format!("creating issue for subtask {}", subtask.order))?;
        info!(number = issue.number, title = %subtask.title, "sub-issue created");
        created.push(CreatedIssue {
            number: issue.number,
            url: issue.url,
            subtask: subtask.clone(),
        });
    }
    Ok(created)
}
