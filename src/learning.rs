//! Outcome recording seam.
//!
//! Every finished task is summarized into a `TaskOutcome` and handed to
//! the learning store. The store itself is external; the bundled JSONL
//! implementation appends to `.pilot/learning.jsonl` so later runs (or
//! humans) can mine it. Recording is best-effort.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::complexity::Complexity;
use crate::task::ExecutionResult;

/// Compact record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub title: String,
    pub complexity: Complexity,
    pub success: bool,
    pub duration_secs: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub model: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn from_result(title: &str, complexity: Complexity, result: &ExecutionResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            title: title.to_string(),
            complexity,
            success: result.success,
            duration_secs: result.duration.as_secs(),
            tokens_input: result.tokens_input,
            tokens_output: result.tokens_output,
            model: result.model_name.clone(),
            error: result.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Persistence for task outcomes and drift corrections.
#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn record_outcome(&self, outcome: TaskOutcome) -> anyhow::Result<()>;

    async fn record_correction(&self, pattern: &str, correction: &str) -> anyhow::Result<()>;
}

/// Append-only JSONL store under the project's `.pilot/` directory.
pub struct JsonlLearningStore {
    path: PathBuf,
}

impl JsonlLearningStore {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            path: project_path.into().join(".pilot").join("learning.jsonl"),
        }
    }

    fn append(&self, line: &str) -> anyhow::Result<()> {
        use std::io::Write;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[async_trait]
impl LearningStore for JsonlLearningStore {
    async fn record_outcome(&self, outcome: TaskOutcome) -> anyhow::Result<()> {
        let line = serde_json::to_string(&outcome)?;
        self.append(&line)?;
        debug!(task_id = %outcome.task_id, "outcome recorded");
        Ok(())
    }

    async fn record_correction(&self, pattern: &str, correction: &str) -> anyhow::Result<()> {
        let line = serde_json::to_string(&serde_json::json!({
            "kind": "correction",
            "pattern": pattern,
            "correction": correction,
            "recorded_at": Utc::now(),
        }))?;
        self.append(&line)
    }
}

/// No-op store for callers that do not want persistence.
pub struct NullLearningStore;

#[async_trait]
impl LearningStore for NullLearningStore {
    async fn record_outcome(&self, _outcome: TaskOutcome) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_correction(&self, _pattern: &str, _correction: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
