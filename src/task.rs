//! Task and execution result data model.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::complexity::EffortLevel;

/// A unit of work handed to the engine.
///
/// Tasks are created by the caller and treated as immutable during
/// execution, with one exception: epic sub-issue execution rewrites
/// `project_path` and `branch` to point into the parent's worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identity, e.g. "GH-123".
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    /// Filesystem root of the source repository.
    pub project_path: PathBuf,
    /// Target branch name. When absent, one is derived from the task id.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub create_pr: bool,
    /// Resume from an existing pull request, for backends that support it.
    #[serde(default)]
    pub from_pr: Option<u64>,
    /// Caller override for the effort axis; skips the LLM classifier.
    #[serde(default)]
    pub effort: Option<EffortLevel>,
    #[serde(default)]
    pub skip_navigator: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, project_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: None,
            project_path,
            branch: None,
            verbose: false,
            create_pr: false,
            from_pr: None,
            effort: None,
            skip_navigator: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_create_pr(mut self, create_pr: bool) -> Self {
        self.create_pr = create_pr;
        self
    }

    /// Branch to execute on: the explicit branch, or one derived from the id.
    pub fn target_branch(&self) -> String {
        match &self.branch {
            Some(b) => b.clone(),
            None => format!("pilot/{}", sanitize_ref_component(&self.id)),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` so the result is usable in
/// branch names and temp directory names.
pub fn sanitize_ref_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Outcome of one external quality gate command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

/// Everything the engine learned about one task execution.
///
/// Built up incrementally during `Runner::execute` and emitted once at the
/// end, on both success and failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub pr_url: String,
    pub commit_sha: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_research: u64,
    pub files_changed: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub model_name: String,
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub quality_gates: Vec<QualityGateResult>,
}

impl ExecutionResult {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            ..Self::default()
        }
    }

    /// Fold a sub-result into an aggregate (epic / decomposed execution).
    /// Token counts and line totals accumulate; PR URL and SHA keep the
    /// last non-empty value seen.
    pub fn absorb(&mut self, other: &ExecutionResult) {
        self.tokens_input += other.tokens_input;
        self.tokens_output += other.tokens_output;
        self.tokens_research += other.tokens_research;
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.estimated_cost_usd += other.estimated_cost_usd;
        for f in &other.files_changed {
            if !self.files_changed.contains(f) {
                self.files_changed.push(f.clone());
            }
        }
        if !other.pr_url.is_empty() {
            self.pr_url = other.pr_url.clone();
        }
        if !other.commit_sha.is_empty() {
            self.commit_sha = other.commit_sha.clone();
        }
        if !other.model_name.is_empty() {
            self.model_name = other.model_name.clone();
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
