//! System prompt assembly.
//!
//! The prompt folds in the task text, the project's AGENTS.md (cached per
//! project path), and Navigator guidance. Constraints tighten when no
//! Navigator scaffold is present.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::complexity::Complexity;
use crate::task::Task;

const AGENTS_FILE: &str = "AGENTS.md";

/// Builds run prompts, caching AGENTS.md content per project path.
pub struct PromptBuilder {
    agents_cache: Mutex<Option<(PathBuf, String)>>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            agents_cache: Mutex::new(None),
        }
    }

    /// Load AGENTS.md for a project, reusing the cache when the path has
    /// not changed. A path change invalidates the cache.
    pub fn agents_content(&self, project_path: &Path) -> String {
        let mut cache = self.agents_cache.lock().expect("agents cache lock");
        if let Some((cached_path, content)) = cache.as_ref() {
            if cached_path == project_path {
                return content.clone();
            }
        }

        let content = std::fs::read_to_string(project_path.join(AGENTS_FILE)).unwrap_or_default();
        if !content.is_empty() {
            debug!(path = %project_path.display(), "loaded AGENTS.md");
        }
        *cache = Some((project_path.to_path_buf(), content.clone()));
        content
    }

    /// Compose the full prompt for a run.
    ///
    /// `execution_path` is where the agent actually works (the worktree
    /// when isolation is on); AGENTS.md comes from the original project
    /// path so the cache stays stable across worktrees.
    pub fn build(&self, task: &Task, complexity: Complexity, navigator_present: bool) -> String {
        let mut sections: Vec<String> = Vec::new();

        sections.push(format!(
            "You are an autonomous coding agent working on the following task.\n\n\
             ## TASK {}\n{}\n\n{}",
            task.id, task.title, task.description
        ));

        let agents = self.agents_content(&task.project_path);
        if !agents.is_empty() {
            sections.push(format!("## PROJECT INSTRUCTIONS\n{agents}"));
        }

        if navigator_present {
            sections.push(
                "## NAVIGATOR\n\
                 This project carries a `.agent/` scaffold. Read \
                 `.agent/DEVELOPMENT-README.md` before changing code and keep \
                 its navigation index accurate as you work."
                    .to_string(),
            );
        } else if !task.skip_navigator && !complexity.should_skip_navigator() {
            sections.push(
                "## NAVIGATOR\n\
                 No `.agent/` scaffold exists yet. It will be initialized \
                 automatically; do not create one by hand."
                    .to_string(),
            );
        } else {
            sections.push(
                "## CONSTRAINTS\n\
                 - Keep the change minimal and focused on the task.\n\
                 - Do not restructure the project or add scaffolding.\n\
                 - Run the project's tests before declaring completion."
                    .to_string(),
            );
        }

        if complexity.should_run_research() {
            sections.push(
                "## APPROACH\n\
                 Start with a research pass over the affected modules before \
                 editing. Summarize findings briefly, then implement."
                    .to_string(),
            );
        }

        sections.push(
            "## STATUS SIGNALS\n\
             Report progress with fenced `pilot-signal` blocks:\n\
             ```pilot-signal\n\
             {\"v\":2,\"type\":\"status\",\"phase\":\"IMPL\",\"progress\":50,\"iteration\":1}\n\
             ```\n\
             Emit `{\"v\":2,\"type\":\"exit\",\"exit_signal\":true,\"success\":true}` \
             when the task is complete, and commit your work with a clear message."
                .to_string(),
        );

        sections.join("\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn task_at(dir: &Path) -> Task {
        Task::new("GH-1", "Fix widget", dir.to_path_buf()).with_description("make it spin")
    }

    #[test]
    fn prompt_contains_task_text() {
        let dir = tempdir().unwrap();
        let builder = PromptBuilder::new();
        let prompt = builder.build(&task_at(dir.path()), Complexity::Medium, false);
        assert!(prompt.contains("GH-1"));
        assert!(prompt.contains("Fix widget"));
        assert!(prompt.contains("make it spin"));
        assert!(prompt.contains("pilot-signal"));
    }

    #[test]
    fn prompt_includes_agents_md_when_present() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AGENTS.md"), "Always use rebase.").unwrap();
        let builder = PromptBuilder::new();
        let prompt = builder.build(&task_at(dir.path()), Complexity::Medium, false);
        assert!(prompt.contains("## PROJECT INSTRUCTIONS"));
        assert!(prompt.contains("Always use rebase."));
    }

    #[test]
    fn agents_cache_invalidated_on_path_change() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        fs::write(dir_a.path().join("AGENTS.md"), "from A").unwrap();
        fs::write(dir_b.path().join("AGENTS.md"), "from B").unwrap();

        let builder = PromptBuilder::new();
        assert_eq!(builder.agents_content(dir_a.path()), "from A");
        assert_eq!(builder.agents_content(dir_b.path()), "from B");
        // and back, re-reading A rather than serving B's cache
        assert_eq!(builder.agents_content(dir_a.path()), "from A");
    }

    #[test]
    fn agents_cache_serves_repeat_reads() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AGENTS.md"), "v1").unwrap();
        let builder = PromptBuilder::new();
        assert_eq!(builder.agents_content(dir.path()), "v1");

        // same path: cached content survives the file changing underneath
        fs::write(dir.path().join("AGENTS.md"), "v2").unwrap();
        assert_eq!(builder.agents_content(dir.path()), "v1");
    }

    #[test]
    fn trivial_tasks_get_constraints_not_navigator() {
        let dir = tempdir().unwrap();
        let builder = PromptBuilder::new();
        let prompt = builder.build(&task_at(dir.path()), Complexity::Trivial, false);
        assert!(prompt.contains("## CONSTRAINTS"));
        assert!(!prompt.contains("initialized"));
    }

    #[test]
    fn navigator_present_references_scaffold() {
        let dir = tempdir().unwrap();
        let builder = PromptBuilder::new();
        let prompt = builder.build(&task_at(dir.path()), Complexity::Medium, true);
        assert!(prompt.contains(".agent/DEVELOPMENT-README.md"));
    }

    #[test]
    fn research_section_for_complex_tasks() {
        let dir = tempdir().unwrap();
        let builder = PromptBuilder::new();
        let prompt = builder.build(&task_at(dir.path()), Complexity::Complex, false);
        assert!(prompt.contains("research pass"));
    }
}
