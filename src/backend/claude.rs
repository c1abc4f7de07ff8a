//! Claude-Code-like backend.

use async_trait::async_trait;

use crate::errors::BackendError;

use super::driver::run_with_session_retry;
use super::{Backend, BackendResult, ExecuteOptions, binary_on_path};

/// Claude tool names are already canonical PascalCase; the table only
/// needs the historical aliases.
const TOOL_TABLE: &[(&str, &str)] = &[
    ("str_replace_editor", "Edit"),
    ("str_replace_based_edit_tool", "Edit"),
    ("bash", "Bash"),
];

/// Backend for the `claude` CLI. Supports session resume, effort
/// selection, and resuming from a PR.
pub struct ClaudeBackend {
    binary: String,
    skip_permissions: bool,
}

impl ClaudeBackend {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("PILOT_CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string()),
            skip_permissions: true,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    fn build_args(&self, opts: &ExecuteOptions) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &opts.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(session) = &opts.resume_session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        if let Some(effort) = &opts.effort {
            args.push("--effort".to_string());
            args.push(effort.as_str().to_string());
        }
        if let Some(pr) = opts.from_pr {
            args.push("--from-pr".to_string());
            args.push(pr.to_string());
        }
        args.push("-p".to_string());
        args.push(opts.prompt.clone());
        args
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn is_available(&self) -> bool {
        binary_on_path(&self.binary)
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<BackendResult, BackendError> {
        run_with_session_retry(&self.binary, &opts, TOOL_TABLE, |o| self.build_args(o)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complexity::EffortLevel;
    use std::path::PathBuf;

    fn base_opts() -> ExecuteOptions {
        ExecuteOptions::new("do the thing", PathBuf::from("/tmp"))
    }

    #[test]
    fn args_include_stream_json_and_prompt() {
        let backend = ClaudeBackend::new();
        let args = backend.build_args(&base_opts());
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn args_include_model_when_routed() {
        let backend = ClaudeBackend::new();
        let mut opts = base_opts();
        opts.model = Some("opus".to_string());
        let args = backend.build_args(&opts);
        let idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[idx + 1], "opus");
    }

    #[test]
    fn args_resume_only_with_session_id() {
        let backend = ClaudeBackend::new();
        assert!(!backend.build_args(&base_opts()).contains(&"--resume".to_string()));

        let mut opts = base_opts();
        opts.resume_session_id = Some("s-1".to_string());
        let args = backend.build_args(&opts);
        let idx = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[idx + 1], "s-1");
    }

    #[test]
    fn args_effort_and_from_pr_supported() {
        let backend = ClaudeBackend::new();
        let mut opts = base_opts();
        opts.effort = Some(EffortLevel::High);
        opts.from_pr = Some(42);
        let args = backend.build_args(&opts);
        assert!(args.contains(&"--effort".to_string()));
        assert!(args.contains(&"high".to_string()));
        assert!(args.contains(&"--from-pr".to_string()));
        assert!(args.contains(&"42".to_string()));
    }

    #[test]
    fn skip_permissions_flag_toggles() {
        let backend = ClaudeBackend::new().with_skip_permissions(false);
        let args = backend.build_args(&base_opts());
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }
}
