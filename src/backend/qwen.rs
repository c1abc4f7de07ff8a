//! Qwen-Code-like backend.
//!
//! Same wire protocol as the Claude CLI, different argument spelling and
//! snake_case tool names. Effort, from-PR, and session resume are not
//! supported by this CLI and are silently dropped.

use async_trait::async_trait;

use crate::errors::BackendError;

use super::driver::run_stream_cli;
use super::{Backend, BackendResult, ExecuteOptions, binary_on_path};

const TOOL_TABLE: &[(&str, &str)] = &[
    ("read_file", "Read"),
    ("read_many_files", "Read"),
    ("write_file", "Write"),
    ("edit", "Edit"),
    ("replace", "Edit"),
    ("run_shell_command", "Bash"),
    ("shell", "Bash"),
    ("search_file_content", "Grep"),
    ("grep", "Grep"),
    ("glob", "Glob"),
    ("web_fetch", "WebFetch"),
    ("web_search", "WebSearch"),
    ("google_web_search", "WebSearch"),
    ("todo_write", "TodoWrite"),
    ("task", "Task"),
    ("skill", "Skill"),
    ("exit_plan_mode", "ExitPlanMode"),
];

pub struct QwenBackend {
    binary: String,
    skip_permissions: bool,
}

impl QwenBackend {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("PILOT_QWEN_CMD").unwrap_or_else(|_| "qwen".to_string()),
            skip_permissions: true,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn build_args(&self, opts: &ExecuteOptions) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if self.skip_permissions {
            args.push("--yolo".to_string());
        }
        if let Some(model) = &opts.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        // effort / from_pr / resume: unsupported here, dropped
        args.push("-p".to_string());
        args.push(opts.prompt.clone());
        args
    }
}

impl Default for QwenBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for QwenBackend {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn is_available(&self) -> bool {
        binary_on_path(&self.binary)
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<BackendResult, BackendError> {
        run_stream_cli(&self.binary, self.build_args(&opts), &opts, TOOL_TABLE).await
    }
}
