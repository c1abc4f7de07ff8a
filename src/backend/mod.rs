//! Backend abstraction over agent CLI subprocesses.
//!
//! A backend is a capability set: a name, an availability probe, and an
//! `execute` that runs the agent and streams typed events. Adding a
//! backend means a new variant with its own argument assembly and tool
//! normalization table; the runner does not change.

mod claude;
mod driver;
mod qwen;
pub mod stream;

pub use claude::ClaudeBackend;
pub use qwen::QwenBackend;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::complexity::EffortLevel;
use crate::errors::BackendError;

/// Typed event produced by the stream parser.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Session established; carries the backend session id.
    Init { session_id: String },
    /// Assistant prose (also carries unparseable raw lines).
    Text { text: String },
    /// The agent invoked a tool. `name` is normalized to the canonical set.
    ToolUse { name: String, input: Value },
    /// Output from a completed tool call.
    ToolResult { output: String, is_error: bool },
    /// Terminal result frame with final usage.
    Result {
        output: String,
        is_error: bool,
        tokens_input: u64,
        tokens_output: u64,
        model: Option<String>,
    },
    /// Driver-level failure surfaced mid-stream.
    Error { message: String },
    /// Driver lifecycle notice (liveness warnings, retries).
    Progress { phase: String, message: String },
}

/// Handler invoked for every event, in stream order.
pub type EventHandler = Arc<dyn Fn(&BackendEvent) + Send + Sync>;

/// Callback fired when a liveness timer trips: (pid, elapsed).
pub type LivenessCallback = Arc<dyn Fn(u32, Duration) + Send + Sync>;

/// Everything a backend needs for one run.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub project_path: PathBuf,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub effort: Option<EffortLevel>,
    pub from_pr: Option<u64>,
    pub verbose: bool,
    pub event_handler: Option<EventHandler>,
    pub heartbeat_timeout: Duration,
    pub watchdog_timeout: Duration,
    pub heartbeat_callback: Option<LivenessCallback>,
    pub watchdog_callback: Option<LivenessCallback>,
    /// Cancellation signal from the caller; flips to `true` once.
    pub cancel: watch::Receiver<bool>,
}

impl ExecuteOptions {
    pub fn new(prompt: impl Into<String>, project_path: PathBuf) -> Self {
        // Sender dropped immediately: the receiver never observes `true`,
        // i.e. "never cancelled". The driver treats a closed channel the
        // same way.
        let (_tx, rx) = watch::channel(false);
        Self {
            prompt: prompt.into(),
            project_path,
            model: None,
            resume_session_id: None,
            effort: None,
            from_pr: None,
            verbose: false,
            event_handler: None,
            heartbeat_timeout: Duration::from_secs(120),
            watchdog_timeout: Duration::from_secs(30 * 60),
            heartbeat_callback: None,
            watchdog_callback: None,
            cancel: rx,
        }
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Final outcome of one subprocess run.
#[derive(Debug, Clone, Default)]
pub struct BackendResult {
    pub success: bool,
    pub output: String,
    pub session_id: Option<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub model: Option<String>,
}

/// An agent CLI the engine can drive.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backing binary exists on this system.
    fn is_available(&self) -> bool;

    async fn execute(&self, opts: ExecuteOptions) -> Result<BackendResult, BackendError>;
}

/// Canonical tool names the engine understands.
pub const CANONICAL_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Grep",
    "Glob",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "Task",
    "Skill",
    "ExitPlanMode",
    "NotebookEdit",
];

/// Normalize a backend-specific tool name against a closed mapping table.
/// MCP tools (`mcp__*`) pass through untouched; unknown names are kept
/// as-is so new tools degrade gracefully.
pub fn normalize_tool_name(name: &str, table: &[(&str, &str)]) -> String {
    if name.starts_with("mcp__") {
        return name.to_string();
    }
    if let Some((_, canonical)) = table.iter().find(|(alias, _)| *alias == name) {
        return canonical.to_string();
    }
    name.to_string()
}

/// PATH lookup for a binary, honoring an absolute path as-is.
pub fn binary_on_path(binary: &str) -> bool {
    let path = std::path::Path::new(binary);
    if path.is_absolute() {
        return path.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file()
    })
}
