//! Typed error hierarchy for the pilot engine.
//!
//! Two top-level types cover the two failure surfaces:
//! - `BackendError` — classified subprocess failures (retryable or not)
//! - `RunnerError` — programmer errors and broken invariants in the engine
//!
//! Expected task failures (the agent did not finish the work) are NOT errors
//! at the `Runner::execute` level; they come back as an `ExecutionResult`
//! with `success == false`.

use thiserror::Error;

/// Classified failure category from a backend subprocess.
///
/// Classification drives the retry engine: rate limits and API errors back
/// off exponentially, timeouts extend the watchdog, configuration errors
/// fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    RateLimit,
    ApiError,
    Timeout,
    InvalidConfig,
    SessionNotFound,
    Unknown,
}

impl BackendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ApiError => "api_error",
            Self::Timeout => "timeout",
            Self::InvalidConfig => "invalid_config",
            Self::SessionNotFound => "session_not_found",
            Self::Unknown => "unknown",
        }
    }

    /// Classify stderr output from a failed subprocess.
    ///
    /// Matching is case-insensitive substring search. More specific
    /// categories are checked before generic ones so that, e.g., a rate
    /// limit message containing "API" still classifies as `RateLimit`.
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        const RATE_LIMIT: &[&str] = &["rate limit", "too many requests", "429"];
        const SESSION: &[&str] = &["session not found", "session expired", "no conversation found"];
        const CONFIG: &[&str] = &["invalid model", "unknown model", "unknown option", "invalid flag"];
        const API: &[&str] = &["401", "403", "unauthorized", "authentication", "api error"];
        const TIMEOUT: &[&str] = &["killed", "signal", "timeout", "timed out"];

        if RATE_LIMIT.iter().any(|p| lower.contains(p)) {
            Self::RateLimit
        } else if SESSION.iter().any(|p| lower.contains(p)) {
            Self::SessionNotFound
        } else if CONFIG.iter().any(|p| lower.contains(p)) {
            Self::InvalidConfig
        } else if API.iter().any(|p| lower.contains(p)) {
            Self::ApiError
        } else if TIMEOUT.iter().any(|p| lower.contains(p)) {
            Self::Timeout
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from a backend subprocess run.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// Raw stderr captured from the subprocess, for diagnostics.
    pub stderr: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: String::new(),
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Build an error from a non-zero exit, classifying the stderr text.
    pub fn from_exit(exit_code: i32, stderr: &str) -> Self {
        let kind = BackendErrorKind::classify(stderr);
        let first_line = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let message = if first_line.is_empty() {
            format!("backend exited with code {exit_code}")
        } else {
            format!("backend exited with code {exit_code}: {}", first_line.trim())
        };
        Self {
            kind,
            message,
            stderr: stderr.to_string(),
        }
    }
}

/// Programmer errors from the runner. Expected task failures are reported
/// through `ExecutionResult`, never through this type.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("task {task_id} is already running")]
    AlreadyRunning { task_id: String },

    #[error("backend '{name}' is not available on this system")]
    BackendUnavailable { name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from epic plan parsing. Both are fatal for the epic flow.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner produced empty output")]
    EmptyOutput,

    #[error("no subtasks found in plan output")]
    NoSubtasks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_variants() {
        assert_eq!(
            BackendErrorKind::classify("Error: rate limit exceeded"),
            BackendErrorKind::RateLimit
        );
        assert_eq!(
            BackendErrorKind::classify("HTTP 429 Too Many Requests"),
            BackendErrorKind::RateLimit
        );
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            BackendErrorKind::classify("RATE LIMIT hit"),
            BackendErrorKind::RateLimit
        );
        assert_eq!(
            BackendErrorKind::classify("Session Not Found"),
            BackendErrorKind::SessionNotFound
        );
    }

    #[test]
    fn classify_auth_failures_as_api_error() {
        assert_eq!(
            BackendErrorKind::classify("401 unauthorized"),
            BackendErrorKind::ApiError
        );
        assert_eq!(
            BackendErrorKind::classify("authentication failed"),
            BackendErrorKind::ApiError
        );
    }

    #[test]
    fn classify_config_errors() {
        assert_eq!(
            BackendErrorKind::classify("error: invalid model 'gpt-9'"),
            BackendErrorKind::InvalidConfig
        );
        assert_eq!(
            BackendErrorKind::classify("error: unknown option '--effort'"),
            BackendErrorKind::InvalidConfig
        );
    }

    #[test]
    fn classify_kill_and_timeout() {
        assert_eq!(
            BackendErrorKind::classify("process killed by signal 9"),
            BackendErrorKind::Timeout
        );
        assert_eq!(
            BackendErrorKind::classify("operation timed out"),
            BackendErrorKind::Timeout
        );
    }

    #[test]
    fn classify_unknown_fallback() {
        assert_eq!(
            BackendErrorKind::classify("something else entirely"),
            BackendErrorKind::Unknown
        );
        assert_eq!(BackendErrorKind::classify(""), BackendErrorKind::Unknown);
    }

    #[test]
    fn rate_limit_wins_over_api_error() {
        // "429" and "API" both present; rate limit is checked first
        assert_eq!(
            BackendErrorKind::classify("API returned 429"),
            BackendErrorKind::RateLimit
        );
    }

    #[test]
    fn from_exit_carries_first_stderr_line() {
        let err = BackendError::from_exit(1, "\nrate limit exceeded\nmore detail\n");
        assert_eq!(err.kind, BackendErrorKind::RateLimit);
        assert!(err.message.contains("rate limit exceeded"));
        assert!(err.stderr.contains("more detail"));
    }

    #[test]
    fn from_exit_empty_stderr() {
        let err = BackendError::from_exit(137, "");
        assert_eq!(err.kind, BackendErrorKind::Unknown);
        assert!(err.message.contains("137"));
    }

    #[test]
    fn runner_error_display() {
        let err = RunnerError::AlreadyRunning {
            task_id: "GH-1".into(),
        };
        assert!(err.to_string().contains("GH-1"));
    }
}
