//! Per-run progress state and phase heuristics.
//!
//! Progress reaches the runner from three sources: tool-use heuristics,
//! Navigator plain-text status lines, and v2 pilot-signal blocks. This
//! module normalizes them into a monotone per-task percentage and phase.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// One progress tick delivered to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub phase: String,
    pub percent: u8,
    pub message: String,
}

/// Mutable state for one task run. Touched only by that task's stream
/// processor; the runner clamps centrally before fan-out.
#[derive(Debug, Default)]
pub struct ProgressState {
    pub phase: String,
    /// Monotone high-water mark.
    pub percent: u8,
    pub iteration: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub model: Option<String>,
    pub navigator_phase: Option<String>,
    pub exit_signal: bool,
    pub commit_sha: Option<String>,
    /// Most recent assistant prose, kept so a failed run can still
    /// report its last meaningful output.
    pub last_text: String,
    pub terminal_emitted: bool,
}

impl ProgressState {
    /// Clamp a proposed percentage against the high-water mark. The
    /// terminal value 100 is always accepted.
    pub fn advance(&mut self, proposed: u8) -> u8 {
        let accepted = if proposed >= 100 {
            100
        } else {
            proposed.max(self.percent)
        };
        self.percent = accepted;
        accepted
    }

    /// Record a phase change. Returns true when the phase actually
    /// transitioned (repeats within a phase stay silent).
    pub fn enter_phase(&mut self, phase: &str) -> bool {
        if self.phase == phase {
            return false;
        }
        self.phase = phase.to_string();
        true
    }
}

/// Map a tool use onto an implied execution phase and floor percentage.
/// `None` means the tool carries no phase information.
pub fn phase_for_tool(name: &str, input: &Value) -> Option<(&'static str, u8)> {
    match name {
        "Read" | "Glob" | "WebFetch" | "WebSearch" => Some(("Research", 15)),
        "Grep" => Some(("Research", 20)),
        "Write" | "Edit" | "NotebookEdit" => Some(("Implement", 40)),
        "Bash" => {
            let command = input.get("command").and_then(|c| c.as_str()).unwrap_or("");
            if is_commit_command(command) {
                Some(("Finalizing", 85))
            } else if is_test_command(command) {
                Some(("Verify", 70))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_test_command(command: &str) -> bool {
    const MARKERS: &[&str] = &[
        "cargo test",
        "go test",
        "pytest",
        "npm test",
        "npm run test",
        "yarn test",
        "make test",
        "mvn test",
    ];
    MARKERS.iter().any(|m| command.contains(m))
}

fn is_commit_command(command: &str) -> bool {
    command.contains("git commit") || command.contains("git push")
}

static COMMIT_SHA_BRACKET: LazyLock<Regex> = LazyLock::new(|| {
    // "[branch-name 1a2b3c4] message" as printed by git commit
    Regex::new(r"\[[^\s\]]+ ([0-9a-f]{7,40})\]").expect("valid regex")
});

static COMMIT_SHA_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{40}\b").expect("valid regex"));

/// Harvest a commit SHA from tool output, if one is visible.
pub fn harvest_commit_sha(output: &str) -> Option<String> {
    if let Some(cap) = COMMIT_SHA_BRACKET.captures(output) {
        return cap.get(1).map(|m| m.as_str().to_string());
    }
    COMMIT_SHA_FULL
        .find(output)
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn advance_is_monotone_until_terminal() {
        let mut state = ProgressState::default();
        let ticks = [10u8, 40, 25, 50, 100];
        let seen: Vec<u8> = ticks.iter().map(|t| state.advance(*t)).collect();
        assert_eq!(seen, vec![10, 40, 40, 50, 100]);
    }

    #[test]
    fn advance_terminal_always_accepted() {
        let mut state = ProgressState::default();
        state.advance(95);
        assert_eq!(state.advance(100), 100);
    }

    #[test]
    fn advance_zero_after_progress_is_clamped() {
        // stagnation signals carry progress 0; the clamp holds the mark
        let mut state = ProgressState::default();
        state.advance(60);
        assert_eq!(state.advance(0), 60);
    }

    #[test]
    fn enter_phase_only_fires_on_transition() {
        let mut state = ProgressState::default();
        assert!(state.enter_phase("Research"));
        assert!(!state.enter_phase("Research"));
        assert!(state.enter_phase("Implement"));
    }

    #[test]
    fn research_tools_imply_research_phase() {
        assert_eq!(phase_for_tool("Read", &json!({})), Some(("Research", 15)));
        assert_eq!(phase_for_tool("Grep", &json!({})), Some(("Research", 20)));
        assert_eq!(phase_for_tool("Glob", &json!({})), Some(("Research", 15)));
    }

    #[test]
    fn write_tools_imply_implement_phase() {
        assert_eq!(phase_for_tool("Write", &json!({})), Some(("Implement", 40)));
        assert_eq!(phase_for_tool("Edit", &json!({})), Some(("Implement", 40)));
    }

    #[test]
    fn bash_phase_depends_on_command() {
        assert_eq!(
            phase_for_tool("Bash", &json!({"command": "cargo test --all"})),
            Some(("Verify", 70))
        );
        assert_eq!(
            phase_for_tool("Bash", &json!({"command": "git commit -m 'done'"})),
            Some(("Finalizing", 85))
        );
        assert_eq!(phase_for_tool("Bash", &json!({"command": "ls -la"})), None);
    }

    #[test]
    fn unknown_tools_carry_no_phase() {
        assert_eq!(phase_for_tool("TodoWrite", &json!({})), None);
        assert_eq!(phase_for_tool("mcp__github__create_issue", &json!({})), None);
    }

    #[test]
    fn harvest_sha_from_git_commit_output() {
        let out = "[pilot/GH-1 3f2a9bc] Fix the widget\n 2 files changed";
        assert_eq!(harvest_commit_sha(out), Some("3f2a9bc".to_string()));
    }

    #[test]
    fn harvest_sha_full_length() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let out = format!("HEAD is now at {sha}");
        assert_eq!(harvest_commit_sha(&out), Some(sha.to_string()));
    }

    #[test]
    fn harvest_sha_absent() {
        assert_eq!(harvest_commit_sha("nothing here"), None);
        // short hex words in prose should not match the bracket pattern
        assert_eq!(harvest_commit_sha("value is abc but not a sha"), None);
    }
}
