//! Task complexity classification.
//!
//! A deterministic heuristic pipeline assigns one of five complexity
//! levels to a task. Checks run in priority order: epic structure first,
//! then trivial / complex / simple pattern lists, then a word-count
//! fallback. An optional LLM overlay (`effort`) classifies an orthogonal
//! effort axis.

mod effort;
mod signals;

pub use effort::{EffortClassifier, EffortLevel};
pub use signals::{SignalMetrics, strip_code_and_paths};

use crate::task::Task;

/// Complexity level for a task. Exactly one per task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Medium,
    Complex,
    Epic,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Epic => "epic",
        }
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, Self::Trivial)
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, Self::Simple)
    }

    pub fn is_epic(&self) -> bool {
        matches!(self, Self::Epic)
    }

    /// Trivial and simple tasks skip the Navigator scaffold entirely.
    pub fn should_skip_navigator(&self) -> bool {
        matches!(self, Self::Trivial | Self::Simple)
    }

    /// Complex and epic tasks get a research pass before implementation.
    pub fn should_run_research(&self) -> bool {
        matches!(self, Self::Complex | Self::Epic)
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Literal substrings whose presence marks a task trivial.
const TRIVIAL_PATTERNS: &[&str] = &[
    "fix typo",
    "typo",
    "update readme",
    "bump version",
    "rename variable",
    "update comment",
    "fix formatting",
    "whitespace",
    "update copyright",
];

/// Literal substrings whose presence marks a task complex.
const COMPLEX_PATTERNS: &[&str] = &[
    "refactor",
    "architecture",
    "redesign",
    "rewrite",
    "migrate",
    "migration",
    "implement system",
    "new service",
    "integration",
    "optimize performance",
    "security audit",
    "breaking change",
];

/// Literal substrings whose presence marks a task simple.
const SIMPLE_PATTERNS: &[&str] = &[
    "add test",
    "add a test",
    "update doc",
    "small fix",
    "minor fix",
    "add logging",
    "add field",
    "update dependency",
];

/// Classify a task's complexity.
///
/// Deterministic: the same title and description always yield the same
/// result. Check order is epic, trivial, complex, simple, then a
/// word-count fallback (< 10 words simple, < 50 medium, else complex).
pub fn detect_complexity(task: &Task) -> Complexity {
    detect_from_text(&task.title, &task.description)
}

pub fn detect_from_text(title: &str, description: &str) -> Complexity {
    let metrics = SignalMetrics::from_text(title, description);
    if metrics.is_epic() {
        return Complexity::Epic;
    }

    let combined = format!("{title} {description}").to_lowercase();
    let prose = strip_code_and_paths(&combined);

    if TRIVIAL_PATTERNS.iter().any(|p| prose.contains(p)) {
        return Complexity::Trivial;
    }
    if COMPLEX_PATTERNS.iter().any(|p| prose.contains(p)) {
        return Complexity::Complex;
    }
    if SIMPLE_PATTERNS.iter().any(|p| prose.contains(p)) {
        return Complexity::Simple;
    }

    match metrics.word_count {
        0..10 => Complexity::Simple,
        10..50 => Complexity::Medium,
        _ => Complexity::Complex,
    }
}
