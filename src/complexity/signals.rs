//! Structural signal extraction for epic detection.
//!
//! Epic tasks announce themselves through structure: checkbox inventories,
//! numbered phases, sheer length. `SignalMetrics` counts those signals so
//! the classifier can decide without an LLM call.

use std::sync::LazyLock;

use regex::Regex;

static EPIC_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(epic|roadmap|multi-phase|milestone)\b").expect("valid regex")
});

static CHECKBOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s*\[[ xX]\]").expect("valid regex"));

static PHASE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:#{1,6}\s*)?(?:phase|stage|step)\s+\d+\b").expect("valid regex")
});

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?(```|$)").expect("valid regex"));

/// Tokens that look like file paths: contain a separator, or end in a short
/// extension. These are stripped before keyword scans so that a title
/// mentioning `epic.go` does not classify as an epic.
static PATH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S*[/\\]\S*|\b\w[\w.-]*\.\w{1,5}\b").expect("valid regex"));

/// Remove code fences and file-path tokens so keyword matching only sees
/// prose.
pub fn strip_code_and_paths(text: &str) -> String {
    let no_fences = CODE_FENCE.replace_all(text, " ");
    PATH_TOKEN.replace_all(&no_fences, " ").into_owned()
}

/// Structural metrics derived from a task's title and description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMetrics {
    pub has_epic_tag: bool,
    pub has_epic_keyword: bool,
    pub checkbox_count: usize,
    pub phase_count: usize,
    pub word_count: usize,
    pub has_structural_markers: bool,
}

impl SignalMetrics {
    /// Compute metrics from raw title and description.
    ///
    /// Checkboxes, phases, and word counts come from the raw text; the
    /// epic keyword scan runs on prose only (code fences and path tokens
    /// stripped).
    pub fn from_text(title: &str, description: &str) -> Self {
        let combined = format!("{title}\n{description}");
        let lower = combined.to_lowercase();
        let prose = strip_code_and_paths(&combined);

        let has_epic_tag = lower.contains("[epic]");
        let has_epic_keyword = EPIC_KEYWORD.is_match(&prose);
        let checkbox_count = CHECKBOX.find_iter(&combined).count();
        let phase_count = PHASE_HEADING.find_iter(&combined).count();
        let word_count = combined.split_whitespace().count();
        let has_structural_markers = lower.contains("##")
            || lower.contains("phase")
            || lower.contains("stage")
            || lower.contains("step");

        Self {
            has_epic_tag,
            has_epic_keyword,
            checkbox_count,
            phase_count,
            word_count,
            has_structural_markers,
        }
    }

    /// Epic when: tag present, keyword present, >= 5 checkboxes, >= 3
    /// numbered phases, or a long body with structural markers.
    pub fn is_epic(&self) -> bool {
        self.has_epic_tag
            || self.has_epic_keyword
            || self.checkbox_count >= 5
            || self.phase_count >= 3
            || (self.word_count > 200 && self.has_structural_markers)
    }
}
