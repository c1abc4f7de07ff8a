//! Extraction of signals from agent text output.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::PilotSignal;

static SIGNAL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```pilot-signal\s*\n(.*?)```").expect("valid regex")
});

static PHASE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Phase:\s*(\S[^\n]*?)\s*$").expect("valid regex"));

static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Progress:\s*(\d{1,3})\s*%?").expect("valid regex"));

/// Pull all v2 signal blocks out of a text chunk. Invalid JSON bodies are
/// logged and skipped; the rest of the text is unaffected.
pub fn extract_signals(text: &str) -> Vec<PilotSignal> {
    SIGNAL_BLOCK
        .captures_iter(text)
        .filter_map(|cap| {
            let body = cap.get(1).map(|m| m.as_str().trim())?;
            match PilotSignal::parse(body) {
                Some(signal) => Some(signal),
                None => {
                    debug!(body, "skipping unparseable pilot-signal block");
                    None
                }
            }
        })
        .collect()
}

/// Plain-text status parsed from `Phase:` / `Progress:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextStatus {
    pub phase: Option<String>,
    pub progress: Option<u8>,
}

/// Scan a text block for Navigator-style status lines. Returns `None`
/// when neither line is present.
pub fn parse_text_status(text: &str) -> Option<TextStatus> {
    let phase = PHASE_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let progress = PROGRESS_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|p| p.min(100) as u8);

    if phase.is_none() && progress.is_none() {
        return None;
    }
    Some(TextStatus { phase, progress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalKind;

    #[test]
    fn extracts_single_signal_block() {
        let text = "Working on it.\n```pilot-signal\n{\"v\":2,\"type\":\"status\",\"phase\":\"IMPL\",\"progress\":50}\n```\nMore text.";
        let signals = extract_signals(text);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].phase, "IMPL");
        assert_eq!(signals[0].percent(), 50);
    }

    #[test]
    fn extracts_multiple_blocks_in_order() {
        let text = "```pilot-signal\n{\"progress\":10}\n```\nmid\n```pilot-signal\n{\"progress\":60}\n```";
        let signals = extract_signals(text);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].percent(), 10);
        assert_eq!(signals[1].percent(), 60);
    }

    #[test]
    fn skips_invalid_block_keeps_valid() {
        let text = "```pilot-signal\nnot json\n```\n```pilot-signal\n{\"type\":\"exit\",\"exit_signal\":true}\n```";
        let signals = extract_signals(text);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Exit);
        assert!(signals[0].exit_signal);
    }

    #[test]
    fn plain_fence_is_not_a_signal() {
        let text = "```json\n{\"progress\":50}\n```";
        assert!(extract_signals(text).is_empty());
    }

    #[test]
    fn text_status_both_lines() {
        let text = "Status update\nPhase: Implementation\nProgress: 45%\n";
        let status = parse_text_status(text).unwrap();
        assert_eq!(status.phase.as_deref(), Some("Implementation"));
        assert_eq!(status.progress, Some(45));
    }

    #[test]
    fn text_status_progress_only() {
        let status = parse_text_status("Progress: 80\n").unwrap();
        assert_eq!(status.phase, None);
        assert_eq!(status.progress, Some(80));
    }

    #[test]
    fn text_status_clamps_over_100() {
        let status = parse_text_status("Progress: 250%\n").unwrap();
        assert_eq!(status.progress, Some(100));
    }

    #[test]
    fn text_status_absent() {
        assert!(parse_text_status("just prose, no status lines").is_none());
    }
}
