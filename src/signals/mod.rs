//! Structured progress signals emitted by agents.
//!
//! Agents communicate phase, progress, and exit decisions through fenced
//! `pilot-signal` blocks carrying JSON. Older agents emit plain-text
//! `Phase:` / `Progress:` lines instead; the parser handles both.

mod parser;

pub use parser::{TextStatus, extract_signals, parse_text_status};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What kind of signal the agent emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    #[default]
    Status,
    Exit,
    Phase,
    Stagnation,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Exit => "exit",
            Self::Phase => "phase",
            Self::Stagnation => "stagnation",
        }
    }
}

/// A validated v2 signal block.
///
/// All fields are optional on the wire; missing fields take defaults and
/// `progress` is clamped to 0..=100 during validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PilotSignal {
    #[serde(rename = "v", default = "default_version")]
    pub version: u32,
    #[serde(rename = "type", default)]
    pub kind: SignalKind,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub max_iterations: u64,
    #[serde(default)]
    pub indicators: HashMap<String, bool>,
    #[serde(default)]
    pub exit_signal: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

fn default_version() -> u32 {
    2
}

impl PilotSignal {
    /// Parse one JSON signal body, clamping out-of-range values.
    pub fn parse(json: &str) -> Option<Self> {
        let mut signal: PilotSignal = serde_json::from_str(json).ok()?;
        signal.progress = signal.progress.clamp(0, 100);
        if signal.version == 0 {
            signal.version = 2;
        }
        Some(signal)
    }

    /// Progress as a percent, guaranteed in range after `parse`.
    pub fn percent(&self) -> u8 {
        self.progress.clamp(0, 100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_signal_defaults() {
        let s = PilotSignal::parse("{}").unwrap();
        assert_eq!(s.version, 2);
        assert_eq!(s.kind, SignalKind::Status);
        assert_eq!(s.progress, 0);
        assert!(!s.exit_signal);
    }

    #[test]
    fn parse_full_signal() {
        let json = r#"{"v":2,"type":"status","phase":"IMPL","progress":50,"iteration":2,"exit_signal":false}"#;
        let s = PilotSignal::parse(json).unwrap();
        assert_eq!(s.kind, SignalKind::Status);
        assert_eq!(s.phase, "IMPL");
        assert_eq!(s.percent(), 50);
        assert_eq!(s.iteration, 2);
    }

    #[test]
    fn progress_is_clamped() {
        let s = PilotSignal::parse(r#"{"progress":250}"#).unwrap();
        assert_eq!(s.percent(), 100);
        let s = PilotSignal::parse(r#"{"progress":-10}"#).unwrap();
        assert_eq!(s.percent(), 0);
    }

    #[test]
    fn legacy_version_upgraded_silently() {
        let s = PilotSignal::parse(r#"{"v":1,"type":"exit"}"#).unwrap();
        assert_eq!(s.version, 1);
        assert_eq!(s.kind, SignalKind::Exit);
    }

    #[test]
    fn invalid_json_is_none() {
        assert!(PilotSignal::parse("not json").is_none());
        assert!(PilotSignal::parse(r#"{"type":"unheard-of"}"#).is_none());
    }

    #[test]
    fn roundtrip_preserves_in_range_signal() {
        let mut original = PilotSignal::default();
        original.version = 2;
        original.kind = SignalKind::Stagnation;
        original.phase = "VERIFY".to_string();
        original.progress = 73;
        original.iteration = 4;
        original.max_iterations = 10;
        original.exit_signal = true;
        original.success = true;
        original.reason = "done".to_string();
        original.indicators.insert("tests_pass".to_string(), true);

        let json = serde_json::to_string(&original).unwrap();
        let parsed = PilotSignal::parse(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
