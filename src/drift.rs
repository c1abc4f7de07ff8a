//! Drift detection over user corrections.
//!
//! When users repeatedly correct the agent inside a time window, the
//! session has drifted from its anchor. The detector counts corrections
//! per pattern and produces a re-anchor prompt once the threshold trips.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::learning::LearningStore;

/// Classification of a drift indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    RepeatedCorrection,
    ContextConfusion,
    QualityDrop,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedCorrection => "repeated_correction",
            Self::ContextConfusion => "context_confusion",
            Self::QualityDrop => "quality_drop",
        }
    }
}

/// One tracked indicator, keyed by pattern.
#[derive(Debug, Clone)]
pub struct DriftIndicator {
    pub kind: DriftKind,
    pub count: usize,
    pub last_seen: Instant,
    pub pattern: String,
    pub correction: String,
}

const DEFAULT_TEMPLATE: &str = "The session has drifted. Re-anchor on the original task.\n\
                                Recent corrections:\n{corrections}\n\
                                Apply these corrections going forward and re-read the task statement.";

const FALLBACK_PROMPT: &str = "The session has drifted from its anchor. Re-read the original \
                               task statement and the recent user corrections before continuing.";

/// Counts corrections in a sliding window and renders re-anchor prompts.
pub struct DriftDetector {
    window: Duration,
    threshold: usize,
    template: String,
    indicators: Mutex<Vec<DriftIndicator>>,
    learning: Option<Arc<dyn LearningStore>>,
}

impl DriftDetector {
    pub fn new() -> Self {
        Self {
            window: Duration::from_secs(3600),
            threshold: 3,
            template: DEFAULT_TEMPLATE.to_string(),
            indicators: Mutex::new(Vec::new()),
            learning: None,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_learning(mut self, learning: Arc<dyn LearningStore>) -> Self {
        self.learning = Some(learning);
        self
    }

    /// Record a correction, upserting the indicator for its pattern.
    ///
    /// Synchronous so the stream processor can call it inline;
    /// persistence to the learning store is best-effort and runs off
    /// the hot path.
    pub fn record_correction(&self, kind: DriftKind, pattern: &str, correction: &str) {
        {
            let mut indicators = self.indicators.lock().expect("drift indicators lock");
            if let Some(existing) = indicators.iter_mut().find(|i| i.pattern == pattern) {
                existing.count += 1;
                existing.last_seen = Instant::now();
                existing.correction = correction.to_string();
                existing.kind = kind;
            } else {
                indicators.push(DriftIndicator {
                    kind,
                    count: 1,
                    last_seen: Instant::now(),
                    pattern: pattern.to_string(),
                    correction: correction.to_string(),
                });
            }
        }

        if let Some(learning) = &self.learning {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let learning = Arc::clone(learning);
                let pattern = pattern.to_string();
                let correction = correction.to_string();
                handle.spawn(async move {
                    if let Err(e) = learning.record_correction(&pattern, &correction).await {
                        warn!(error = %e, "failed to persist correction");
                    }
                });
            }
        }
    }

    fn recent_counts(&self) -> usize {
        let cutoff = Instant::now().checked_sub(self.window);
        self.indicators
            .lock()
            .expect("drift indicators lock")
            .iter()
            .filter(|i| cutoff.is_none_or(|c| i.last_seen >= c))
            .map(|i| i.count)
            .sum()
    }

    /// Whether accumulated recent corrections warrant a re-anchor.
    pub fn should_reanchor(&self) -> bool {
        self.recent_counts() >= self.threshold
    }

    /// Render the re-anchor prompt listing recent corrections. A template
    /// missing its placeholder falls back to a fixed prompt.
    pub fn reanchor_prompt(&self) -> String {
        let cutoff = Instant::now().checked_sub(self.window);
        let listing: String = self
            .indicators
            .lock()
            .expect("drift indicators lock")
            .iter()
            .filter(|i| cutoff.is_none_or(|c| i.last_seen >= c))
            .map(|i| {
                format!(
                    "- [{}] {} -> {} (seen {}x)\n",
                    i.kind.as_str(),
                    i.pattern,
                    i.correction,
                    i.count
                )
            })
            .collect();

        if !self.template.contains("{corrections}") {
            return FALLBACK_PROMPT.to_string();
        }
        self.template.replace("{corrections}", listing.trim_end())
    }

    /// Clear all indicators after a successful re-anchor.
    pub fn reset(&self) {
        self.indicators
            .lock()
            .expect("drift indicators lock")
            .clear();
    }
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new()
    }
}
