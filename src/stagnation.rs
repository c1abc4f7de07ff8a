//! Stagnation detection: loops and silence.
//!
//! Two failure shapes are watched. A *loop* is the same state hash
//! repeating at the tail of the history ring. *Silence* is no state
//! change for longer than the configured windows. Both escalate through
//! warn → pause → abort.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Thresholds for the monitor. Durations are strings ("10m") so the
/// config file stays readable; see [`crate::routing::parse_duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagnationConfig {
    pub warn_after_identical: usize,
    pub pause_after_identical: usize,
    pub warn_after_no_progress: String,
    pub pause_after_no_progress: String,
    pub abort_after_no_progress: String,
    pub max_iterations: u64,
    pub history_size: usize,
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            warn_after_identical: 3,
            pause_after_identical: 5,
            warn_after_no_progress: "10m".to_string(),
            pause_after_no_progress: "20m".to_string(),
            abort_after_no_progress: "30m".to_string(),
            max_iterations: 10,
            history_size: 20,
        }
    }
}

impl StagnationConfig {
    fn window(&self, s: &str, default_secs: u64) -> Duration {
        crate::routing::parse_duration(s).unwrap_or(Duration::from_secs(default_secs))
    }

    pub fn warn_window(&self) -> Duration {
        self.window(&self.warn_after_no_progress, 600)
    }

    pub fn pause_window(&self) -> Duration {
        self.window(&self.pause_after_no_progress, 1200)
    }

    pub fn abort_window(&self) -> Duration {
        self.window(&self.abort_after_no_progress, 1800)
    }
}

/// Escalation level, ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum StagnationLevel {
    #[default]
    None,
    Warn,
    Pause,
    Abort,
}

impl StagnationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warn => "warn",
            Self::Pause => "pause",
            Self::Abort => "abort",
        }
    }
}

struct MonitorState {
    hashes: VecDeque<u64>,
    last_progress_at: Instant,
    last_phase: String,
    last_progress: u8,
    last_iteration: u64,
    current_level: StagnationLevel,
    seen_any: bool,
}

/// Tracks per-run state hashes and progress timing.
///
/// Thread-safe; `record` may be called from the stream processor while
/// queries come from elsewhere.
pub struct StagnationMonitor {
    config: StagnationConfig,
    state: Mutex<MonitorState>,
}

/// 64-bit digest of the observable run state.
fn state_hash(phase: &str, progress: u8, iteration: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(phase.as_bytes());
    hasher.update([progress]);
    hasher.update(iteration.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

impl StagnationMonitor {
    pub fn new(config: StagnationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                hashes: VecDeque::new(),
                last_progress_at: Instant::now(),
                last_phase: String::new(),
                last_progress: 0,
                last_iteration: 0,
                current_level: StagnationLevel::None,
                seen_any: false,
            }),
        }
    }

    /// Record one observed state and return the current escalation level.
    pub fn record(&self, phase: &str, progress: u8, iteration: u64) -> StagnationLevel {
        let now = Instant::now();
        let mut state = self.state.lock().expect("stagnation state lock");

        let advanced = !state.seen_any
            || phase != state.last_phase
            || progress > state.last_progress
            || iteration > state.last_iteration;
        if advanced {
            state.last_progress_at = now;
        }
        state.seen_any = true;
        state.last_phase = phase.to_string();
        state.last_progress = progress;
        state.last_iteration = iteration;

        let hash = state_hash(phase, progress, iteration);
        state.hashes.push_back(hash);
        while state.hashes.len() > self.config.history_size {
            state.hashes.pop_front();
        }

        let identical = state
            .hashes
            .iter()
            .rev()
            .take_while(|h| **h == hash)
            .count();
        let silent_for = now.duration_since(state.last_progress_at);

        let level = if silent_for >= self.config.abort_window()
            || iteration >= self.config.max_iterations
        {
            StagnationLevel::Abort
        } else if identical >= self.config.pause_after_identical
            || silent_for >= self.config.pause_window()
        {
            StagnationLevel::Pause
        } else if identical >= self.config.warn_after_identical
            || silent_for >= self.config.warn_window()
        {
            StagnationLevel::Warn
        } else {
            StagnationLevel::None
        };

        if level != state.current_level {
            match level {
                StagnationLevel::None => {
                    info!(phase, progress, iteration, "stagnation cleared")
                }
                StagnationLevel::Warn => warn!(
                    phase,
                    progress, iteration, identical, "possible stagnation"
                ),
                StagnationLevel::Pause | StagnationLevel::Abort => warn!(
                    phase,
                    progress,
                    iteration,
                    identical,
                    level = level.as_str(),
                    "stagnation escalated"
                ),
            }
            state.current_level = level;
        }

        level
    }

    pub fn current_level(&self) -> StagnationLevel {
        self.state.lock().expect("stagnation state lock").current_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_ladder_on_identical_states() {
        let monitor = StagnationMonitor::new(StagnationConfig::default());
        let levels: Vec<StagnationLevel> =
            (0..5).map(|_| monitor.record("IMPL", 50, 3)).collect();
        assert_eq!(
            levels,
            vec![
                StagnationLevel::None,
                StagnationLevel::None,
                StagnationLevel::Warn,
                StagnationLevel::Warn,
                StagnationLevel::Pause,
            ]
        );
    }

    #[test]
    fn progress_resets_identical_run() {
        let monitor = StagnationMonitor::new(StagnationConfig::default());
        monitor.record("IMPL", 50, 3);
        monitor.record("IMPL", 50, 3);
        // progress increase breaks the identical tail
        assert_eq!(monitor.record("IMPL", 51, 3), StagnationLevel::None);
        assert_eq!(monitor.record("IMPL", 51, 3), StagnationLevel::None);
    }

    #[test]
    fn phase_change_counts_as_progress() {
        let monitor = StagnationMonitor::new(StagnationConfig::default());
        monitor.record("IMPL", 50, 3);
        monitor.record("IMPL", 50, 3);
        assert_eq!(monitor.record("VERIFY", 50, 3), StagnationLevel::None);
    }

    #[test]
    fn iteration_cap_aborts() {
        let monitor = StagnationMonitor::new(StagnationConfig::default());
        assert_eq!(monitor.record("IMPL", 10, 10), StagnationLevel::Abort);
    }

    #[test]
    fn pause_threshold_implies_at_least_pause() {
        let config = StagnationConfig::default();
        let monitor = StagnationMonitor::new(config.clone());
        for _ in 0..config.pause_after_identical {
            monitor.record("X", 1, 1);
        }
        assert!(monitor.current_level() >= StagnationLevel::Pause);
    }

    #[test]
    fn ring_is_bounded() {
        let config = StagnationConfig {
            history_size: 4,
            pause_after_identical: 100,
            warn_after_identical: 100,
            ..Default::default()
        };
        let monitor = StagnationMonitor::new(config);
        for i in 0..20u8 {
            monitor.record("IMPL", i, 1);
        }
        let state = monitor.state.lock().unwrap();
        assert_eq!(state.hashes.len(), 4);
    }

    #[test]
    fn state_hash_distinguishes_fields() {
        let a = state_hash("IMPL", 50, 3);
        assert_ne!(a, state_hash("IMPL", 51, 3));
        assert_ne!(a, state_hash("VERIFY", 50, 3));
        assert_ne!(a, state_hash("IMPL", 50, 4));
        assert_eq!(a, state_hash("IMPL", 50, 3));
    }

    #[test]
    fn silence_windows_parse_from_config() {
        let config = StagnationConfig::default();
        assert_eq!(config.warn_window(), Duration::from_secs(600));
        assert_eq!(config.pause_window(), Duration::from_secs(1200));
        assert_eq!(config.abort_window(), Duration::from_secs(1800));
    }
}
