//! Complexity → model and timeout routing.
//!
//! Pure mapping from a task's complexity to the model name passed to the
//! backend and the watchdog timeout for the run. Configured durations are
//! strings like "30m"; parse failures fall back to the built-in default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::complexity::Complexity;

/// One routing entry: model name and timeout string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub model: String,
    pub timeout: String,
}

/// Configured routing table. Absent entries use defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub trivial: RouteEntry,
    pub simple: RouteEntry,
    pub medium: RouteEntry,
    pub complex: RouteEntry,
    pub epic: RouteEntry,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let entry = |model: &str, timeout: &str| RouteEntry {
            model: model.to_string(),
            timeout: timeout.to_string(),
        };
        Self {
            enabled: true,
            trivial: entry("haiku", "10m"),
            simple: entry("sonnet", "15m"),
            medium: entry("sonnet", "30m"),
            complex: entry("opus", "60m"),
            epic: entry("opus", "90m"),
        }
    }
}

/// Resolved route for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` when routing is disabled; the backend default applies.
    pub model: Option<String>,
    pub timeout: Duration,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Parse a duration string of the form "90s", "30m", "2h", or a bare
/// number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => s.split_at(i),
        None => (s, "s"),
    };
    let value: u64 = num.parse().ok()?;
    match unit.trim() {
        "s" | "sec" | "secs" => Some(Duration::from_secs(value)),
        "m" | "min" | "mins" => Some(Duration::from_secs(value * 60)),
        "h" | "hr" | "hrs" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

pub struct ModelRouter {
    config: RoutingConfig,
}

impl ModelRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn route(&self, complexity: Complexity) -> Route {
        let entry = match complexity {
            Complexity::Trivial => &self.config.trivial,
            Complexity::Simple => &self.config.simple,
            Complexity::Medium => &self.config.medium,
            Complexity::Complex => &self.config.complex,
            Complexity::Epic => &self.config.epic,
        };

        let timeout = parse_duration(&entry.timeout).unwrap_or_else(|| {
            warn!(
                complexity = %complexity,
                configured = %entry.timeout,
                "unparseable timeout, using default"
            );
            DEFAULT_TIMEOUT
        });

        let model = if self.config.enabled && !entry.model.is_empty() {
            Some(entry.model.clone())
        } else {
            None
        };

        Route { model, timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10 fortnights"), None);
    }

    #[test]
    fn default_routes_by_complexity() {
        let router = ModelRouter::new(RoutingConfig::default());
        let r = router.route(Complexity::Trivial);
        assert_eq!(r.model.as_deref(), Some("haiku"));
        assert_eq!(r.timeout, Duration::from_secs(600));

        let r = router.route(Complexity::Epic);
        assert_eq!(r.model.as_deref(), Some("opus"));
        assert_eq!(r.timeout, Duration::from_secs(90 * 60));
    }

    #[test]
    fn disabled_routing_returns_no_model() {
        let config = RoutingConfig {
            enabled: false,
            ..Default::default()
        };
        let router = ModelRouter::new(config);
        let r = router.route(Complexity::Medium);
        assert_eq!(r.model, None);
        // timeout still applies even without a model override
        assert_eq!(r.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn bad_timeout_string_falls_back_to_default() {
        let mut config = RoutingConfig::default();
        config.medium.timeout = "whenever".to_string();
        let router = ModelRouter::new(config);
        let r = router.route(Complexity::Medium);
        assert_eq!(r.timeout, DEFAULT_TIMEOUT);
    }
}
