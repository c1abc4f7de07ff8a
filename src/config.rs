//! Runtime configuration.
//!
//! Settings come from `pilot.toml` (project root or `.pilot/pilot.toml`),
//! falling back to a user-level file under the platform config directory,
//! falling back to defaults. CLI flags override file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryConfig;
use crate::routing::RoutingConfig;
use crate::stagnation::StagnationConfig;

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// Backend to drive: "claude" or "qwen".
    pub backend: String,
    /// Pass the permission-skipping flag to the backend CLI.
    pub skip_permissions: bool,
    /// Run each task in an isolated worktree.
    pub worktrees_enabled: bool,
    /// Heartbeat timeout, e.g. "2m".
    pub heartbeat_timeout: String,
    /// Bootstrap the `.agent/` scaffold when absent.
    pub navigator_auto_init: bool,
    /// Model for the epic planning subprocess; empty uses the backend default.
    pub planning_model: String,
    /// Model for the effort classifier; empty disables the classifier.
    pub effort_model: String,
    /// Shell commands run as quality gates after the agent finishes.
    pub quality_gates: Vec<String>,
    /// Decompose complex (non-epic) tasks into subtasks before running.
    pub decompose_complex: bool,
    pub routing: RoutingConfig,
    pub stagnation: StagnationConfig,
    pub retry: RetryConfig,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            backend: "claude".to_string(),
            skip_permissions: true,
            worktrees_enabled: true,
            heartbeat_timeout: "2m".to_string(),
            navigator_auto_init: true,
            planning_model: String::new(),
            effort_model: String::new(),
            quality_gates: Vec::new(),
            decompose_complex: false,
            routing: RoutingConfig::default(),
            stagnation: StagnationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl PilotConfig {
    /// Load configuration for a project, merging the first file found.
    pub fn load(project_dir: &Path) -> Result<Self> {
        for candidate in Self::candidates(project_dir) {
            if candidate.exists() {
                debug!(path = %candidate.display(), "loading config");
                let content = std::fs::read_to_string(&candidate)
                    .with_context(|| format!("reading {}", candidate.display()))?;
                let config: PilotConfig = toml::from_str(&content)
                    .with_context(|| format!("parsing {}", candidate.display()))?;
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    fn candidates(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![
            project_dir.join(".pilot").join("pilot.toml"),
            project_dir.join("pilot.toml"),
        ];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("pilot").join("pilot.toml"));
        }
        paths
    }

    pub fn heartbeat(&self) -> std::time::Duration {
        crate::routing::parse_duration(&self.heartbeat_timeout)
            .unwrap_or(std::time::Duration::from_secs(120))
    }

    /// Render the default configuration as commented TOML for `config init`.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).expect("default config serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = PilotConfig::default();
        assert_eq!(config.backend, "claude");
        assert!(config.worktrees_enabled);
        assert!(!config.retry.enabled);
        assert_eq!(config.heartbeat(), std::time::Duration::from_secs(120));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = PilotConfig::load(dir.path()).unwrap();
        assert_eq!(config.backend, "claude");
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("pilot.toml"),
            "backend = \"qwen\"\nworktrees_enabled = false\n",
        )
        .unwrap();
        let config = PilotConfig::load(dir.path()).unwrap();
        assert_eq!(config.backend, "qwen");
        assert!(!config.worktrees_enabled);
        // unspecified fields keep defaults
        assert!(config.navigator_auto_init);
    }

    #[test]
    fn dot_pilot_file_takes_precedence() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".pilot")).unwrap();
        fs::write(dir.path().join(".pilot/pilot.toml"), "backend = \"qwen\"\n").unwrap();
        fs::write(dir.path().join("pilot.toml"), "backend = \"claude\"\n").unwrap();
        let config = PilotConfig::load(dir.path()).unwrap();
        assert_eq!(config.backend, "qwen");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pilot.toml"), "backend = [broken").unwrap();
        assert!(PilotConfig::load(dir.path()).is_err());
    }

    #[test]
    fn nested_sections_parse() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("pilot.toml"),
            "[stagnation]\nwarn_after_identical = 7\n\n[routing]\nenabled = false\n",
        )
        .unwrap();
        let config = PilotConfig::load(dir.path()).unwrap();
        assert_eq!(config.stagnation.warn_after_identical, 7);
        assert!(!config.routing.enabled);
        // untouched nested defaults survive
        assert_eq!(config.stagnation.pause_after_identical, 5);
    }

    #[test]
    fn default_toml_round_trips() {
        let rendered = PilotConfig::default_toml();
        let parsed: PilotConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.backend, "claude");
    }
}
