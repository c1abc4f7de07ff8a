//! LLM-backed effort classification.
//!
//! A cheap model classifies the effort axis (orthogonal to complexity)
//! by running the backend CLI once per task. Results are cached per
//! task id; an empty answer means "use the static mapping".

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Effort override for a task: how hard the model should think.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
}

impl EffortLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for EffortLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "med" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => anyhow::bail!("unknown effort level: {other}"),
        }
    }
}

impl std::fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies task effort by asking a small model.
pub struct EffortClassifier {
    binary: String,
    model: String,
    project_path: PathBuf,
    cache: Mutex<HashMap<String, Option<EffortLevel>>>,
}

impl EffortClassifier {
    pub fn new(binary: impl Into<String>, model: impl Into<String>, project_path: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            project_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Classify effort for a task. Returns `None` when the model answer is
    /// empty or unparseable, meaning the static complexity mapping applies.
    pub async fn classify(&self, task_id: &str, title: &str, description: &str) -> Option<EffortLevel> {
        if let Some(cached) = self.cache.lock().expect("effort cache lock").get(task_id) {
            return *cached;
        }

        let level = match self.ask_model(title, description).await {
            Ok(answer) => Self::parse_answer(&answer),
            Err(e) => {
                debug!(task_id, error = %e, "effort classification failed, using static mapping");
                None
            }
        };

        self.cache
            .lock()
            .expect("effort cache lock")
            .insert(task_id.to_string(), level);
        level
    }

    async fn ask_model(&self, title: &str, description: &str) -> Result<String> {
        let prompt = format!(
            "Classify the effort needed for this coding task as exactly one \
             word: low, medium, or high. Respond with only that word.\n\n\
             Title: {title}\nDescription: {description}"
        );

        let output = Command::new(&self.binary)
            .args(["--print", "--model", &self.model, "-p", &prompt])
            .current_dir(&self.project_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .context("failed to run effort classifier subprocess")?;

        if !output.status.success() {
            anyhow::bail!(
                "effort classifier exited with {}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_answer(answer: &str) -> Option<EffortLevel> {
        let first = answer.split_whitespace().next()?;
        first
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .parse()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_level_from_str() {
        assert_eq!("low".parse::<EffortLevel>().unwrap(), EffortLevel::Low);
        assert_eq!("HIGH".parse::<EffortLevel>().unwrap(), EffortLevel::High);
        assert_eq!(" medium ".parse::<EffortLevel>().unwrap(), EffortLevel::Medium);
        assert!("extreme".parse::<EffortLevel>().is_err());
    }

    #[test]
    fn parse_answer_takes_first_word() {
        assert_eq!(
            EffortClassifier::parse_answer("high\nBecause it spans modules"),
            Some(EffortLevel::High)
        );
        assert_eq!(
            EffortClassifier::parse_answer("  Low.  "),
            Some(EffortLevel::Low)
        );
    }

    #[test]
    fn parse_answer_empty_means_static_mapping() {
        assert_eq!(EffortClassifier::parse_answer(""), None);
        assert_eq!(EffortClassifier::parse_answer("   \n"), None);
        assert_eq!(EffortClassifier::parse_answer("unsure"), None);
    }
}
