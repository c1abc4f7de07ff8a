//! Hosting provider operations via the `gh` CLI.
//!
//! The engine never speaks the hosting REST API directly; pull requests
//! and issues are opened by shelling out, and URLs are scraped from the
//! tool's output.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

/// A created (or pre-existing) pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub url: String,
}

/// A created hosting issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub url: String,
}

/// Wrapper around a `gh`-compatible hosting CLI, anchored to one checkout.
#[derive(Debug, Clone)]
pub struct HostingCli {
    binary: String,
    project_path: PathBuf,
}

impl HostingCli {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: "gh".to_string(),
            project_path: project_path.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn at(&self, project_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: self.binary.clone(),
            project_path: project_path.into(),
        }
    }

    /// Open a pull request. When the hosting tool reports that a PR
    /// already exists for this branch, the existing URL is extracted and
    /// returned instead of an error.
    pub async fn create_pr(&self, title: &str, body: &str, base: &str) -> Result<PullRequest> {
        let output = Command::new(&self.binary)
            .args(["pr", "create", "--title", title, "--body", body, "--base", base])
            .current_dir(&self.project_path)
            .output()
            .await
            .context("failed to run hosting CLI for pr create")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            let url = extract_pr_url(&stdout)
                .or_else(|| extract_pr_url(&stderr))
                .context("pr created but no URL found in output")?;
            return Ok(PullRequest { url });
        }

        if stderr.to_lowercase().contains("already exists") {
            debug!("pull request already exists, extracting URL");
            if let Some(url) = extract_pr_url(&stderr).or_else(|| extract_pr_url(&stdout)) {
                return Ok(PullRequest { url });
            }
            bail!("pull request already exists but no URL could be extracted");
        }

        bail!("pr create failed: {}", stderr.trim());
    }

    /// Open a hosting issue and return its number and URL.
    pub async fn create_issue(&self, title: &str, body: &str) -> Result<Issue> {
        let output = Command::new(&self.binary)
            .args(["issue", "create", "--title", title, "--body", body])
            .current_dir(&self.project_path)
            .output()
            .await
            .context("failed to run hosting CLI for issue create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("issue create failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .map(str::trim)
            .find(|l| l.contains("/issues/"))
            .context("issue created but no URL found in output")?
            .to_string();
        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .context("could not parse issue number from URL")?;

        Ok(Issue { number, url })
    }
}

/// Find a pull request URL in tool output: a line containing both
/// `github.com` and `/pull/`, trimmed of trailing whitespace.
pub fn extract_pr_url(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim_end)
        .find(|l| l.contains("github.com") && l.contains("/pull/"))
        .map(|l| l.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pr_url_from_clean_output() {
        let out = "Creating pull request...\nhttps://github.com/acme/widgets/pull/42\n";
        assert_eq!(
            extract_pr_url(out),
            Some("https://github.com/acme/widgets/pull/42".to_string())
        );
    }

    #[test]
    fn extract_pr_url_trims_whitespace() {
        let out = "  https://github.com/acme/widgets/pull/7   \n";
        assert_eq!(
            extract_pr_url(out),
            Some("https://github.com/acme/widgets/pull/7".to_string())
        );
    }

    #[test]
    fn extract_pr_url_from_already_exists_stderr() {
        let err = "a pull request for branch \"pilot/GH-1\" already exists:\nhttps://github.com/acme/widgets/pull/9";
        assert_eq!(
            extract_pr_url(err),
            Some("https://github.com/acme/widgets/pull/9".to_string())
        );
    }

    #[test]
    fn extract_pr_url_ignores_issue_links() {
        let out = "https://github.com/acme/widgets/issues/3\n";
        assert_eq!(extract_pr_url(out), None);
    }

    #[test]
    fn extract_pr_url_none_when_absent() {
        assert_eq!(extract_pr_url("nothing useful here"), None);
    }
}
