//! Thin wrapper over the `git` CLI, anchored to one project path.
//!
//! Every operation shells out; nothing here touches git internals. Output
//! parsing is limited to trimming stdout and recognizing a few well-known
//! stderr shapes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, warn};

/// Git operations for one repository checkout.
#[derive(Debug, Clone)]
pub struct GitOps {
    project_path: PathBuf,
}

/// Diff statistics between a base ref and HEAD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl GitOps {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Run git with the given args and return trimmed stdout. Non-zero
    /// exit becomes an error carrying stderr.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_path)
            .output()
            .await
            .with_context(|| format!("failed to execute: git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git, tolerating failure. Returns `None` on non-zero exit.
    async fn run_ok(&self, args: &[&str]) -> Option<String> {
        self.run(args).await.ok()
    }

    pub async fn create_branch(&self, name: &str) -> Result<()> {
        self.run(&["checkout", "-b", name]).await?;
        Ok(())
    }

    /// Create the branch, or reset it to HEAD if it already exists.
    pub async fn create_or_reset_branch(&self, name: &str) -> Result<()> {
        self.run(&["checkout", "-B", name]).await?;
        Ok(())
    }

    pub async fn switch_branch(&self, name: &str) -> Result<()> {
        self.run(&["checkout", name]).await?;
        Ok(())
    }

    /// Switch to the default branch and pull. The switch is fatal on
    /// failure; the pull is tolerated so offline runs still work.
    /// Returns the default branch name.
    pub async fn switch_to_default_branch_and_pull(&self) -> Result<String> {
        let default = self.default_branch().await;
        self.run(&["checkout", &default])
            .await
            .with_context(|| format!("cannot switch to default branch '{default}'"))?;

        if let Err(e) = self.run(&["pull", "origin", &default]).await {
            warn!(branch = %default, error = %e, "pull failed, continuing with local state");
        }
        Ok(default)
    }

    /// Stage everything, commit, and return the new HEAD SHA.
    pub async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["add", "-A"]).await?;
        self.run(&["commit", "-m", message]).await?;
        self.current_commit_sha().await
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.run(&["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    pub async fn push_to_main(&self) -> Result<()> {
        let default = self.default_branch().await;
        self.run(&["push", "origin", &default]).await?;
        Ok(())
    }

    pub async fn pull(&self, branch: &str) -> Result<()> {
        self.run(&["pull", "origin", branch]).await?;
        Ok(())
    }

    pub async fn fetch(&self, branch: &str) -> Result<()> {
        self.run(&["fetch", "origin", branch]).await?;
        Ok(())
    }

    /// Resolve a ref to a SHA, or `None` when it does not exist.
    pub async fn resolve_ref(&self, reference: &str) -> Option<String> {
        self.run_ok(&["rev-parse", "--verify", "--quiet", reference])
            .await
            .filter(|s| !s.is_empty())
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.run(&["branch", "--show-current"]).await
    }

    /// Default branch: `refs/remotes/origin/HEAD` when set, otherwise
    /// `main` if it exists locally, otherwise `master`.
    pub async fn default_branch(&self) -> String {
        if let Some(sym) = self
            .run_ok(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await
        {
            if let Some(name) = sym.rsplit('/').next() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        if self
            .run_ok(&["show-ref", "--verify", "--quiet", "refs/heads/main"])
            .await
            .is_some()
        {
            return "main".to_string();
        }
        debug!("no origin/HEAD and no local main, assuming master");
        "master".to_string()
    }

    pub async fn changed_files(&self) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "HEAD"]).await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        let out = self.run(&["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    pub async fn count_new_commits(&self, base: &str) -> Result<u64> {
        let range = format!("{base}..HEAD");
        let out = self.run(&["rev-list", "--count", &range]).await?;
        out.trim()
            .parse()
            .with_context(|| format!("unexpected rev-list output: {out}"))
    }

    pub async fn current_commit_sha(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    /// Files touched and line counts between `base` and HEAD, including
    /// uncommitted changes.
    pub async fn diff_stats(&self, base: &str) -> Result<DiffStats> {
        let out = self.run(&["diff", "--numstat", base]).await?;
        let mut stats = DiffStats::default();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            let added = parts.next().unwrap_or("0");
            let removed = parts.next().unwrap_or("0");
            let file = parts.collect::<Vec<_>>().join(" ");
            if file.is_empty() {
                continue;
            }
            // binary files show "-" for both counts
            stats.lines_added += added.parse::<u64>().unwrap_or(0);
            stats.lines_removed += removed.parse::<u64>().unwrap_or(0);
            stats.files.push(file);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    async fn init_repo(dir: &Path) -> GitOps {
        let git = GitOps::new(dir);
        git.run(&["init", "-b", "main"]).await.unwrap();
        git.run(&["config", "user.name", "test"]).await.unwrap();
        git.run(&["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        git
    }

    async fn commit_file(git: &GitOps, dir: &Path, name: &str, content: &str) -> String {
        fs::write(dir.join(name), content).unwrap();
        git.commit(&format!("add {name}")).await.unwrap()
    }

    #[tokio::test]
    async fn commit_returns_head_sha() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        let sha = commit_file(&git, dir.path(), "a.txt", "hello").await;
        assert_eq!(sha.len(), 40);
        assert_eq!(git.current_commit_sha().await.unwrap(), sha);
    }

    #[tokio::test]
    async fn create_or_reset_branch_is_idempotent() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "hello").await;

        git.create_or_reset_branch("feature/x").await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), "feature/x");

        // second call resets rather than failing
        git.switch_branch("main").await.unwrap();
        git.create_or_reset_branch("feature/x").await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), "feature/x");
    }

    #[tokio::test]
    async fn uncommitted_changes_detection() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "hello").await;
        assert!(!git.has_uncommitted_changes().await.unwrap());

        fs::write(dir.path().join("b.txt"), "new").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());
    }

    #[tokio::test]
    async fn default_branch_falls_back_to_main() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "hello").await;
        // no origin remote; local main exists
        assert_eq!(git.default_branch().await, "main");
    }

    #[tokio::test]
    async fn count_new_commits_from_base() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "one").await;
        let base = git.current_commit_sha().await.unwrap();
        commit_file(&git, dir.path(), "b.txt", "two").await;
        commit_file(&git, dir.path(), "c.txt", "three").await;
        assert_eq!(git.count_new_commits(&base).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn diff_stats_counts_lines() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "one\ntwo\n").await;
        let base = git.current_commit_sha().await.unwrap();
        commit_file(&git, dir.path(), "a.txt", "one\ntwo\nthree\nfour\n").await;

        let stats = git.diff_stats(&base).await.unwrap();
        assert_eq!(stats.files, vec!["a.txt".to_string()]);
        assert_eq!(stats.lines_added, 2);
        assert_eq!(stats.lines_removed, 0);
    }

    #[tokio::test]
    async fn changed_files_lists_modified() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        commit_file(&git, dir.path(), "a.txt", "one\n").await;
        fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        let files = git.changed_files().await.unwrap();
        assert_eq!(files, vec!["a.txt".to_string()]);
    }
}
