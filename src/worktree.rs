//! Per-task Git worktree isolation.
//!
//! Each task runs in a detached worktree under the system temp directory
//! so concurrent tasks cannot corrupt each other's checkout. Cleanup must
//! survive everything: normal return, task failure, panic (via `Drop`),
//! and even a crashed process (via the startup orphan sweep keyed on the
//! `pilot-worktree-` path prefix).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::sanitize_ref_component;

/// Prefix that marks a directory as ours; the orphan sweep removes any
/// matching directory no longer referenced by the repository.
pub const WORKTREE_PREFIX: &str = "pilot-worktree-";

/// An isolated checkout plus its cleanup handle.
pub struct WorktreeResult {
    pub path: PathBuf,
    cleanup: CleanupHandle,
}

impl WorktreeResult {
    /// Remove the worktree. Idempotent: subsequent calls are no-ops.
    pub fn cleanup(&self) {
        self.cleanup.run();
    }
}

impl Drop for WorktreeResult {
    fn drop(&mut self) {
        // Covers panic unwinding and early returns.
        self.cleanup.run();
    }
}

/// Shared idempotent cleanup. Runs blocking `git` commands so it can
/// execute inside `Drop`.
#[derive(Clone)]
struct CleanupHandle {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch: Option<String>,
    done: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl CleanupHandle {
    fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        // Run the remove even if the directory is already gone; git then
        // drops the stale administrative entry.
        let remove = std::process::Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&self.worktree_path)
            .current_dir(&self.repo_path)
            .output();
        match remove {
            Ok(out) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                debug!(path = %self.worktree_path.display(), stderr = %stderr.trim(), "worktree remove reported failure, pruning");
                let _ = std::process::Command::new("git")
                    .args(["worktree", "prune"])
                    .current_dir(&self.repo_path)
                    .output();
            }
            Err(e) => warn!(error = %e, "failed to run git worktree remove"),
            _ => {}
        }

        if self.worktree_path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.worktree_path) {
                warn!(path = %self.worktree_path.display(), error = %e, "failed to delete worktree directory");
            }
        }

        if let Some(branch) = &self.branch {
            let _ = std::process::Command::new("git")
                .args(["branch", "-D", branch])
                .current_dir(&self.repo_path)
                .output();
        }

        self.active
            .lock()
            .expect("active worktrees lock")
            .remove(&self.worktree_path);
        info!(path = %self.worktree_path.display(), "worktree cleaned up");
    }
}

/// Creates and tracks per-task worktrees for one repository.
pub struct WorktreeManager {
    repo_path: PathBuf,
    temp_dir: PathBuf,
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WorktreeManager {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            temp_dir: std::env::temp_dir(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    fn unique_path(&self, task_id: &str) -> PathBuf {
        let suffix = Uuid::new_v4().simple().to_string();
        self.temp_dir.join(format!(
            "{WORKTREE_PREFIX}{}-{}",
            sanitize_ref_component(task_id),
            &suffix[..8]
        ))
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .with_context(|| format!("failed to execute: git {}", args.join(" ")))
    }

    /// Run a worktree-add command; on failure, prune stale references
    /// (left by a prior crash) and retry once.
    async fn add_with_prune_retry(&self, args: &[&str]) -> Result<()> {
        let out = self.git(args).await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        debug!(stderr = %stderr.trim(), "worktree add failed, pruning and retrying");
        self.git(&["worktree", "prune"]).await?;

        let out = self.git(args).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("git worktree add failed after prune: {}", stderr.trim());
        }
        Ok(())
    }

    /// Create a detached worktree at a fresh ephemeral path.
    pub async fn create_worktree(&self, task_id: &str) -> Result<WorktreeResult> {
        let path = self.unique_path(task_id);
        let path_str = path.to_str().context("worktree path is not valid UTF-8")?;

        self.add_with_prune_retry(&["worktree", "add", "--detach", path_str])
            .await?;

        self.track(path.clone(), None)
    }

    /// Create a worktree with `branch` created (or reset) from `base` and
    /// checked out inside it.
    pub async fn create_worktree_with_branch(
        &self,
        task_id: &str,
        branch: &str,
        base: &str,
    ) -> Result<WorktreeResult> {
        let path = self.unique_path(task_id);
        let path_str = path.to_str().context("worktree path is not valid UTF-8")?;
        let branch = sanitize_ref_component(branch);

        self.add_with_prune_retry(&["worktree", "add", "-B", &branch, path_str, base])
            .await?;

        self.track(path.clone(), Some(branch))
    }

    fn track(&self, path: PathBuf, branch: Option<String>) -> Result<WorktreeResult> {
        self.active
            .lock()
            .expect("active worktrees lock")
            .insert(path.clone());
        info!(path = %path.display(), "worktree created");
        Ok(WorktreeResult {
            cleanup: CleanupHandle {
                repo_path: self.repo_path.clone(),
                worktree_path: path.clone(),
                branch,
                done: Arc::new(AtomicBool::new(false)),
                active: Arc::clone(&self.active),
            },
            path,
        })
    }

    /// Confirm the `origin` remote is reachable from a worktree.
    pub async fn verify_remote_access(&self, path: &Path) -> Result<()> {
        let out = Command::new("git")
            .args(["ls-remote", "--exit-code", "origin", "HEAD"])
            .current_dir(path)
            .output()
            .await
            .context("failed to run git ls-remote")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("origin remote is not accessible: {}", stderr.trim());
        }
        Ok(())
    }

    /// Best-effort removal of all tracked worktrees, for shutdown.
    /// Idempotent.
    pub fn cleanup_all(&self) {
        let paths: Vec<PathBuf> = self
            .active
            .lock()
            .expect("active worktrees lock")
            .iter()
            .cloned()
            .collect();
        for path in paths {
            CleanupHandle {
                repo_path: self.repo_path.clone(),
                worktree_path: path,
                branch: None,
                done: Arc::new(AtomicBool::new(false)),
                active: Arc::clone(&self.active),
            }
            .run();
        }
    }

    /// Startup sweep: delete `pilot-worktree-*` directories in the temp
    /// dir that the repository no longer references (left by a crash).
    pub async fn cleanup_orphaned_worktrees(&self) -> Result<usize> {
        let referenced = self.referenced_worktrees().await?;
        let pattern = self
            .temp_dir
            .join(format!("{WORKTREE_PREFIX}*"))
            .to_string_lossy()
            .into_owned();

        let mut removed = 0;
        for entry in glob::glob(&pattern).context("bad orphan sweep pattern")? {
            let Ok(path) = entry else { continue };
            if referenced.contains(&path) {
                continue;
            }
            if self
                .active
                .lock()
                .expect("active worktrees lock")
                .contains(&path)
            {
                continue;
            }
            info!(path = %path.display(), "removing orphaned worktree");
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove orphan");
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            let _ = self.git(&["worktree", "prune"]).await;
        }
        Ok(removed)
    }

    async fn referenced_worktrees(&self) -> Result<HashSet<PathBuf>> {
        let out = self.git(&["worktree", "list", "--porcelain"]).await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }
}

/// Copy `source/.agent/` into `dest/.agent/` in merge mode: files already
/// present in the destination (tracked files from the branch checkout)
/// are kept; untracked extras such as `.context-markers/*` are added.
/// A missing source scaffold is not an error.
pub fn ensure_navigator_in_worktree(source: &Path, dest: &Path) -> Result<usize> {
    let src_agent = source.join(".agent");
    if !src_agent.is_dir() {
        return Ok(0);
    }
    let dest_agent = dest.join(".agent");

    let mut copied = 0;
    for entry in walkdir::WalkDir::new(&src_agent) {
        let entry = entry.context("walking .agent scaffold")?;
        let rel = entry
            .path()
            .strip_prefix(&src_agent)
            .expect("walkdir yields children of root");
        let target = dest_agent.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else if !target.exists() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", rel.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
