//! Navigator scaffold bootstrap.
//!
//! Some agents localize their behavior through an on-disk `.agent/`
//! scaffold. When a project lacks one and auto-init is enabled, the
//! scaffold is rendered from embedded templates, with the project name
//! and tech stack detected by probing well-known manifest files.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use rust_embed::RustEmbed;
use tracing::{debug, info, warn};

#[derive(RustEmbed)]
#[folder = "templates/navigator/"]
struct NavigatorTemplates;

const README_MARKER: &str = ".agent/DEVELOPMENT-README.md";

/// Detected project flavor, from manifest probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Go,
    Node,
    Python,
    Rust,
    Unknown,
}

impl ProjectKind {
    pub fn tech_stack(&self) -> &'static str {
        match self {
            Self::Go => "Go",
            Self::Node => "JavaScript/TypeScript (Node.js)",
            Self::Python => "Python",
            Self::Rust => "Rust",
            Self::Unknown => "unknown",
        }
    }
}

/// Probe manifests to guess the project kind. First match wins.
pub fn detect_project_kind(project_path: &Path) -> ProjectKind {
    const PROBES: &[(&str, ProjectKind)] = &[
        ("go.mod", ProjectKind::Go),
        ("package.json", ProjectKind::Node),
        ("pyproject.toml", ProjectKind::Python),
        ("Cargo.toml", ProjectKind::Rust),
    ];
    for (file, kind) in PROBES {
        if project_path.join(file).exists() {
            return *kind;
        }
    }
    ProjectKind::Unknown
}

/// Whether the scaffold is already present.
pub fn is_initialized(project_path: &Path) -> bool {
    project_path.join(README_MARKER).exists()
}

/// Render the scaffold into `project_path/.agent/`. Returns `true` when
/// files were created, `false` when the scaffold already existed.
pub fn bootstrap(project_path: &Path) -> Result<bool> {
    if is_initialized(project_path) {
        debug!(path = %project_path.display(), "navigator already initialized");
        return Ok(false);
    }

    let kind = detect_project_kind(project_path);
    let name = project_name(project_path);
    let now = Utc::now();
    let date = now.format("%Y-%m-%d").to_string();
    let year = now.year().to_string();

    let agent_dir = project_path.join(".agent");
    std::fs::create_dir_all(&agent_dir).context("creating .agent directory")?;

    for file in NavigatorTemplates::iter() {
        let Some(embedded) = NavigatorTemplates::get(&file) else {
            continue;
        };
        let body = String::from_utf8_lossy(&embedded.data)
            .replace("{{project_name}}", &name)
            .replace("{{tech_stack}}", kind.tech_stack())
            .replace("{{date}}", &date)
            .replace("{{year}}", &year);

        let target = agent_dir.join(file.as_ref());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, body)
            .with_context(|| format!("writing template {}", file.as_ref()))?;
    }

    // Session-local directories never belong in version control
    std::fs::write(
        agent_dir.join(".gitignore"),
        ".context-markers/\nsessions/\n",
    )
    .context("writing .agent/.gitignore")?;

    info!(path = %project_path.display(), kind = ?kind, "navigator scaffold initialized");
    Ok(true)
}

/// Best-effort post-run sync of session-local navigator state from the
/// worktree back to the source project. Failures are logged only.
pub fn sync_from_worktree(worktree: &Path, project_path: &Path) {
    let markers = worktree.join(".agent").join(".context-markers");
    if !markers.is_dir() {
        return;
    }
    let dest = project_path.join(".agent").join(".context-markers");
    if let Err(e) = copy_dir(&markers, &dest) {
        warn!(error = %e, "navigator sync failed");
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).expect("children of root");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn project_name(project_path: &Path) -> String {
    project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}
