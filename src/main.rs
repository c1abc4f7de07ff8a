use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pilot::backend::{Backend, ClaudeBackend, QwenBackend};
use pilot::complexity::{EffortLevel, detect_complexity};
use pilot::config::PilotConfig;
use pilot::epic::parse_subtasks;
use pilot::learning::JsonlLearningStore;
use pilot::runner::{ProgressUpdate, Runner};
use pilot::task::Task;
use pilot::ui::{TaskProgressUi, print_result};

#[derive(Parser)]
#[command(name = "pilot")]
#[command(version, about = "Autonomous coding task engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one task end to end
    Run {
        /// Task title
        title: String,

        /// Task identity; derived from the title when omitted
        #[arg(long)]
        id: Option<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Read the description from a file instead
        #[arg(long, conflicts_with = "description")]
        file: Option<PathBuf>,

        /// Target branch; derived from the task id when omitted
        #[arg(long)]
        branch: Option<String>,

        /// Skip opening a pull request
        #[arg(long)]
        no_pr: bool,

        /// Backend CLI to drive (overrides config)
        #[arg(long)]
        backend: Option<String>,

        /// Effort override: low, medium, high
        #[arg(long)]
        effort: Option<EffortLevel>,

        /// Resume from an existing pull request
        #[arg(long)]
        from_pr: Option<u64>,

        /// Skip the Navigator scaffold entirely
        #[arg(long)]
        skip_navigator: bool,
    },
    /// Classify a task and show the parsed epic plan without executing
    Plan {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Parse this file as planner output instead of invoking a planner
        #[arg(long)]
        parse: Option<PathBuf>,
    },
    /// Remove orphaned worktrees left by crashed runs
    Cleanup,
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default pilot.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if cli.verbose { "pilot=debug" } else { "pilot=info" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            title,
            id,
            description,
            file,
            branch,
            no_pr,
            backend,
            effort,
            from_pr,
            skip_navigator,
        } => {
            let description = match file {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => description.clone(),
            };
            let task_id = id
                .clone()
                .unwrap_or_else(|| derive_task_id(title));

            let mut task = Task::new(task_id, title, project_dir.clone())
                .with_description(description)
                .with_create_pr(!no_pr);
            task.branch = branch.clone();
            task.verbose = cli.verbose;
            task.effort = *effort;
            task.from_pr = *from_pr;
            task.skip_navigator = *skip_navigator;

            run_task(&project_dir, task, backend.as_deref(), cli.verbose).await
        }
        Commands::Plan {
            title,
            description,
            parse,
        } => cmd_plan(&project_dir, title, description, parse.as_deref()),
        Commands::Cleanup => cmd_cleanup(&project_dir).await,
        Commands::Config { command } => cmd_config(&project_dir, command.clone()),
    }
}

fn derive_task_id(title: &str) -> String {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .to_lowercase();
    let slug = slug.trim_matches('-');
    format!("task-{}", &slug[..slug.len().min(24)])
}

fn select_backend(config: &PilotConfig, override_name: Option<&str>) -> Result<Arc<dyn Backend>> {
    let name = override_name.unwrap_or(&config.backend);
    let backend: Arc<dyn Backend> = match name {
        "claude" => Arc::new(ClaudeBackend::new().with_skip_permissions(config.skip_permissions)),
        "qwen" => Arc::new(QwenBackend::new()),
        other => bail!("unknown backend '{other}' (expected claude or qwen)"),
    };
    if !backend.is_available() {
        bail!("backend '{}' is not installed on this system", backend.name());
    }
    Ok(backend)
}

async fn run_task(
    project_dir: &PathBuf,
    task: Task,
    backend_override: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let config = PilotConfig::load(project_dir)?;
    let backend = select_backend(&config, backend_override)?;

    let runner = Runner::new(config, backend, project_dir.clone())
        .with_learning_store(Arc::new(JsonlLearningStore::new(project_dir.clone())));

    // Sweep leftovers from crashed runs before starting
    if let Ok(removed) = runner.worktree_manager().cleanup_orphaned_worktrees().await {
        if removed > 0 {
            eprintln!("removed {removed} orphaned worktree(s)");
        }
    }

    let ui = Arc::new(TaskProgressUi::new(&task.id, verbose));
    let ui_cb = Arc::clone(&ui);
    runner.add_progress_callback(
        "terminal",
        Arc::new(move |update: &ProgressUpdate| ui_cb.update(update)),
    );

    let result = runner.execute(&task).await?;
    ui.finish();
    print_result(&result);

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn cmd_plan(
    project_dir: &std::path::Path,
    title: &str,
    description: &str,
    parse: Option<&std::path::Path>,
) -> Result<()> {
    let task = Task::new("plan-preview", title, project_dir.to_path_buf())
        .with_description(description);
    let complexity = detect_complexity(&task);
    println!("complexity: {complexity}");

    if let Some(path) = parse {
        let output = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let subtasks = parse_subtasks(&output)?;
        println!("parsed {} subtask(s):", subtasks.len());
        for subtask in subtasks {
            println!("  {}. {} — {}", subtask.order, subtask.title, subtask.description);
        }
    }
    Ok(())
}

async fn cmd_cleanup(project_dir: &std::path::Path) -> Result<()> {
    let manager = pilot::worktree::WorktreeManager::new(project_dir);
    let removed = manager.cleanup_orphaned_worktrees().await?;
    println!("removed {removed} orphaned worktree(s)");
    Ok(())
}

fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            let config = PilotConfig::load(project_dir)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Init => {
            let path = project_dir.join("pilot.toml");
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            std::fs::write(&path, PilotConfig::default_toml())?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
