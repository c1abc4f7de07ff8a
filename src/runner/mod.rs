//! Task lifecycle orchestration.
//!
//! `Runner::execute` drives one task end to end: classify, route, isolate
//! in a worktree, run the agent subprocess, watch its stream, commit,
//! push, open a PR, and record the outcome. Expected failures come back
//! as an `ExecutionResult` with `success == false`; `Err` is reserved for
//! broken invariants.

mod progress;
mod prompt;

pub use progress::{ProgressState, ProgressUpdate, harvest_commit_sha, phase_for_tool};
pub use prompt::PromptBuilder;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEvent, AlertKind, AlertSink, LogAlertSink};
use crate::backend::{Backend, BackendEvent, BackendResult, ExecuteOptions};
use crate::complexity::{Complexity, EffortClassifier, detect_complexity};
use crate::config::PilotConfig;
use crate::drift::{DriftDetector, DriftKind};
use crate::epic::{self, EpicPlanner};
use crate::errors::{BackendError, BackendErrorKind, RunnerError};
use crate::git::GitOps;
use crate::hosting::HostingCli;
use crate::learning::{LearningStore, NullLearningStore, TaskOutcome};
use crate::retry::Retrier;
use crate::routing::ModelRouter;
use crate::signals::{SignalKind, extract_signals, parse_text_status};
use crate::stagnation::{StagnationLevel, StagnationMonitor};
use crate::task::{ExecutionResult, QualityGateResult, Task};
use crate::worktree::{WorktreeManager, ensure_navigator_in_worktree};
use crate::{navigator, signals};

/// Callback invoked for every progress tick.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Liveness outcome noted by the driver callbacks, read after the run.
const LIVENESS_NONE: u8 = 0;
const LIVENESS_HEARTBEAT: u8 = 1;
const LIVENESS_WATCHDOG: u8 = 2;

/// Central fan-out point for progress ticks.
///
/// Clamping happens here, before any callback sees a value, so no
/// callback ever observes a regressive percentage. Callbacks are invoked
/// outside the locks from a snapshot; a slow callback cannot block
/// registration or other emitters.
pub struct ProgressHub {
    high_water: Mutex<HashMap<String, u8>>,
    named: RwLock<HashMap<String, ProgressCallback>>,
    legacy: RwLock<Option<ProgressCallback>>,
}

impl ProgressHub {
    fn new() -> Self {
        Self {
            high_water: Mutex::new(HashMap::new()),
            named: RwLock::new(HashMap::new()),
            legacy: RwLock::new(None),
        }
    }

    fn emit(&self, task_id: &str, phase: &str, proposed: u8, message: &str) {
        let percent = {
            let mut marks = self.high_water.lock().expect("high water lock");
            let mark = marks.entry(task_id.to_string()).or_insert(0);
            let accepted = if proposed >= 100 {
                100
            } else {
                proposed.max(*mark)
            };
            *mark = accepted;
            accepted
        };

        let update = ProgressUpdate {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            percent,
            message: message.to_string(),
        };

        let callbacks: Vec<ProgressCallback> = {
            let named = self.named.read().expect("callbacks lock");
            let legacy = self.legacy.read().expect("legacy callback lock");
            named.values().cloned().chain(legacy.clone()).collect()
        };
        for cb in callbacks {
            cb(&update);
        }
    }

    fn clear_task(&self, task_id: &str) {
        self.high_water
            .lock()
            .expect("high water lock")
            .remove(task_id);
    }
}

struct RunningTask {
    cancel: watch::Sender<bool>,
}

/// The task execution engine, anchored to one source repository.
pub struct Runner {
    config: PilotConfig,
    backend: Arc<dyn Backend>,
    router: ModelRouter,
    retrier: Retrier,
    worktrees: Arc<WorktreeManager>,
    hosting: HostingCli,
    prompt: PromptBuilder,
    effort: Option<EffortClassifier>,
    alerts: Arc<dyn AlertSink>,
    learning: Arc<dyn LearningStore>,
    drift: Arc<DriftDetector>,
    progress: Arc<ProgressHub>,
    running: Mutex<HashMap<String, RunningTask>>,
}

impl Runner {
    pub fn new(config: PilotConfig, backend: Arc<dyn Backend>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let router = ModelRouter::new(config.routing.clone());
        let retrier = Retrier::new(config.retry.clone());
        let effort = if config.effort_model.is_empty() {
            None
        } else {
            Some(EffortClassifier::new(
                "claude",
                &config.effort_model,
                root.clone(),
            ))
        };
        Self {
            router,
            retrier,
            worktrees: Arc::new(WorktreeManager::new(root.clone())),
            hosting: HostingCli::new(root.clone()),
            prompt: PromptBuilder::new(),
            effort,
            alerts: Arc::new(LogAlertSink),
            learning: Arc::new(NullLearningStore),
            drift: Arc::new(DriftDetector::new()),
            progress: Arc::new(ProgressHub::new()),
            running: Mutex::new(HashMap::new()),
            config,
            backend,
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_learning_store(mut self, learning: Arc<dyn LearningStore>) -> Self {
        // Corrections persist to the same store
        self.drift = Arc::new(DriftDetector::new().with_learning(Arc::clone(&learning)));
        self.learning = learning;
        self
    }

    pub fn worktree_manager(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    // ---- callback registration -------------------------------------------

    pub fn add_progress_callback(&self, name: impl Into<String>, callback: ProgressCallback) {
        self.progress
            .named
            .write()
            .expect("callbacks lock")
            .insert(name.into(), callback);
    }

    pub fn remove_progress_callback(&self, name: &str) {
        self.progress
            .named
            .write()
            .expect("callbacks lock")
            .remove(name);
    }

    /// Legacy single-slot callback; replaced on each call.
    pub fn on_progress(&self, callback: ProgressCallback) {
        *self.progress.legacy.write().expect("legacy callback lock") = Some(callback);
    }

    /// Record a user correction against the session. Enough corrections
    /// inside the drift window cause the next agent attempt to be
    /// re-anchored on the original task statement.
    pub fn record_correction(&self, pattern: &str, correction: &str) {
        self.drift
            .record_correction(DriftKind::RepeatedCorrection, pattern, correction);
    }

    // ---- lifecycle queries -----------------------------------------------

    /// Request termination of a running task. Safe to call concurrently
    /// and for unknown or finished tasks.
    pub fn cancel(&self, task_id: &str) {
        let running = self.running.lock().expect("running map lock");
        if let Some(entry) = running.get(task_id) {
            let _ = entry.cancel.send(true);
            info!(task_id, "cancellation requested");
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running
            .lock()
            .expect("running map lock")
            .contains_key(task_id)
    }

    // ---- execution -------------------------------------------------------

    /// Execute one task to completion. Always returns a populated result
    /// for expected failures; `Err` means a programmer error.
    pub async fn execute(&self, task: &Task) -> Result<ExecutionResult, RunnerError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut running = self.running.lock().expect("running map lock");
            if running.contains_key(&task.id) {
                return Err(RunnerError::AlreadyRunning {
                    task_id: task.id.clone(),
                });
            }
            running.insert(task.id.clone(), RunningTask { cancel: cancel_tx });
        }

        let outcome = self.execute_inner(task, cancel_rx, true).await;

        self.running
            .lock()
            .expect("running map lock")
            .remove(&task.id);
        self.progress.clear_task(&task.id);
        outcome
    }

    async fn execute_inner(
        &self,
        task: &Task,
        cancel: watch::Receiver<bool>,
        top_level: bool,
    ) -> Result<ExecutionResult, RunnerError> {
        let started = Instant::now();
        let mut result = ExecutionResult::for_task(task);
        let complexity = detect_complexity(task);
        info!(task_id = %task.id, complexity = %complexity, "task classified");

        if complexity.is_epic() && top_level {
            return self.execute_epic(task, cancel, started).await;
        }

        if complexity == Complexity::Complex && self.config.decompose_complex && top_level {
            return self.execute_decomposed(task, cancel, started).await;
        }

        let route = self.router.route(complexity);
        let effort = match task.effort {
            Some(level) => Some(level),
            None => match &self.effort {
                Some(classifier) => {
                    classifier
                        .classify(&task.id, &task.title, &task.description)
                        .await
                }
                None => None,
            },
        };

        // ---- isolation --------------------------------------------------

        let use_worktree = self.config.worktrees_enabled && top_level;
        let mut worktree = None;
        let exec_path: PathBuf = if use_worktree {
            let git = GitOps::new(&task.project_path);
            let default = git.default_branch().await;
            if let Err(e) = git.fetch(&default).await {
                debug!(error = %e, "fetch failed, using local default branch");
            }
            let base = match git.resolve_ref(&format!("origin/{default}")).await {
                Some(_) => format!("origin/{default}"),
                None => default.clone(),
            };
            let wt = match self
                .worktrees
                .create_worktree_with_branch(&task.id, &task.target_branch(), &base)
                .await
            {
                Ok(wt) => wt,
                Err(e) => {
                    return Ok(self
                        .fail(task, result, started, format!("worktree creation failed: {e}"))
                        .await);
                }
            };
            if task.create_pr {
                // The run ends in a push; fail before the agent starts
                // rather than after it has done the work.
                if let Err(e) = self.worktrees.verify_remote_access(&wt.path).await {
                    wt.cleanup();
                    return Ok(self
                        .fail(task, result, started, format!("remote unreachable: {e}"))
                        .await);
                }
            }
            if let Err(e) = ensure_navigator_in_worktree(&task.project_path, &wt.path) {
                warn!(error = %e, "navigator copy into worktree failed");
            }
            let path = wt.path.clone();
            worktree = Some(wt);
            path
        } else {
            if top_level {
                // Non-worktree mode works directly in the checkout; never
                // run from the wrong base.
                let git = GitOps::new(&task.project_path);
                match git.switch_to_default_branch_and_pull().await {
                    Ok(_) => {
                        if let Err(e) = git.create_or_reset_branch(&task.target_branch()).await {
                            return Ok(self
                                .fail(task, result, started, format!("branch setup failed: {e}"))
                                .await);
                        }
                    }
                    Err(e) => {
                        return Ok(self
                            .fail(
                                task,
                                result,
                                started,
                                format!("default branch switch failed: {e}"),
                            )
                            .await);
                    }
                }
            }
            task.project_path.clone()
        };

        // ---- navigator + prompt -----------------------------------------

        let mut navigator_present = navigator::is_initialized(&exec_path);
        if !navigator_present
            && !task.skip_navigator
            && !complexity.should_skip_navigator()
            && self.config.navigator_auto_init
        {
            match navigator::bootstrap(&exec_path) {
                Ok(created) => navigator_present = created,
                Err(e) => warn!(error = %e, "navigator bootstrap failed"),
            }
        }

        let prompt = self.prompt.build(task, complexity, navigator_present);

        // ---- subprocess with retries ------------------------------------

        let state = Arc::new(Mutex::new(ProgressState::default()));
        let monitor = Arc::new(StagnationMonitor::new(self.config.stagnation.clone()));
        let liveness = Arc::new(AtomicU8::new(LIVENESS_NONE));

        self.progress.emit(
            &task.id,
            "Starting",
            5,
            &format!("model {}", route.model.as_deref().unwrap_or("default")),
        );

        let run = self
            .run_agent(
                task, &prompt, &exec_path, &route, effort, &cancel, &state, &monitor, &liveness,
            )
            .await;

        let backend_result = match run {
            Ok(r) => r,
            Err(e) => {
                self.dispatch_liveness_alert(task, &e, &liveness).await;
                let mut r = self
                    .fail(task, result, started, format!("agent failed: {e}"))
                    .await;
                {
                    let state = state.lock().expect("progress state lock");
                    r.tokens_input = state.tokens_input;
                    r.tokens_output = state.tokens_output;
                    r.output = state.last_text.clone();
                }
                if let Some(wt) = worktree.take() {
                    wt.cleanup();
                }
                return Ok(r);
            }
        };

        result.output = backend_result.output.clone();
        result.tokens_input = backend_result.tokens_input;
        result.tokens_output = backend_result.tokens_output;
        result.model_name = backend_result
            .model
            .clone()
            .or(route.model.clone())
            .unwrap_or_default();
        result.estimated_cost_usd =
            estimate_cost(&result.model_name, result.tokens_input, result.tokens_output);

        // ---- quality gates ----------------------------------------------

        let mut gates_passed = true;
        if !self.config.quality_gates.is_empty() {
            self.progress.emit(&task.id, "Verify", 75, "quality gates");
            result.quality_gates = self.run_quality_gates(&exec_path).await;
            gates_passed = result.quality_gates.iter().all(|g| g.passed);
        }

        // ---- commit / push / PR -----------------------------------------

        let git = GitOps::new(&exec_path);
        let default = git.default_branch().await;

        if let Some(sha) = state.lock().expect("progress state lock").commit_sha.clone() {
            result.commit_sha = sha;
        }

        match git.has_uncommitted_changes().await {
            Ok(true) => {
                self.progress.emit(&task.id, "Finalizing", 88, "committing");
                match git.commit(&format!("{} ({})", task.title, task.id)).await {
                    Ok(sha) => result.commit_sha = sha,
                    Err(e) => warn!(error = %e, "commit failed"),
                }
            }
            Ok(false) => {
                if result.commit_sha.is_empty() {
                    if let Ok(sha) = git.current_commit_sha().await {
                        result.commit_sha = sha;
                    }
                }
            }
            Err(e) => warn!(error = %e, "uncommitted-changes check failed"),
        }

        let base = match git.resolve_ref(&format!("origin/{default}")).await {
            Some(_) => format!("origin/{default}"),
            None => default.clone(),
        };
        if let Ok(stats) = git.diff_stats(&base).await {
            result.files_changed = stats.files;
            result.lines_added = stats.lines_added;
            result.lines_removed = stats.lines_removed;
        }

        let mut push_error = None;
        if top_level || task.create_pr {
            // Sub-issues of an epic ride the parent's branch; push
            // whatever is checked out rather than a derived name.
            let branch = if top_level {
                task.target_branch()
            } else {
                git.current_branch()
                    .await
                    .unwrap_or_else(|_| task.target_branch())
            };
            self.progress.emit(&task.id, "Finalizing", 92, "pushing");
            if let Err(e) = git.push(&branch).await {
                warn!(error = %e, %branch, "push failed");
                push_error = Some(format!("push failed: {e}"));
            } else if task.create_pr {
                match self
                    .hosting
                    .at(&exec_path)
                    .create_pr(&task.title, &pr_body(task, &result), &default)
                    .await
                {
                    Ok(pr) => result.pr_url = pr.url,
                    Err(e) => {
                        warn!(error = %e, "PR creation failed");
                        push_error = Some(format!("PR creation failed: {e}"));
                    }
                }
            }
        }

        // ---- outcome ----------------------------------------------------

        result.duration = started.elapsed();
        result.success = backend_result.success && gates_passed && push_error.is_none();
        if !gates_passed {
            result.error = "quality gates failed".to_string();
        }
        if let Some(e) = push_error {
            result.error = e;
        }

        self.finish_side_effects(task, complexity, &result, worktree.as_ref().map(|w| w.path.as_path()))
            .await;

        if let Some(wt) = worktree.take() {
            wt.cleanup();
        }

        let (phase, kind) = if result.success {
            ("Completed", AlertKind::TaskCompleted)
        } else {
            ("Failed", AlertKind::TaskFailed)
        };
        self.emit_terminal(&task.id, phase, &state);
        let message = if result.success {
            format!("task {} completed", task.id)
        } else {
            format!("task {} failed: {}", task.id, result.error)
        };
        self.send_alert(
            AlertEvent::new(kind, &task.id, message)
                .with_meta("duration_secs", result.duration.as_secs().to_string())
                .with_meta("model", result.model_name.clone()),
        )
        .await;

        Ok(result)
    }

    /// Run the agent subprocess, consulting the retry engine on
    /// classified failures.
    #[allow(clippy::too_many_arguments)]
    async fn run_agent(
        &self,
        task: &Task,
        prompt: &str,
        exec_path: &Path,
        route: &crate::routing::Route,
        effort: Option<crate::complexity::EffortLevel>,
        cancel: &watch::Receiver<bool>,
        state: &Arc<Mutex<ProgressState>>,
        monitor: &Arc<StagnationMonitor>,
        liveness: &Arc<AtomicU8>,
    ) -> Result<BackendResult, BackendError> {
        let mut attempt: u32 = 0;
        let mut timeout = route.timeout;
        let mut prompt = prompt.to_string();

        loop {
            let (abort_tx, abort_rx) = watch::channel(false);
            let mut run_cancel = cancel.clone();
            let merged_cancel = {
                // Either caller cancellation or a stagnation abort stops
                // the subprocess.
                let (tx, rx) = watch::channel(false);
                let mut abort_rx = abort_rx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = run_cancel.changed() => {}
                        _ = abort_rx.changed() => {}
                    }
                    let _ = tx.send(true);
                });
                rx
            };

            let mut opts = ExecuteOptions::new(prompt.clone(), exec_path.to_path_buf())
                .with_cancel(merged_cancel);
            opts.model = route.model.clone();
            opts.effort = effort;
            opts.from_pr = task.from_pr;
            opts.verbose = task.verbose;
            opts.heartbeat_timeout = self.config.heartbeat();
            opts.watchdog_timeout = timeout;
            opts.event_handler = Some(self.make_event_handler(
                &task.id,
                Arc::clone(state),
                Arc::clone(monitor),
                abort_tx,
            ));
            {
                let liveness = Arc::clone(liveness);
                opts.heartbeat_callback = Some(Arc::new(move |pid, age| {
                    warn!(pid, age_secs = age.as_secs(), "heartbeat expired");
                    liveness.store(LIVENESS_HEARTBEAT, Ordering::SeqCst);
                }));
            }
            {
                let liveness = Arc::clone(liveness);
                opts.watchdog_callback = Some(Arc::new(move |pid, elapsed| {
                    warn!(pid, elapsed_secs = elapsed.as_secs(), "watchdog expired");
                    liveness.store(LIVENESS_WATCHDOG, Ordering::SeqCst);
                }));
            }

            match self.backend.execute(opts).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let decision = self.retrier.decide(&error, attempt, timeout);
                    if !decision.should_retry {
                        debug!(reason = %decision.reason, "not retrying");
                        return Err(error);
                    }
                    info!(
                        task_id = %task.id,
                        kind = %error.kind,
                        backoff_secs = decision.backoff.as_secs(),
                        "{}", decision.reason
                    );
                    self.progress.emit(
                        &task.id,
                        "Retrying",
                        0,
                        &format!("{} — backing off {}s", error.kind, decision.backoff.as_secs()),
                    );
                    if self
                        .retrier
                        .sleep(cancel.clone(), decision.backoff)
                        .await
                        .is_err()
                    {
                        return Err(error);
                    }
                    if let Some(extended) = decision.extended_timeout {
                        timeout = extended;
                    }
                    // Accumulated corrections from the failed attempt get
                    // folded into the next one as a re-anchor preamble.
                    if self.drift.should_reanchor() {
                        info!(task_id = %task.id, "re-anchoring after repeated corrections");
                        prompt = format!("{}\n\n{prompt}", self.drift.reanchor_prompt());
                        self.drift.reset();
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Build the per-run stream processor. Every BackendEvent flows
    /// through here in stream order.
    fn make_event_handler(
        &self,
        task_id: &str,
        state: Arc<Mutex<ProgressState>>,
        monitor: Arc<StagnationMonitor>,
        abort: watch::Sender<bool>,
    ) -> crate::backend::EventHandler {
        let hub = Arc::clone(&self.progress);
        let drift = Arc::clone(&self.drift);
        let task_id = task_id.to_string();

        Arc::new(move |event: &BackendEvent| match event {
            BackendEvent::Init { session_id } => {
                debug!(%task_id, %session_id, "session established");
            }
            BackendEvent::ToolUse { name, input } => {
                if let Some((phase, pct)) = phase_for_tool(name, input) {
                    let transitioned = {
                        let mut state = state.lock().expect("progress state lock");
                        state.enter_phase(phase)
                    };
                    if transitioned {
                        hub.emit(&task_id, phase, pct, &format!("using {name}"));
                    }
                }
            }
            BackendEvent::ToolResult { output, is_error } => {
                if *is_error {
                    let summary = output.lines().next().unwrap_or("tool call failed");
                    drift.record_correction(DriftKind::QualityDrop, "tool failure", summary);
                }
                let mut state = state.lock().expect("progress state lock");
                if state.commit_sha.is_none() {
                    state.commit_sha = harvest_commit_sha(output);
                }
            }
            BackendEvent::Text { text } => {
                if !text.trim().is_empty() {
                    let mut state = state.lock().expect("progress state lock");
                    state.last_text = text.clone();
                }
                handle_text_block(&hub, &state, &monitor, &drift, &abort, &task_id, text);
            }
            BackendEvent::Result {
                is_error,
                tokens_input,
                tokens_output,
                model,
                ..
            } => {
                let transitioned = {
                    let mut state = state.lock().expect("progress state lock");
                    state.tokens_input = *tokens_input;
                    state.tokens_output = *tokens_output;
                    if let Some(model) = model {
                        state.model = Some(model.clone());
                    }
                    !is_error && state.enter_phase("Finalizing")
                };
                if transitioned {
                    hub.emit(&task_id, "Finalizing", 90, "agent finished");
                }
            }
            BackendEvent::Error { message } => {
                warn!(%task_id, "backend stream error: {message}");
            }
            BackendEvent::Progress { phase, message } => {
                debug!(%task_id, %phase, %message, "driver notice");
            }
        })
    }

    // ---- epic & decomposition -------------------------------------------

    /// Plan the epic, open sub-issues, and execute them strictly
    /// sequentially in the parent's worktree on one branch. Only the last
    /// subtask opens the PR, so it contains all accumulated work.
    async fn execute_epic(
        &self,
        task: &Task,
        cancel: watch::Receiver<bool>,
        started: Instant,
    ) -> Result<ExecutionResult, RunnerError> {
        let mut aggregate = ExecutionResult::for_task(task);

        let planner = EpicPlanner::new(Arc::clone(&self.backend)).with_model(
            if self.config.planning_model.is_empty() {
                self.router
                    .route(Complexity::Epic)
                    .model
                    .unwrap_or_default()
            } else {
                self.config.planning_model.clone()
            },
        );

        self.progress.emit(&task.id, "Planning", 5, "planning epic");
        let plan = match planner.plan(task).await {
            Ok(plan) => plan,
            Err(e) => {
                return Ok(self
                    .fail(task, aggregate, started, format!("epic planning failed: {e}"))
                    .await);
            }
        };

        let issues = match epic::create_sub_issues(&self.hosting, &plan).await {
            Ok(issues) => issues,
            Err(e) => {
                return Ok(self
                    .fail(task, aggregate, started, format!("sub-issue creation failed: {e}"))
                    .await);
            }
        };

        // One worktree for the whole epic; all subtasks share it.
        let git = GitOps::new(&task.project_path);
        let default = git.default_branch().await;
        if let Err(e) = git.fetch(&default).await {
            debug!(error = %e, "fetch failed before epic worktree");
        }
        let base = match git.resolve_ref(&format!("origin/{default}")).await {
            Some(_) => format!("origin/{default}"),
            None => default.clone(),
        };
        let worktree = match self
            .worktrees
            .create_worktree_with_branch(&task.id, &task.target_branch(), &base)
            .await
        {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(self
                    .fail(task, aggregate, started, format!("worktree creation failed: {e}"))
                    .await);
            }
        };
        if let Err(e) = ensure_navigator_in_worktree(&task.project_path, &worktree.path) {
            warn!(error = %e, "navigator copy into epic worktree failed");
        }

        let total = issues.len();
        let mut failed_at = None;
        for (index, issue) in issues.iter().enumerate() {
            let sub_task = Task {
                id: format!("{}-sub{}", task.id, issue.subtask.order),
                title: issue.subtask.title.clone(),
                description: format!("{}\n\nHosting issue: {}", issue.subtask.description, issue.url),
                priority: task.priority.clone(),
                // Sub-issues run inside the parent's worktree on the
                // already-active branch.
                project_path: worktree.path.clone(),
                branch: None,
                verbose: task.verbose,
                create_pr: index + 1 == total && task.create_pr,
                from_pr: None,
                effort: task.effort,
                skip_navigator: task.skip_navigator,
            };

            self.progress.emit(
                &task.id,
                "Epic",
                (10 + (index * 80) / total.max(1)) as u8,
                &format!("subtask {}/{}: {}", index + 1, total, sub_task.title),
            );

            let sub_result = Box::pin(self.execute_inner(&sub_task, cancel.clone(), false)).await?;
            aggregate.absorb(&sub_result);
            if !sub_result.success {
                failed_at = Some((index + 1, sub_result.error.clone()));
                break;
            }
        }

        // Push the accumulated branch from the worktree before it goes away.
        if failed_at.is_none() {
            let wt_git = GitOps::new(&worktree.path);
            if let Err(e) = wt_git.push(&task.target_branch()).await {
                warn!(error = %e, "epic branch push failed");
            }
        }

        worktree.cleanup();

        aggregate.duration = started.elapsed();
        match failed_at {
            Some((index, error)) => {
                aggregate.success = false;
                aggregate.error = format!("subtask {index}/{total} failed: {error}");
                self.emit_terminal_simple(&task.id, "Failed");
                self.send_alert(AlertEvent::new(
                    AlertKind::TaskFailed,
                    &task.id,
                    aggregate.error.clone(),
                ))
                .await;
            }
            None => {
                aggregate.success = true;
                aggregate.output = plan.plan_output.clone();
                self.emit_terminal_simple(&task.id, "Completed");
                self.send_alert(AlertEvent::new(
                    AlertKind::TaskCompleted,
                    &task.id,
                    format!("epic {} completed with {} subtasks", task.id, total),
                ))
                .await;
            }
        }
        Ok(aggregate)
    }

    /// Decompose a complex (non-epic) task and run the parts sequentially
    /// in one worktree. No hosting issues are created; decomposition is
    /// disabled on the recursive entry.
    async fn execute_decomposed(
        &self,
        task: &Task,
        cancel: watch::Receiver<bool>,
        started: Instant,
    ) -> Result<ExecutionResult, RunnerError> {
        let mut aggregate = ExecutionResult::for_task(task);

        let planner = EpicPlanner::new(Arc::clone(&self.backend));
        let plan = match planner.plan(task).await {
            Ok(plan) => plan,
            Err(e) => {
                // Decomposition is an optimization; fall back to a direct run
                warn!(error = %e, "decomposition failed, running directly");
                return Box::pin(self.execute_inner(task, cancel, false)).await;
            }
        };

        let git = GitOps::new(&task.project_path);
        let default = git.default_branch().await;
        let base = match git.resolve_ref(&format!("origin/{default}")).await {
            Some(_) => format!("origin/{default}"),
            None => default.clone(),
        };
        let worktree = match self
            .worktrees
            .create_worktree_with_branch(&task.id, &task.target_branch(), &base)
            .await
        {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(self
                    .fail(task, aggregate, started, format!("worktree creation failed: {e}"))
                    .await);
            }
        };

        let total = plan.subtasks.len();
        let mut failed = false;
        for (index, subtask) in plan.subtasks.iter().enumerate() {
            let sub_task = Task {
                id: format!("{}-part{}", task.id, subtask.order),
                title: subtask.title.clone(),
                description: subtask.description.clone(),
                priority: task.priority.clone(),
                project_path: worktree.path.clone(),
                branch: None,
                verbose: task.verbose,
                create_pr: index + 1 == total && task.create_pr,
                from_pr: None,
                effort: task.effort,
                skip_navigator: task.skip_navigator,
            };
            let sub_result = Box::pin(self.execute_inner(&sub_task, cancel.clone(), false)).await?;
            aggregate.absorb(&sub_result);
            if !sub_result.success {
                aggregate.error = format!(
                    "part {}/{} failed: {}",
                    index + 1,
                    total,
                    sub_result.error
                );
                failed = true;
                break;
            }
        }

        if !failed {
            let wt_git = GitOps::new(&worktree.path);
            if let Err(e) = wt_git.push(&task.target_branch()).await {
                warn!(error = %e, "decomposed branch push failed");
            }
        }
        worktree.cleanup();

        aggregate.duration = started.elapsed();
        aggregate.success = !failed;
        let phase = if failed { "Failed" } else { "Completed" };
        self.emit_terminal_simple(&task.id, phase);
        Ok(aggregate)
    }

    // ---- helpers ---------------------------------------------------------

    async fn run_quality_gates(&self, exec_path: &Path) -> Vec<QualityGateResult> {
        let mut results = Vec::new();
        for command in &self.config.quality_gates {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(exec_path)
                .output()
                .await;
            let result = match output {
                Ok(out) => QualityGateResult {
                    name: command.clone(),
                    passed: out.status.success(),
                    output: format!(
                        "{}{}",
                        String::from_utf8_lossy(&out.stdout),
                        String::from_utf8_lossy(&out.stderr)
                    )
                    .trim()
                    .to_string(),
                },
                Err(e) => QualityGateResult {
                    name: command.clone(),
                    passed: false,
                    output: format!("failed to run: {e}"),
                },
            };
            if !result.passed {
                warn!(gate = %result.name, "quality gate failed");
            }
            results.push(result);
        }
        results
    }

    /// Best-effort side effects after a run; none may fail the task.
    async fn finish_side_effects(
        &self,
        task: &Task,
        complexity: Complexity,
        result: &ExecutionResult,
        worktree_path: Option<&Path>,
    ) {
        if let Some(wt) = worktree_path {
            navigator::sync_from_worktree(wt, &task.project_path);
        }
        let outcome = TaskOutcome::from_result(&task.title, complexity, result);
        if let Err(e) = self.learning.record_outcome(outcome).await {
            warn!(error = %e, "learning record failed");
        }
    }

    async fn dispatch_liveness_alert(
        &self,
        task: &Task,
        error: &BackendError,
        liveness: &Arc<AtomicU8>,
    ) {
        let kind = match liveness.load(Ordering::SeqCst) {
            LIVENESS_HEARTBEAT => AlertKind::HeartbeatTimeout,
            LIVENESS_WATCHDOG => AlertKind::WatchdogKill,
            _ if error.kind == BackendErrorKind::Timeout => AlertKind::TaskTimeout,
            _ => return,
        };
        self.send_alert(AlertEvent::new(kind, &task.id, error.message.clone()))
            .await;
    }

    async fn send_alert(&self, event: AlertEvent) {
        if let Err(e) = self.alerts.send(event).await {
            warn!(error = %e, "alert dispatch failed");
        }
    }

    /// Build a failure result, emit the terminal tick, and alert.
    async fn fail(
        &self,
        task: &Task,
        mut result: ExecutionResult,
        started: Instant,
        error: String,
    ) -> ExecutionResult {
        warn!(task_id = %task.id, "{error}");
        result.success = false;
        result.error = error.clone();
        result.duration = started.elapsed();
        self.emit_terminal_simple(&task.id, "Failed");
        self.send_alert(AlertEvent::new(AlertKind::TaskFailed, &task.id, error))
            .await;
        result
    }

    fn emit_terminal(&self, task_id: &str, phase: &str, state: &Arc<Mutex<ProgressState>>) {
        let already = {
            let mut state = state.lock().expect("progress state lock");
            let was = state.terminal_emitted;
            state.terminal_emitted = true;
            was
        };
        if !already {
            self.progress.emit(task_id, phase, 100, phase);
        }
    }

    fn emit_terminal_simple(&self, task_id: &str, phase: &str) {
        self.progress.emit(task_id, phase, 100, phase);
    }
}

/// Interpret one assistant text block: v2 signals take priority, then the
/// plain-text status lines.
fn handle_text_block(
    hub: &Arc<ProgressHub>,
    state: &Arc<Mutex<ProgressState>>,
    monitor: &Arc<StagnationMonitor>,
    drift: &Arc<DriftDetector>,
    abort: &watch::Sender<bool>,
    task_id: &str,
    text: &str,
) {
    let parsed = extract_signals(text);
    if !parsed.is_empty() {
        for signal in parsed {
            apply_signal(hub, state, monitor, drift, abort, task_id, &signal);
        }
        return;
    }

    if let Some(status) = parse_text_status(text) {
        let (phase, percent) = {
            let mut state = state.lock().expect("progress state lock");
            if let Some(phase) = &status.phase {
                state.enter_phase(phase);
                state.navigator_phase = Some(phase.clone());
            }
            let phase = state.phase.clone();
            (phase, status.progress.unwrap_or(0))
        };
        let level = monitor.record(&phase, percent, 0);
        escalate(abort, task_id, level);
        hub.emit(task_id, &phase, percent, "status update");
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_signal(
    hub: &Arc<ProgressHub>,
    state: &Arc<Mutex<ProgressState>>,
    monitor: &Arc<StagnationMonitor>,
    drift: &Arc<DriftDetector>,
    abort: &watch::Sender<bool>,
    task_id: &str,
    signal: &signals::PilotSignal,
) {
    match signal.kind {
        SignalKind::Stagnation => {
            // Surface immediately; the clamp holds the high-water mark,
            // so progress 0 is display-only.
            let message = if signal.message.is_empty() {
                "agent reports stagnation"
            } else {
                signal.message.as_str()
            };
            hub.emit(task_id, "⚠️ Stalled", 0, message);
            let pattern = if signal.phase.is_empty() {
                "stagnation"
            } else {
                signal.phase.as_str()
            };
            drift.record_correction(DriftKind::ContextConfusion, pattern, message);
            let level = monitor.record(&signal.phase, signal.percent(), signal.iteration);
            escalate(abort, task_id, level);
        }
        SignalKind::Exit => {
            {
                let mut state = state.lock().expect("progress state lock");
                state.exit_signal = true;
            }
            hub.emit(
                task_id,
                "Finalizing",
                93,
                if signal.success {
                    "agent signals completion"
                } else {
                    "agent signals exit"
                },
            );
        }
        SignalKind::Status | SignalKind::Phase => {
            let phase = {
                let mut state = state.lock().expect("progress state lock");
                if !signal.phase.is_empty() {
                    state.enter_phase(&signal.phase);
                }
                state.iteration = signal.iteration;
                state.phase.clone()
            };
            let level = monitor.record(&phase, signal.percent(), signal.iteration);
            escalate(abort, task_id, level);
            let message = if signal.message.is_empty() {
                format!("iteration {}", signal.iteration)
            } else {
                signal.message.clone()
            };
            hub.emit(task_id, &phase, signal.percent(), &message);
        }
    }
}

fn escalate(abort: &watch::Sender<bool>, task_id: &str, level: StagnationLevel) {
    if level == StagnationLevel::Abort {
        warn!(task_id, "stagnation abort, terminating subprocess");
        let _ = abort.send(true);
    }
}

fn estimate_cost(model: &str, tokens_input: u64, tokens_output: u64) -> f64 {
    // USD per million tokens (input, output), by model family;
    // unknown models price as the sonnet tier
    let (input_rate, output_rate) = if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("haiku") {
        (0.8, 4.0)
    } else {
        (3.0, 15.0)
    };
    (tokens_input as f64 * input_rate + tokens_output as f64 * output_rate) / 1_000_000.0
}

fn pr_body(task: &Task, result: &ExecutionResult) -> String {
    format!(
        "{}\n\n---\nAutomated change for task {}.\n\n\
         - Model: {}\n- Files changed: {}\n- Lines: +{} / -{}",
        task.description,
        task.id,
        result.model_name,
        result.files_changed.len(),
        result.lines_added,
        result.lines_removed
    )
}
