//! Terminal progress rendering.
//!
//! A thin indicatif/console layer fed by runner progress callbacks. The
//! engine itself never prints; everything user-visible goes through here.

use std::time::Duration;

use console::{Emoji, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::runner::ProgressUpdate;
use crate::task::ExecutionResult;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");

pub struct TaskProgressUi {
    bar: ProgressBar,
    verbose: bool,
}

impl TaskProgressUi {
    pub fn new(task_id: &str, verbose: bool) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .expect("valid template")
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix(task_id.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar, verbose }
    }

    /// Apply one progress tick to the bar.
    pub fn update(&self, update: &ProgressUpdate) {
        self.bar.set_position(update.percent as u64);
        self.bar.set_message(format!(
            "{} {}",
            style(&update.phase).yellow(),
            style(&update.message).dim()
        ));
        if self.verbose {
            self.bar.println(format!(
                "  {} {}% {}",
                style(&update.phase).yellow(),
                update.percent,
                style(&update.message).dim()
            ));
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Print the final result summary.
pub fn print_result(result: &ExecutionResult) {
    if result.success {
        println!("{}Task {} completed", CHECK, style(&result.task_id).bold());
    } else {
        println!(
            "{}Task {} failed: {}",
            CROSS,
            style(&result.task_id).bold(),
            style(&result.error).red()
        );
    }

    println!(
        "   {} {}s · {} files · +{} / -{} lines",
        style("duration").dim(),
        result.duration.as_secs(),
        result.files_changed.len(),
        result.lines_added,
        result.lines_removed
    );
    if result.tokens_input + result.tokens_output > 0 {
        println!(
            "   {} {} in / {} out (${:.4})",
            style("tokens").dim(),
            result.tokens_input,
            result.tokens_output,
            result.estimated_cost_usd
        );
    }
    if !result.commit_sha.is_empty() {
        println!("   {} {}", style("commit").dim(), &result.commit_sha);
    }
    if !result.pr_url.is_empty() {
        println!("   {}{}", ROCKET, style(&result.pr_url).cyan().underlined());
    }
    for gate in &result.quality_gates {
        let mark = if gate.passed { CHECK } else { CROSS };
        println!("   {mark}gate: {}", gate.name);
    }
}
