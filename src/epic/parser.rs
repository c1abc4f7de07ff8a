//! Plan output parsing.
//!
//! Planner output arrives in whatever numbering style the model felt
//! like that day. The parser accepts the formats seen in practice:
//! `1.` / `1)` / `**1.**` / `### 1.` / `- 1.` / `- **1.**` / `Step N:`,
//! with title and description separated by ` - `, an en/em dash, or
//! `: `, and optional bold around the title. Lines below a numbered
//! entry are folded into its description until the next entry.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::PlanError;

use super::PlannedSubtask;

static STEP_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s+)?step\s+(\d+)\s*[:.)]\s*(.+)$").expect("valid regex")
});

static BOLD_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?\*\*(\d+)[.)]?\*\*\s*(.+)$").expect("valid regex")
});

static PLAIN_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?(?:#{1,6}\s+)?(\d+)[.)]\s+(.+)$").expect("valid regex")
});

/// Title/description separators, tried in order of first occurrence.
const SEPARATORS: &[&str] = &[" - ", " – ", " — ", ": "];

fn match_numbered_line(line: &str) -> Option<(u32, String)> {
    for re in [&*STEP_FORM, &*BOLD_NUMBER, &*PLAIN_NUMBER] {
        if let Some(cap) = re.captures(line) {
            let order: u32 = cap.get(1)?.as_str().parse().ok()?;
            let rest = cap.get(2)?.as_str().trim().to_string();
            return Some((order, rest));
        }
    }
    None
}

fn split_title_description(rest: &str) -> (String, String) {
    let mut best: Option<(usize, &str)> = None;
    for sep in SEPARATORS {
        if let Some(idx) = rest.find(sep) {
            if best.is_none_or(|(b, _)| idx < b) {
                best = Some((idx, sep));
            }
        }
    }

    let (title, description) = match best {
        Some((idx, sep)) => (&rest[..idx], rest[idx + sep.len()..].trim()),
        None => (rest, ""),
    };

    let title = title.trim().trim_matches('*').trim().to_string();
    (title, description.to_string())
}

/// Parse planner output into ordered subtasks.
///
/// Duplicate orders keep the first occurrence; the final list is
/// renumbered contiguously from 1. Empty output and a parse that finds
/// nothing are both hard errors.
pub fn parse_subtasks(output: &str) -> Result<Vec<PlannedSubtask>, PlanError> {
    if output.trim().is_empty() {
        return Err(PlanError::EmptyOutput);
    }

    let mut parsed: Vec<(u32, String, String)> = Vec::new();

    for line in output.lines() {
        if let Some((order, rest)) = match_numbered_line(line) {
            let (title, description) = split_title_description(&rest);
            if title.is_empty() {
                continue;
            }
            parsed.push((order, title, description));
        } else if let Some(current) = parsed.last_mut() {
            // continuation line: fold into the open entry's description
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !current.2.is_empty() {
                current.2.push(' ');
            }
            current.2.push_str(trimmed);
        }
    }

    // keep-first dedup on the parsed order
    let mut seen = std::collections::HashSet::new();
    parsed.retain(|(order, _, _)| seen.insert(*order));
    parsed.sort_by_key(|(order, _, _)| *order);

    if parsed.is_empty() {
        return Err(PlanError::NoSubtasks);
    }

    Ok(parsed
        .into_iter()
        .enumerate()
        .map(|(i, (_, title, description))| {
            let order = (i + 1) as u32;
            PlannedSubtask {
                title,
                description,
                order,
                depends_on: if order > 1 { vec![order - 1] } else { Vec::new() },
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bold_numbered_plan() {
        let output = "1. **Set up database schema** - Create migration files\n\
                      2. **Implement auth service** - Build JWT-based authentication\n\
                      3. **Add API endpoints** - Create login and logout routes\n\
                      4. **Write integration tests** - End-to-end tests";
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 4);
        assert_eq!(subtasks[0].title, "Set up database schema");
        assert_eq!(subtasks[1].title, "Implement auth service");
        assert_eq!(subtasks[2].title, "Add API endpoints");
        assert_eq!(subtasks[3].title, "Write integration tests");
        for (i, s) in subtasks.iter().enumerate() {
            assert_eq!(s.order, (i + 1) as u32);
            assert!(!s.description.is_empty(), "subtask {} has no description", s.order);
        }
    }

    #[test]
    fn equivalent_surface_formats_parse_identically() {
        let variants = [
            "1. Set up schema - Create migrations\n2. Add auth - Build JWT",
            "1) Set up schema - Create migrations\n2) Add auth - Build JWT",
            "**1.** Set up schema - Create migrations\n**2.** Add auth - Build JWT",
            "### 1. Set up schema - Create migrations\n### 2. Add auth - Build JWT",
            "- 1. Set up schema - Create migrations\n- 2. Add auth - Build JWT",
            "- **1.** Set up schema - Create migrations\n- **2.** Add auth - Build JWT",
            "Step 1: Set up schema - Create migrations\nStep 2: Add auth - Build JWT",
            "## Step 1: Set up schema - Create migrations\n## Step 2: Add auth - Build JWT",
        ];
        let reference = parse_subtasks(variants[0]).unwrap();
        for variant in &variants[1..] {
            let parsed = parse_subtasks(variant).unwrap();
            assert_eq!(parsed, reference, "variant diverged: {variant}");
        }
    }

    #[test]
    fn dash_variants_split_title() {
        for sep in [" - ", " – ", " — ", ": "] {
            let output = format!("1. Build parser{sep}handle all formats");
            let subtasks = parse_subtasks(&output).unwrap();
            assert_eq!(subtasks[0].title, "Build parser", "separator {sep:?}");
            assert_eq!(subtasks[0].description, "handle all formats");
        }
    }

    #[test]
    fn bold_wrapped_title_without_separator() {
        let subtasks = parse_subtasks("1. **Just a title**").unwrap();
        assert_eq!(subtasks[0].title, "Just a title");
        assert_eq!(subtasks[0].description, "");
    }

    #[test]
    fn continuation_lines_fold_into_description() {
        let output = "1. Build parser - first line\n\
                      \x20  continues with detail\n\
                      \x20  and more detail\n\
                      2. Next task - short";
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(
            subtasks[0].description,
            "first line continues with detail and more detail"
        );
        assert_eq!(subtasks[1].description, "short");
    }

    #[test]
    fn preamble_before_first_entry_is_ignored() {
        let output = "Here is the plan you asked for:\n\n1. Only task - do it";
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].title, "Only task");
    }

    #[test]
    fn duplicate_orders_keep_first_and_renumber() {
        let output = "1. First - a\n2. Second - b\n2. Impostor - c\n4. Fourth - d";
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 3);
        assert_eq!(subtasks[1].title, "Second");
        // renumbered contiguously: 1, 2, 3 despite the gap at 3
        let orders: Vec<u32> = subtasks.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(subtasks[2].title, "Fourth");
    }

    #[test]
    fn sequential_dependencies_assigned() {
        let subtasks = parse_subtasks("1. A - x\n2. B - y\n3. C - z").unwrap();
        assert!(subtasks[0].depends_on.is_empty());
        assert_eq!(subtasks[1].depends_on, vec![1]);
        assert_eq!(subtasks[2].depends_on, vec![2]);
    }

    #[test]
    fn empty_output_is_hard_error() {
        assert!(matches!(parse_subtasks(""), Err(PlanError::EmptyOutput)));
        assert!(matches!(parse_subtasks("   \n  "), Err(PlanError::EmptyOutput)));
    }

    #[test]
    fn no_subtasks_is_hard_error() {
        let result = parse_subtasks("I could not produce a plan, sorry.");
        assert!(matches!(result, Err(PlanError::NoSubtasks)));
    }
}
