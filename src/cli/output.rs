//! CLI output formatting

use crate::controller::{PublishResult, SubStepOutcome};
use crate::core::graph::{StageGraph, StageKind};
use crate::core::identity::{ResourceNameSet, TeardownPlan};
use crate::persistence::{PublishOutcome, PublishRecord};
use crate::validation::CheckFailure;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while waiting on the workflow engine
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a publish outcome for display
pub fn format_outcome(outcome: PublishOutcome) -> String {
    match outcome {
        PublishOutcome::Published => style("PUBLISHED").green().to_string(),
        PublishOutcome::Unchanged => style("UNCHANGED").dim().to_string(),
        PublishOutcome::Failed => style("FAILED").red().to_string(),
    }
}

pub fn format_publish_result(graph: &str, result: &PublishResult) -> String {
    match result {
        PublishResult::Published { version, digest } => format!(
            "{} {} published at version {} ({})",
            CHECK,
            style(graph).bold(),
            style(version).cyan(),
            style(&digest[..digest.len().min(12)]).dim()
        ),
        PublishResult::Unchanged { version } => format!(
            "{} {} unchanged at version {}",
            INFO,
            style(graph).bold(),
            style(version).cyan()
        ),
        PublishResult::Failed { error, retained } => format!(
            "{} {} was not published: {}\n   continuing with {}",
            WARN,
            style(graph).bold(),
            style(crate::core::secrets::redact(&error.to_string())).red(),
            retained
                .as_ref()
                .map(|v| format!("version {}", v))
                .unwrap_or_else(|| "no live graph".to_string())
        ),
    }
}

pub fn format_sub_step(label: &str, outcome: &SubStepOutcome) -> String {
    let icon = match outcome {
        SubStepOutcome::Succeeded => CHECK,
        SubStepOutcome::Failed(_) => CROSS,
        SubStepOutcome::Skipped(_) => SKIP,
    };
    format!("{} {}: {}", icon, style(label).bold(), outcome)
}

/// One line per stage, in execution order
pub fn format_graph(graph: &StageGraph) -> String {
    let mut lines = vec![format!(
        "{} {} ({} stages, service account {})",
        ROCKET,
        style(&graph.name).bold(),
        graph.stages.len(),
        style(&graph.service_account).dim()
    )];
    for (index, stage) in graph.stages.iter().enumerate() {
        let kind = match &stage.kind {
            StageKind::Build => "build".to_string(),
            StageKind::SelfDeploy => "self-deploy".to_string(),
            StageKind::Deploy { environment } => format!("deploy {}", environment),
            StageKind::Test { environment } => format!("test {}", environment),
        };
        lines.push(format!(
            "  {}. {} {}",
            index + 1,
            style(&stage.name).cyan(),
            style(format!("[{}]", kind)).dim()
        ));
    }
    lines.join("\n")
}

pub fn format_names(names: &ResourceNameSet) -> String {
    let mut lines = vec![format!("{} Resources of {}", INFO, style(names.instance()).bold())];
    for (category, name) in names.iter() {
        lines.push(format!("  {:<16} {}", category.to_string(), style(name).cyan()));
    }
    lines.join("\n")
}

pub fn format_teardown(plan: &TeardownPlan) -> String {
    let mut lines = vec![format!(
        "{} Teardown of {} removes, in order:",
        WARN,
        style(&plan.instance).bold()
    )];
    for entry in &plan.entries {
        lines.push(format!("  {}/{}", style(entry.kind).dim(), entry.name));
    }
    lines.join("\n")
}

pub fn format_check_failure(failure: &CheckFailure) -> String {
    format!("{} {}", CROSS, failure)
}

/// Format a history record for display
pub fn format_record(record: &PublishRecord) -> String {
    format!(
        "{} {} {} {} {}",
        style(record.recorded_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        style(&record.graph_name).bold(),
        format_outcome(record.outcome),
        record
            .version
            .as_deref()
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "-".to_string()),
        record
            .commit_id
            .as_deref()
            .map(|c| style(&c[..c.len().min(8)]).dim().to_string())
            .unwrap_or_default()
    )
}

/// Format output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
