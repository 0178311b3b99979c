//! Run summary output

use colored::Colorize;

use crate::error::{HarnessError, Result};
use crate::models::{CheckKind, CheckStatus, PublishOutcome, RunSummary, Tally};

/// Output format (text, json)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(HarnessError::Runtime(format!(
                "unknown output format `{}` (expected text or json)",
                other
            ))),
        }
    }
}

pub fn render(summary: &RunSummary, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(summary)),
        OutputFormat::Json => render_json(summary),
    }
}

/// The human-readable results block
pub fn render_text(summary: &RunSummary) -> String {
    let mut lines = vec![
        "INFO: Results".bright_cyan().bold().to_string(),
        "-".repeat(40),
        format!("Tests skipped: {}", summary.skipped).yellow().to_string(),
        format!("Tests passed: {}", summary.passed).green().to_string(),
        format!("Tests failed: {}", summary.failed).red().to_string(),
    ];

    if summary.skipped < Tally::TOTAL {
        lines.push(String::new());
        for kind in CheckKind::ALL {
            let status = match summary.checks.status(kind) {
                CheckStatus::Passed => "PASSED".green(),
                CheckStatus::Failed => "FAILED".red(),
                CheckStatus::Skipped => "SKIPPED".yellow(),
            };
            lines.push(format!("  {:<6} {}", kind.as_str(), status));
        }
    }

    if let Some(stage) = &summary.aborted_at {
        lines.push(String::new());
        lines.push(format!("Run aborted during {}", stage).red().to_string());
    }

    match summary.publish {
        PublishOutcome::Pushed => lines.push("Image pushed to the registry".green().to_string()),
        PublishOutcome::Failed => lines.push("Image push failed".red().to_string()),
        PublishOutcome::NotOffered | PublishOutcome::Declined => {}
    }

    if !summary.warnings.is_empty() {
        lines.push(String::new());
        lines.push("Cleanup warnings:".yellow().bold().to_string());
        for warning in &summary.warnings {
            lines.push(format!("  {}: {}", warning.step, warning.message));
            if let Some(remediation) = &warning.remediation {
                lines.push(format!("    {}", remediation));
            }
        }
    }

    lines.join("\n")
}

pub fn render_json(summary: &RunSummary) -> Result<String> {
    serde_json::to_string_pretty(summary)
        .map_err(|e| HarnessError::Runtime(format!("failed to serialize summary: {}", e)))
}

/// 0 unless `strict` and some check did not pass
pub fn exit_code(summary: &RunSummary, strict: bool) -> i32 {
    if strict && !summary.all_passed() {
        1
    } else {
        0
    }
}
