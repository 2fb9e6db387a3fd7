//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.
//! Values of `NoEcho` parameters are masked wherever they appear.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::ApplyReport;
use crate::error::{ExecutionError, StrataError};
use crate::planner::{ActionKind, FieldChange, Plan, PlanKind, PlanSummary, PlannedAction};
use crate::state::{LeaseInfo, StateSnapshot};
use crate::template::Value;

use super::commands::OutputFormat;

const MASK: &str = "****";

/// Output formatter for CLI.
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
    /// Strings to mask.
    secrets: Vec<String>,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "")]
    symbol: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self {
            format,
            secrets: Vec::new(),
        }
    }

    /// Sets the values to mask.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        self
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => self.json(&PlanJson::from(plan)),
            OutputFormat::Text => self.format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(&self, plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the template.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = match plan.kind {
            PlanKind::Apply => "Plan",
            PlanKind::Destroy => "Destroy plan",
        };
        let _ = writeln!(output, "\n{}", title.bold());
        if !plan.template_hash.is_empty() {
            let _ = writeln!(output, "   Template hash: {}", short_hash(&plan.template_hash));
        }
        let _ = writeln!(output, "   State version: {}\n", plan.state_version);

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .filter(|a| a.kind.is_change())
            .map(|a| PlanActionRow {
                symbol: Self::format_action_kind(a.kind),
                resource: a.logical_name.clone(),
                resource_type: a.resource_type.clone(),
                changes: Self::change_summary(a),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(
                    output,
                    "\n  {} {}",
                    Self::format_action_kind(action.kind),
                    action.logical_name.bold()
                );
                for change in &action.changes {
                    output.push_str(&self.format_change(change));
                }
            }
        }

        if !plan.outputs.is_empty() && plan.kind == PlanKind::Apply {
            output.push_str("\nOutputs:\n");
            for (name, value) in &plan.outputs {
                let _ = writeln!(output, "   {name} = {}", self.mask(&value.to_string()));
            }
        }

        output.push('\n');
        output.push_str(&Self::format_summary(&plan.summary()));
        output
    }

    fn format_change(&self, change: &FieldChange) -> String {
        let render = |value: Option<&Value>| {
            value.map_or_else(|| String::from("(absent)"), |v| self.mask(&v.to_string()))
        };
        let marker = if change.replacement {
            " (forces replacement)".red().to_string()
        } else {
            String::new()
        };
        format!(
            "      {}: {} -> {}{marker}\n",
            change.field,
            render(change.before.as_ref()),
            render(change.after.as_ref())
        )
    }

    fn change_summary(action: &PlannedAction) -> String {
        match action.kind {
            ActionKind::Create | ActionKind::Delete | ActionKind::NoOp => String::new(),
            ActionKind::Update | ActionKind::Replace => {
                let fields: Vec<&str> = action.changes.iter().map(|c| c.field.as_str()).collect();
                truncate(&fields.join(", "), 48)
            }
        }
    }

    fn format_summary(summary: &PlanSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged\n",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.replaces.to_string().magenta(),
            summary.deletes.to_string().red(),
            summary.unchanged
        )
    }

    /// Formats the result of `validate`.
    #[must_use]
    pub fn format_validation(&self, plan: &Plan) -> String {
        let resources = plan.actions.len();
        match self.format {
            OutputFormat::Json => self.json(&serde_json::json!({
                "valid": true,
                "resources": resources,
                "outputs": plan.outputs.keys().collect::<Vec<_>>(),
            })),
            OutputFormat::Text => format!(
                "{} Template is valid ({resources} active resources, {} outputs)\n",
                "✓".green(),
                plan.outputs.len()
            ),
        }
    }

    /// Formats the result of a successful apply or destroy.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => self.json(report),
            OutputFormat::Text => {
                let verb = match report.kind {
                    PlanKind::Apply => "Apply",
                    PlanKind::Destroy => "Destroy",
                };
                let mut output = format!("{} {verb} complete\n\n", "✓".green());
                output.push_str(&Self::format_summary(&report.summary));
                let _ = writeln!(output, "State version: {}", report.state_version);
                if !report.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&self.format_output_lines(&report.outputs));
                }
                output
            }
        }
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => self.json(outputs),
            OutputFormat::Text if outputs.is_empty() => String::from("No outputs.\n"),
            OutputFormat::Text => self.format_output_lines(outputs),
        }
    }

    fn format_output_lines(&self, outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let _ = writeln!(output, "   {} = {}", name.cyan(), self.mask(&value.to_string()));
        }
        output
    }

    /// Formats the state snapshot and lease.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lease: Option<&LeaseInfo>) -> String {
        match self.format {
            OutputFormat::Json => self.json(&serde_json::json!({
                "state": state,
                "lease": lease,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\n{}\n", "State".bold());
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Template hash: {}", short_hash(&state.template_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                match lease {
                    Some(lease) => {
                        let _ = writeln!(
                            output,
                            "   Lease: held by {} until {}",
                            lease.holder, lease.expires_at
                        );
                    }
                    None => output.push_str("   Lease: free\n"),
                }

                if state.resources.is_empty() {
                    output.push_str("\n   No resources.\n");
                } else {
                    let mut records: Vec<_> = state.resources.values().collect();
                    records.sort_by_key(|r| r.index);
                    let rows: Vec<ResourceRow> = records
                        .into_iter()
                        .map(|r| ResourceRow {
                            name: r.logical_name.clone(),
                            resource_type: r.resource_type.clone(),
                            physical_id: truncate(&r.physical_id, 40),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an error, including failed steps and indeterminate resources.
    #[must_use]
    pub fn format_error(&self, error: &StrataError) -> String {
        let message = self.mask(&error.to_string());
        match self.format {
            OutputFormat::Json => self.json(&serde_json::json!({
                "status": "error",
                "exit_code": error.exit_code(),
                "message": message,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} {message}\n", "✗".red());
                if let StrataError::Execution(
                    ExecutionError::RolledBack { failures, .. } | ExecutionError::RollbackIncomplete { failures, .. },
                ) = error
                {
                    for failure in failures {
                        let _ = writeln!(
                            output,
                            "   - {} {}: {}",
                            failure.operation,
                            failure.resource,
                            self.mask(&failure.message)
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => self.json(&serde_json::json!({ "status": "success", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "✓".green()),
        }
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => self.json(&serde_json::json!({ "status": "warning", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "⚠".yellow()),
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        let label = format!("{} {kind}", kind.symbol());
        match kind {
            ActionKind::Create => label.green().to_string(),
            ActionKind::Update => label.yellow().to_string(),
            ActionKind::Replace => label.magenta().to_string(),
            ActionKind::Delete => label.red().to_string(),
            ActionKind::NoOp => label.dimmed().to_string(),
        }
    }

    fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }

    fn mask_json(&self, value: serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.mask(&s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(|v| self.mask_json(v)).collect())
            }
            serde_json::Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, self.mask_json(v))).collect())
            }
            other => other,
        }
    }

    fn json(&self, value: &impl Serialize) -> String {
        let value = serde_json::to_value(value).unwrap_or_default();
        let mut text = serde_json::to_string_pretty(&self.mask_json(value)).unwrap_or_default();
        text.push('\n');
        text
    }
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    kind: PlanKind,
    template_hash: &'a str,
    state_version: u64,
    summary: PlanSummary,
    actions: Vec<&'a PlannedAction>,
    outputs: &'a BTreeMap<String, Value>,
}

impl<'a> From<&'a Plan> for PlanJson<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            kind: plan.kind,
            template_hash: &plan.template_hash,
            state_version: plan.state_version,
            summary: plan.summary(),
            actions: plan.actions.iter().filter(|a| a.kind.is_change()).collect(),
            outputs: &plan.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-physical-id", 10), "a-very-...");
        assert_eq!(truncate("ééééé", 4), "é...");
    }

    #[test]
    fn test_masks_secrets_in_text_and_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json)
            .with_secrets(vec![String::from("hunter2")]);
        let outputs: BTreeMap<String, Value> = [
            (String::from("Dsn"), Value::string("postgres://admin:hunter2@db")),
            (String::from("Port"), Value::integer(5432)),
        ]
        .into_iter()
        .collect();

        let json = formatter.format_outputs(&outputs);
        assert!(!json.contains("hunter2"));
        assert!(json.contains("postgres://admin:****@db"));
        assert!(json.contains("5432"));

        let text = OutputFormatter::new(OutputFormat::Text)
            .with_secrets(vec![String::from("hunter2")])
            .format_outputs(&outputs);
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_error_lists_failed_steps() {
        colored::control::set_override(false);
        let error = StrataError::from(ExecutionError::RolledBack {
            failures: vec![crate::error::StepFailure {
                resource: String::from("C"),
                operation: String::from("create"),
                message: String::from("quota exceeded"),
            }],
            cancelled: false,
        });
        let text = OutputFormatter::new(OutputFormat::Text).format_error(&error);
        assert!(text.contains("create C: quota exceeded"));

        let json = OutputFormatter::new(OutputFormat::Json).format_error(&error);
        assert!(json.contains("\"exit_code\": 2"));
    }

    #[test]
    fn test_empty_outputs() {
        let text = OutputFormatter::new(OutputFormat::Text).format_outputs(&BTreeMap::new());
        assert_eq!(text, "No outputs.\n");
    }
}
