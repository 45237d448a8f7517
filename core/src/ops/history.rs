//! Undo, redo, checkpoints and journal inspection as operations.
//!
//! The journal restores bytes; this layer re-syncs the external-change
//! snapshots for every affected path afterwards, so a restore is never
//! misreported as an external edit on the next read.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::BrokerContext;
use crate::error::Result;
use crate::journal::UndoReport;
use crate::ops::ToolOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAction {
    Create,
    Rollback,
}

/// Parameters for `checkpoint`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CheckpointParams {
    pub action: CheckpointAction,
    /// Checkpoint name; `rollback` undoes every transaction committed
    /// after the checkpoint was created.
    pub name: String,
}

/// Parameters for `journal`: without `path` the full transaction listing,
/// with `path` the per-file history.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct JournalParams {
    #[serde(default)]
    pub path: Option<String>,
}

pub fn undo(ctx: &BrokerContext) -> Result<ToolOutput> {
    let report = ctx.journal.undo()?;
    ctx.refresh_snapshots(&report.affected);
    Ok(report_output("UNDO", &report))
}

pub fn redo(ctx: &BrokerContext) -> Result<ToolOutput> {
    let report = ctx.journal.redo()?;
    ctx.refresh_snapshots(&report.affected);
    Ok(report_output("REDO", &report))
}

pub fn checkpoint(ctx: &BrokerContext, params: CheckpointParams) -> Result<ToolOutput> {
    match params.action {
        CheckpointAction::Create => {
            ctx.journal.checkpoint(&params.name);
            Ok(ToolOutput::new(format!("[CHECKPOINT CREATED: {}]", params.name))
                .with_field("name", params.name))
        }
        CheckpointAction::Rollback => {
            let reports = ctx.journal.rollback_to(&params.name)?;
            for report in &reports {
                ctx.refresh_snapshots(&report.affected);
            }
            let mut text = format!(
                "[ROLLED BACK TO: {} | {} transaction(s) undone]",
                params.name,
                reports.len()
            );
            for report in &reports {
                text.push_str(&format!("\n  {}", report.description));
            }
            Ok(ToolOutput::new(text).with_field("undone", reports.len().to_string()))
        }
    }
}

pub fn journal(ctx: &BrokerContext, params: JournalParams) -> Result<ToolOutput> {
    match params.path {
        Some(path) => {
            let safe = ctx.sandbox.sanitize(&path, false)?;
            let history = ctx.journal.history_of(safe.as_path());
            let mut text = format!("[HISTORY: {} | {} event(s)]", safe.display_name(), history.len());
            for event in &history {
                text.push_str(&format!("\n  {event}"));
            }
            Ok(ToolOutput::new(text).with_field("events", history.len().to_string()))
        }
        None => Ok(ToolOutput::new(ctx.journal.journal_text())),
    }
}

fn report_output(verb: &str, report: &UndoReport) -> ToolOutput {
    let mut text = format!(
        "[{verb} OK: {} | {} file(s) affected]",
        report.description,
        report.affected.len()
    );
    for path in &report.affected {
        text.push_str(&format!("\n  {}", path.display()));
    }
    ToolOutput::new(text).with_field("affected", report.affected.len().to_string())
}
