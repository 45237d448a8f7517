//! The batch orchestrator: several operations as one atomic unit, with
//! output substitution between steps.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::context::BrokerContext;
use crate::error::BrokerErr;
use crate::error::Result;
use crate::ops;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::ops::TxnGuard;

/// One step of a batch.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BatchStep {
    /// Tool to dispatch (any broker tool, including `batch`).
    pub tool: String,

    /// Parameters, after `{{ref.field}}` substitution over string values.
    #[serde(default)]
    pub params: JsonValue,

    /// Name under which this step's outputs are captured; steps are
    /// always also addressable as `step1`, `step2`, ...
    #[serde(default)]
    pub id: Option<String>,
}

/// Parameters for `batch`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BatchParams {
    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<BatchStep>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn run_batch(ctx: &BrokerContext, params: BatchParams, deadline: &Deadline) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    if params.steps.is_empty() {
        return Err(BrokerErr::InvalidParams {
            tool: "batch".to_string(),
            message: "`steps` must not be empty".to_string(),
        });
    }
    let description = params
        .description
        .clone()
        .unwrap_or_else(|| format!("batch of {} step(s)", params.steps.len()));

    let txn = TxnGuard::begin(&ctx.journal, &description, &deadline)?;
    let mut outputs: HashMap<String, ToolOutput> = HashMap::new();
    let mut summaries = Vec::with_capacity(params.steps.len());

    for (index, step) in params.steps.iter().enumerate() {
        let step_no = index + 1;
        let wrap = |source: BrokerErr| BrokerErr::BatchStep {
            step: step_no,
            tool: step.tool.clone(),
            source: Box::new(source),
        };
        if let Err(e) = deadline.check() {
            return Err(txn.fail(wrap(e)));
        }
        let rendered = match render_params(step.params.clone(), &outputs) {
            Ok(rendered) => rendered,
            Err(e) => return Err(txn.fail(wrap(e))),
        };
        let output = match ops::dispatch_tool(ctx, &step.tool, rendered, &deadline) {
            Ok(output) => output,
            Err(e) => return Err(txn.fail(wrap(e))),
        };
        summaries.push(format!(
            "step {step_no} ({}): {}",
            step.tool,
            output.text.lines().next().unwrap_or("")
        ));
        if let Some(id) = &step.id {
            outputs.insert(id.clone(), output.clone());
        }
        outputs.insert(format!("step{step_no}"), output);
    }

    txn.commit()?;

    let last_fields = outputs
        .get(&format!("step{}", params.steps.len()))
        .map(|o| o.fields.clone())
        .unwrap_or_default();
    let mut text = format!("[BATCH OK: {description} | {} step(s)]", params.steps.len());
    for summary in &summaries {
        text.push_str(&format!("\n  {summary}"));
    }
    let mut result = ToolOutput::new(text);
    result.fields = last_fields;
    Ok(result)
}

/// Substitute `{{ref.field}}` placeholders in every string parameter.
/// `ref` is a step id or `stepN`; `field` one of that step's declared
/// outputs. Unknown references fail the step immediately; substituted
/// values are never re-scanned.
fn render_params(params: JsonValue, outputs: &HashMap<String, ToolOutput>) -> Result<JsonValue> {
    match params {
        JsonValue::String(text) => Ok(JsonValue::String(render_string(&text, outputs)?)),
        JsonValue::Array(items) => Ok(JsonValue::Array(
            items
                .into_iter()
                .map(|item| render_params(item, outputs))
                .collect::<Result<_>>()?,
        )),
        JsonValue::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key, render_params(value, outputs)?);
            }
            Ok(JsonValue::Object(rendered))
        }
        other => Ok(other),
    }
}

fn render_string(text: &str, outputs: &HashMap<String, ToolOutput>) -> Result<String> {
    // Non-greedy scan for {{ref.field}} occurrences.
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let placeholder = &after_open[..close];
        out.push_str(&resolve_placeholder(placeholder, outputs)?);
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_placeholder(placeholder: &str, outputs: &HashMap<String, ToolOutput>) -> Result<String> {
    let unknown = || BrokerErr::InvalidParams {
        tool: "batch".to_string(),
        message: format!("unknown substitution `{{{{{placeholder}}}}}`"),
    };
    let (reference, field) = placeholder.split_once('.').ok_or_else(unknown)?;
    let output = outputs.get(reference).ok_or_else(unknown)?;
    output.fields.get(field).cloned().ok_or_else(unknown)
}
