//! Tool registry: JSON schemas for every broker tool, generated from the
//! core parameter structs.

use filebroker_core::ops::batch::BatchParams;
use filebroker_core::ops::edit::EditFileParams;
use filebroker_core::ops::file_manage::ManageFileParams;
use filebroker_core::ops::history::CheckpointParams;
use filebroker_core::ops::history::JournalParams;
use filebroker_core::ops::read::ReadFileParams;
use filebroker_core::ops::replace::ProjectReplaceParams;
use filebroker_core::ops::search::SearchParams;
use mcp_types::Tool;
use mcp_types::ToolInputSchema;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use serde::Deserialize;

/// `undo` and `redo` take no parameters.
#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct NoParams {}

/// All tools, in the order `filebroker_core::ops::TOOL_NAMES` fixes.
pub(crate) fn all_tools() -> Vec<Tool> {
    vec![
        tool_for::<ReadFileParams>(
            "read_file",
            "Read lines from a file and obtain the access token edits require. \
             Exactly one selector: line, start_line/end_line, ranges, context_pattern or symbol.",
        ),
        tool_for::<EditFileParams>(
            "edit_file",
            "Edit lines of one or more files. Requires an access token from a prior read \
             covering the changed lines; all changes are journaled and undoable.",
        ),
        tool_for::<ManageFileParams>(
            "manage_file",
            "Create, move, rename or delete a file inside the project roots.",
        ),
        tool_for::<SearchParams>(
            "search",
            "Search the project: grep file contents, find files by glob, list a directory \
             with read/match markers, or draw the tree structure.",
        ),
        tool_for::<ProjectReplaceParams>(
            "project_replace",
            "Literal or regex substitution across the project in one atomic transaction.",
        ),
        tool_for::<BatchParams>(
            "batch",
            "Run several tool calls as one atomic unit with {{step.field}} substitution; \
             everything rolls back if any step fails.",
        ),
        tool_for::<NoParams>("undo", "Undo the most recent committed transaction."),
        tool_for::<NoParams>("redo", "Re-apply the most recently undone transaction."),
        tool_for::<CheckpointParams>(
            "checkpoint",
            "Create a named checkpoint, or roll the workspace back to one.",
        ),
        tool_for::<JournalParams>(
            "journal",
            "Show the transaction journal, or the change history of one file.",
        ),
    ]
}

fn tool_for<T: JsonSchema>(name: &str, description: &str) -> Tool {
    let schema = SchemaSettings::draft2019_09()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false;
        })
        .into_generator()
        .into_root_schema_for::<T>();
    let input_schema = serde_json::to_value(&schema)
        .ok()
        .and_then(|value| serde_json::from_value::<ToolInputSchema>(value).ok())
        .unwrap_or(ToolInputSchema {
            r#type: "object".to_string(),
            properties: None,
            required: None,
        });
    Tool {
        name: name.to_string(),
        input_schema,
        description: Some(description.to_string()),
        annotations: None,
    }
}
