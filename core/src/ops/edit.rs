//! The edit operation: token-gated line edits with transactional backup.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::Deserialize;
use similar::TextDiff;

use crate::context::BrokerContext;
use crate::digest;
use crate::encoding;
use crate::encoding::Charset;
use crate::error::AccessError;
use crate::error::BrokerErr;
use crate::error::ContentError;
use crate::error::Result;
use crate::lines::payload_lines;
use crate::ops;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::ops::TxnGuard;
use crate::sandbox::SafePath;
use crate::token::TokenValidity;
use crate::tracker::FileSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EditOpKind {
    Replace,
    Delete,
    InsertAfter,
    InsertBefore,
}

/// One edit within a file. `replace` and `delete` address
/// `start_line..=end_line`; the inserts anchor on `line`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EditOperation {
    pub op: EditOpKind,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub content: Option<String>,
    /// When set, must fuzzily match the current content of the addressed
    /// range (whitespace runs collapsed, line endings normalised).
    #[serde(default)]
    pub expected_content: Option<String>,
}

/// Edits to a single file within a multi-file batch.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FileEdit {
    pub path: String,
    /// Token from a prior read covering every addressed line.
    pub access_token: String,
    pub operations: Vec<EditOperation>,
    /// Re-encode with this charset instead of the file's current one.
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Parameters for `edit_file`: either a single replacement (`path` +
/// `start_line` + `content`), a batch of operations on one file, or a
/// multi-file batch under `edits`. All forms are applied in one
/// transaction.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EditFileParams {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub operations: Option<Vec<EditOperation>>,
    #[serde(default)]
    pub edits: Option<Vec<FileEdit>>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn edit_file(ctx: &BrokerContext, params: EditFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    let file_edits = normalize_params(params)?;

    let mut targets: Vec<(SafePath, FileEdit)> = Vec::with_capacity(file_edits.len());
    for edit in file_edits {
        let safe = ctx.sandbox.sanitize(&edit.path, true)?;
        targets.push((safe, edit));
    }

    let description = if targets.len() == 1 {
        format!("edit {}", targets[0].0.display_name())
    } else {
        format!("edit {} files", targets.len())
    };
    let txn = TxnGuard::begin(&ctx.journal, &description, &deadline)?;
    let lock_paths: Vec<PathBuf> = targets.iter().map(|(s, _)| s.to_path_buf()).collect();
    let _locks = match ctx.locks.acquire(lock_paths, &deadline) {
        Ok(locks) => locks,
        Err(e) => return Err(txn.fail(e)),
    };

    let mut results = Vec::with_capacity(targets.len());
    for (safe, edit) in &targets {
        match apply_file_edit(ctx, safe, edit, &deadline) {
            Ok(result) => results.push(result),
            Err(e) => return Err(txn.fail(e)),
        }
    }
    txn.commit()?;

    let mut sections = Vec::new();
    for result in &results {
        if result.external {
            sections.push(ops::EXTERNAL_BANNER.to_string());
        }
        sections.push(format!(
            "[EDITED: {} | LINES: {} total | ENCODING: {} | CRC32C: {}]",
            result.name,
            result.line_count,
            result.charset_label,
            digest::crc32c_hex(result.crc)
        ));
        for (start, end, token) in &result.tokens {
            sections.push(ops::access_line(*start, *end, token));
        }
    }
    sections.push("[HINT: previous tokens for these files are now stale; use the fresh ones above]".to_string());

    let first = &results[0];
    let union_token = first
        .tokens
        .first()
        .map(|(_, _, t)| t.clone())
        .unwrap_or_default();
    let all_tokens: Vec<String> = first.tokens.iter().map(|(_, _, t)| t.clone()).collect();
    Ok(ToolOutput::new(sections.join("\n"))
        .with_field("token", union_token)
        .with_field("tokens", all_tokens.join(","))
        .with_field("crc32c", digest::crc32c_hex(first.crc))
        .with_field("path", first.name.clone())
        .with_field("line_count", first.line_count.to_string()))
}

fn normalize_params(params: EditFileParams) -> Result<Vec<FileEdit>> {
    let invalid = |message: &str| BrokerErr::InvalidParams {
        tool: "edit_file".to_string(),
        message: message.to_string(),
    };
    if let Some(edits) = params.edits {
        if edits.is_empty() {
            return Err(invalid("`edits` must not be empty"));
        }
        return Ok(edits);
    }
    let path = params.path.ok_or_else(|| invalid("`path` is required"))?;
    let access_token = params
        .access_token
        .ok_or_else(|| BrokerErr::from(AccessError::MissingToken(PathBuf::from(&path))))?;
    let operations = match params.operations {
        Some(operations) if !operations.is_empty() => operations,
        Some(_) => return Err(invalid("`operations` must not be empty")),
        None => {
            let start_line = params
                .start_line
                .ok_or_else(|| invalid("`start_line` is required for a single replacement"))?;
            let content = params
                .content
                .ok_or_else(|| invalid("`content` is required for a single replacement"))?;
            vec![EditOperation {
                op: EditOpKind::Replace,
                start_line: Some(start_line),
                end_line: params.end_line.or(Some(start_line)),
                line: None,
                content: Some(content),
                expected_content: params.expected_content,
            }]
        }
    };
    Ok(vec![FileEdit {
        path,
        access_token,
        operations,
        encoding: params.encoding,
    }])
}

/// An operation resolved against the current file state.
struct ResolvedOp {
    kind: EditOpKind,
    /// Anchor of the edit: the replaced/deleted range, or the insertion
    /// anchor line for both insert kinds.
    start: u32,
    end: u32,
    lines: Vec<String>,
    wants_trailing_newline: bool,
}

struct FileEditResult {
    name: String,
    crc: u32,
    line_count: u32,
    charset_label: &'static str,
    tokens: Vec<(u32, u32, String)>,
    external: bool,
}

fn apply_file_edit(
    ctx: &BrokerContext,
    safe: &SafePath,
    edit: &FileEdit,
    deadline: &Deadline,
) -> Result<FileEditResult> {
    let forced = match edit.encoding.as_deref() {
        Some(label) => Some(Charset::for_label(label)?),
        None => ctx.tracker.snapshot(safe.as_path()).map(|s| s.charset),
    };
    let mut file = ops::load_text_file(ctx, safe, forced)?;
    let total = file.buffer.line_count();

    let token = ctx.tokens.decode(&edit.access_token, safe)?;
    let own_range = file.buffer.range(token.start_line, token.end_line);
    if let TokenValidity::Stale(reason) = token.validate(own_range, total) {
        return Err(AccessError::StaleToken {
            path: safe.to_path_buf(),
            reason,
        }
        .into());
    }

    let external = ops::note_external_change(ctx, safe, &file);

    let mut resolved = Vec::with_capacity(edit.operations.len());
    for op in &edit.operations {
        resolved.push(resolve_op(safe, op, total)?);
    }

    // Coverage and expectations are judged against the pre-edit state.
    for op in &resolved {
        let (start, end) = coverage_of(op, total);
        if !token.covers(start, end) {
            return Err(AccessError::TokenDoesNotCover {
                path: safe.to_path_buf(),
                held_start: token.start_line,
                held_end: token.end_line,
                start,
                end,
            }
            .into());
        }
    }
    for (op, raw) in resolved.iter().zip(&edit.operations) {
        if let Some(expected) = &raw.expected_content {
            check_expected(safe, &file.buffer, op, expected)?;
        }
    }

    ctx.journal.backup(safe.as_path(), &file.bytes)?;

    // Apply bottom-up so earlier edits cannot shift later line indices.
    let mut order: Vec<usize> = (0..resolved.len()).collect();
    order.sort_by(|&a, &b| resolved[b].start.cmp(&resolved[a].start));
    for &i in &order {
        apply_op(&mut file.buffer, &resolved[i], total);
    }

    let new_total = file.buffer.line_count();
    let rendered = file.buffer.render();
    deadline.check()?;
    let (after_crc, after_bytes) = encoding::write_text(safe.as_path(), &rendered, file.decoded.charset)?;
    ctx.journal.record_mutation(
        safe.as_path(),
        &after_bytes,
        total,
        new_total,
        &format!("{} operation(s) on {}", resolved.len(), safe.display_name()),
    )?;

    let mut token_ranges = post_edit_ranges(&resolved, new_total);
    if token_ranges.is_empty() {
        token_ranges.push(fallback_range(&resolved, new_total));
    }
    let tokens = token_ranges
        .iter()
        .map(|&(start, end)| {
            let content = file.buffer.range(start, end);
            let issued = ctx.tokens.issue(safe, start, end, content, new_total);
            (start, end, ctx.tokens.encode(&issued))
        })
        .collect();

    ctx.tracker.update(
        safe.as_path(),
        FileSnapshot::new(after_bytes, after_crc, file.decoded.charset, new_total),
    );
    ctx.symbols.cache.invalidate(safe.as_path());

    Ok(FileEditResult {
        name: safe.display_name(),
        crc: after_crc,
        line_count: new_total,
        charset_label: file.decoded.charset.label(),
        tokens,
        external,
    })
}

fn resolve_op(safe: &SafePath, op: &EditOperation, total: u32) -> Result<ResolvedOp> {
    let invalid = |message: String| BrokerErr::InvalidParams {
        tool: "edit_file".to_string(),
        message,
    };
    let out_of_range = |line: u32| {
        BrokerErr::from(ContentError::LineOutOfRange {
            path: safe.to_path_buf(),
            line,
            total,
        })
    };
    let (lines, wants_trailing_newline) = match &op.content {
        Some(content) => payload_lines(content),
        None => (Vec::new(), false),
    };
    match op.op {
        EditOpKind::Replace | EditOpKind::Delete => {
            let start = op
                .start_line
                .or(op.line)
                .ok_or_else(|| invalid("`start_line` is required".to_string()))?;
            let end = op.end_line.unwrap_or(start);
            if op.op == EditOpKind::Replace && op.content.is_none() {
                return Err(invalid("`content` is required for replace".to_string()));
            }
            if total == 0 {
                if start > 1 {
                    return Err(out_of_range(start));
                }
            } else if start == 0 || start > total || start > end || end > total {
                return Err(out_of_range(if start == 0 || start > total { start } else { end }));
            }
            Ok(ResolvedOp {
                kind: op.op,
                start,
                end: end.min(total.max(start)),
                lines,
                wants_trailing_newline,
            })
        }
        EditOpKind::InsertAfter | EditOpKind::InsertBefore => {
            let line = op
                .line
                .or(op.start_line)
                .ok_or_else(|| invalid("`line` is required for inserts".to_string()))?;
            if op.content.is_none() {
                return Err(invalid("`content` is required for inserts".to_string()));
            }
            let max_anchor = if op.op == EditOpKind::InsertAfter { total } else { total.max(1) };
            if line > max_anchor {
                return Err(out_of_range(line));
            }
            if op.op == EditOpKind::InsertBefore && line == 0 {
                return Err(out_of_range(line));
            }
            Ok(ResolvedOp {
                kind: op.op,
                start: line,
                end: line,
                lines,
                wants_trailing_newline,
            })
        }
    }
}

/// The pre-edit lines a token must cover for this operation.
fn coverage_of(op: &ResolvedOp, total: u32) -> (u32, u32) {
    if total == 0 {
        return (0, 0);
    }
    match op.kind {
        EditOpKind::Replace | EditOpKind::Delete => (op.start, op.end),
        EditOpKind::InsertAfter => {
            let anchor = op.start.max(1);
            (anchor, anchor)
        }
        EditOpKind::InsertBefore => (op.start, op.start),
    }
}

fn check_expected(
    safe: &SafePath,
    buffer: &crate::lines::LineBuffer,
    op: &ResolvedOp,
    expected: &str,
) -> Result<()> {
    if !matches!(op.kind, EditOpKind::Replace | EditOpKind::Delete) {
        return Ok(());
    }
    let actual = buffer.range(op.start, op.end).join("\n");
    if fuzzy_eq(expected, &actual) {
        return Ok(());
    }
    let diff = TextDiff::from_lines(expected, &actual)
        .unified_diff()
        .context_radius(1)
        .to_string();
    Err(ContentError::ExpectedMismatch {
        path: safe.to_path_buf(),
        actual,
        diff,
    }
    .into())
}

fn apply_op(buffer: &mut crate::lines::LineBuffer, op: &ResolvedOp, pre_total: u32) {
    // Trailing-newline rule: the original file's final-newline state is
    // preserved; a payload ending in `\n` on a last-line edit adds one.
    match op.kind {
        EditOpKind::Replace => {
            if pre_total == 0 {
                buffer.replace(1, 1, op.lines.clone());
                buffer.set_trailing_newline(op.wants_trailing_newline);
                return;
            }
            let touches_last_line = op.end >= pre_total;
            buffer.replace(op.start, op.end, op.lines.clone());
            if touches_last_line && op.wants_trailing_newline {
                buffer.set_trailing_newline(true);
            }
        }
        EditOpKind::Delete => {
            buffer.delete(op.start, op.end);
        }
        EditOpKind::InsertAfter => {
            if pre_total == 0 {
                buffer.insert_after(0, op.lines.clone());
                buffer.set_trailing_newline(op.wants_trailing_newline);
                return;
            }
            let appends_at_end = op.start >= pre_total;
            buffer.insert_after(op.start, op.lines.clone());
            if appends_at_end && op.wants_trailing_newline {
                buffer.set_trailing_newline(true);
            }
        }
        EditOpKind::InsertBefore => {
            if pre_total == 0 {
                buffer.insert_before(1, op.lines.clone());
                buffer.set_trailing_newline(op.wants_trailing_newline);
                return;
            }
            buffer.insert_before(op.start, op.lines.clone());
        }
    }
}

/// Where each operation's payload landed after all edits were applied,
/// in ascending order; deletions contribute no range.
fn post_edit_ranges(resolved: &[ResolvedOp], new_total: u32) -> Vec<(u32, u32)> {
    let mut order: Vec<&ResolvedOp> = resolved.iter().collect();
    order.sort_by_key(|op| op.start);
    let mut delta: i64 = 0;
    let mut ranges = Vec::new();
    for op in order {
        let len = op.lines.len() as i64;
        match op.kind {
            EditOpKind::Replace => {
                let start = (op.start as i64 + delta).max(1);
                if len > 0 {
                    ranges.push(clamp(start, start + len - 1, new_total));
                }
                delta += len - (op.end as i64 - op.start as i64 + 1);
            }
            EditOpKind::Delete => {
                delta -= op.end as i64 - op.start as i64 + 1;
            }
            EditOpKind::InsertAfter => {
                let start = op.start as i64 + delta + 1;
                if len > 0 {
                    ranges.push(clamp(start, start + len - 1, new_total));
                }
                delta += len;
            }
            EditOpKind::InsertBefore => {
                let start = (op.start as i64 + delta).max(1);
                if len > 0 {
                    ranges.push(clamp(start, start + len - 1, new_total));
                }
                delta += len;
            }
        }
    }
    ranges.retain(|(s, e)| *s >= 1 && s <= e);
    ranges
}

fn clamp(start: i64, end: i64, new_total: u32) -> (u32, u32) {
    let start = start.clamp(1, new_total.max(1) as i64) as u32;
    let end = end.clamp(start as i64, new_total.max(1) as i64) as u32;
    (start, end)
}

/// Token range when every operation was a deletion: the line now at the
/// deletion point, or the empty-file range.
fn fallback_range(resolved: &[ResolvedOp], new_total: u32) -> (u32, u32) {
    if new_total == 0 {
        return (0, 0);
    }
    let anchor = resolved
        .iter()
        .map(|op| op.start)
        .min()
        .unwrap_or(1)
        .clamp(1, new_total);
    (anchor, anchor)
}

/// The committed fuzzy rule: normalise `\r\n`/`\r` to `\n`, collapse every
/// run of ASCII whitespace to a single space, nothing else.
fn fuzzy_eq(expected: &str, actual: &str) -> bool {
    fn normalise(text: &str) -> String {
        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        let mut out = String::with_capacity(unified.len());
        let mut in_whitespace = false;
        for ch in unified.chars() {
            if ch.is_ascii_whitespace() {
                if !in_whitespace {
                    out.push(' ');
                }
                in_whitespace = true;
            } else {
                out.push(ch);
                in_whitespace = false;
            }
        }
        out
    }
    normalise(expected) == normalise(actual)
}
