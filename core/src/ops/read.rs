//! The read operation: the only source of line-access tokens.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::BrokerContext;
use crate::encoding::Charset;
use crate::error::ContentError;
use crate::error::Result;
use crate::ops;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::sandbox::SafePath;
use crate::symbols;
use crate::symbols::SymbolKind;
use crate::token::TokenValidity;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
pub struct LineRange {
    /// First line of the range, 1-based inclusive.
    pub start_line: u32,
    /// Last line of the range, inclusive; clamped to the file length.
    pub end_line: u32,
}

/// Parameters for `read_file`. Exactly one access selector must be
/// supplied: `line`, `start_line`/`end_line`, `ranges`, `context_pattern`
/// or `symbol`; whole-file reads are refused.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadFileParams {
    /// Path of the file, relative to a project root or absolute.
    pub path: String,

    /// Read a single line.
    #[serde(default)]
    pub line: Option<u32>,

    /// Read an inclusive line range (requires `end_line`).
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,

    /// Read several disjoint ranges; one token is issued per range.
    #[serde(default)]
    pub ranges: Option<Vec<LineRange>>,

    /// Read the lines around the first match of this pattern.
    #[serde(default)]
    pub context_pattern: Option<String>,

    /// Context lines either side of the pattern match (default 2).
    #[serde(default)]
    pub context_range: Option<u32>,

    /// Read the definition of a symbol via the symbol provider.
    #[serde(default)]
    pub symbol: Option<String>,

    /// Restrict symbol lookup to one kind (e.g. `method`, `field`).
    #[serde(default)]
    pub symbol_kind: Option<SymbolKind>,

    /// Token from a previous read; when it still covers and matches the
    /// file, the response is `UNCHANGED` with no body.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Return the body even when the access token still matches.
    #[serde(default)]
    pub force: Option<bool>,

    /// Decode with this charset instead of running detection.
    #[serde(default)]
    pub forced_encoding: Option<String>,

    /// Abort the operation after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

const DEFAULT_CONTEXT_RANGE: u32 = 2;

pub fn read_file(ctx: &BrokerContext, params: ReadFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    let safe = ctx.sandbox.sanitize(&params.path, true)?;
    let _lock = ctx.locks.acquire(vec![safe.to_path_buf()], &deadline)?;

    let forced = params
        .forced_encoding
        .as_deref()
        .map(Charset::for_label)
        .transpose()?;
    let file = ops::load_text_file(ctx, &safe, forced)?;
    deadline.check()?;

    let external = ops::note_external_change(ctx, &safe, &file);
    let ranges = resolve_selector(ctx, &safe, &file, &params)?;

    let total = file.buffer.line_count();
    let name = safe.display_name();
    let mut sections: Vec<String> = Vec::new();
    if external {
        sections.push(ops::EXTERNAL_BANNER.to_string());
    }

    // A still-valid covering token short-circuits to UNCHANGED (single
    // range only; multi-range reads always return bodies).
    if let [(start, end)] = ranges[..] {
        if params.force != Some(true) {
            if let Some(encoded) = params.access_token.as_deref() {
                let token = ctx.tokens.decode(encoded, &safe)?;
                let own_range = file.buffer.range(token.start_line, token.end_line);
                if token.validate(own_range, total) == TokenValidity::Valid
                    && token.covers(start, end)
                {
                    sections.push(ops::unchanged_header(start, end, total, file.crc));
                    sections.push(format!("[TOKEN: {encoded}]"));
                    register_snapshot(ctx, &safe, &file);
                    return Ok(ToolOutput::new(sections.join("\n"))
                        .with_field("token", encoded)
                        .with_field("crc32c", crate::digest::crc32c_hex(file.crc))
                        .with_field("path", name)
                        .with_field("line_count", total.to_string()));
                }
            }
        }
    }

    let mut tokens = Vec::new();
    for &(start, end) in &ranges {
        let content = file.buffer.range(start, end);
        let token = ctx.tokens.issue(&safe, start, end, content, total);
        let encoded = ctx.tokens.encode(&token);
        sections.push(ops::file_header(
            &name,
            start,
            end,
            total,
            file.decoded.charset.label(),
            file.crc,
        ));
        sections.push(ops::access_line(start, end, &encoded));
        if !content.is_empty() {
            sections.push(ops::number_lines(content, start));
        }
        tokens.push(encoded);
    }

    if file.decoded.had_replacements {
        sections.push("[WARNING: malformed bytes decoded with replacement characters]".to_string());
    }
    let span: u32 = ranges.iter().map(|(s, e)| e.saturating_sub(*s) + 1).sum();
    if span > 200 {
        sections.push(format!("[WARNING: large range ({span} lines); prefer narrower reads]"));
    }
    sections.push(
        "[HINT: pass the TOKEN back to edit_file to modify these lines, or to read_file to skip an unchanged body]"
            .to_string(),
    );

    register_snapshot(ctx, &safe, &file);

    let first_token = tokens.first().cloned().unwrap_or_default();
    Ok(ToolOutput::new(sections.join("\n"))
        .with_field("token", first_token)
        .with_field("tokens", tokens.join(","))
        .with_field("crc32c", crate::digest::crc32c_hex(file.crc))
        .with_field("path", name)
        .with_field("line_count", total.to_string()))
}

fn register_snapshot(ctx: &BrokerContext, safe: &SafePath, file: &ops::LoadedFile) {
    ctx.tracker.register(
        safe.as_path(),
        crate::tracker::FileSnapshot::new(
            file.bytes.clone(),
            file.crc,
            file.decoded.charset,
            file.buffer.line_count(),
        ),
    );
}

/// Reduce the five access selectors to concrete 1-based ranges, enforcing
/// that exactly one selector was supplied.
fn resolve_selector(
    ctx: &BrokerContext,
    safe: &SafePath,
    file: &ops::LoadedFile,
    params: &ReadFileParams,
) -> Result<Vec<(u32, u32)>> {
    let selector_count = [
        params.line.is_some(),
        params.start_line.is_some() || params.end_line.is_some(),
        params.ranges.is_some(),
        params.context_pattern.is_some(),
        params.symbol.is_some(),
    ]
    .iter()
    .filter(|v| **v)
    .count();
    if selector_count != 1 {
        return Err(ContentError::MustSpecifyRange.into());
    }

    let total = file.buffer.line_count();
    if let Some(line) = params.line {
        return Ok(vec![clamp_range(safe, line, line, total)?]);
    }
    if let Some(start) = params.start_line {
        let end = params.end_line.unwrap_or(start);
        return Ok(vec![clamp_range(safe, start, end, total)?]);
    }
    if let Some(ranges) = &params.ranges {
        if ranges.is_empty() {
            return Err(ContentError::MustSpecifyRange.into());
        }
        return ranges
            .iter()
            .map(|r| clamp_range(safe, r.start_line, r.end_line, total))
            .collect();
    }
    if let Some(pattern) = &params.context_pattern {
        let context = params.context_range.unwrap_or(DEFAULT_CONTEXT_RANGE);
        return Ok(vec![find_context(safe, file, pattern, context)?]);
    }
    if let Some(symbol) = &params.symbol {
        return Ok(vec![find_symbol(ctx, safe, file, symbol, params.symbol_kind)?]);
    }
    Err(ContentError::MustSpecifyRange.into())
}

/// Clamp `end` to the file and validate `start`. Zero-line files answer
/// `line 1` requests with the empty `(0, 0)` range.
fn clamp_range(safe: &SafePath, start: u32, end: u32, total: u32) -> Result<(u32, u32)> {
    if total == 0 && start <= 1 {
        return Ok((0, 0));
    }
    if start == 0 || start > total || start > end {
        return Err(ContentError::LineOutOfRange {
            path: safe.to_path_buf(),
            line: start,
            total,
        }
        .into());
    }
    Ok((start, end.min(total)))
}

/// First line matching the pattern, expanded by `context` lines on each
/// side. Patterns are tried as regexes and fall back to literal substring
/// search when they do not parse.
fn find_context(
    safe: &SafePath,
    file: &ops::LoadedFile,
    pattern: &str,
    context: u32,
) -> Result<(u32, u32)> {
    let regex = regex_lite::Regex::new(pattern).ok();
    let hit = file.buffer.lines().iter().position(|line| match &regex {
        Some(re) => re.is_match(line),
        None => line.contains(pattern),
    });
    let Some(index) = hit else {
        return Err(ContentError::PatternNotFound {
            path: safe.to_path_buf(),
            pattern: pattern.to_string(),
        }
        .into());
    };
    let line = index as u32 + 1;
    let total = file.buffer.line_count();
    Ok((line.saturating_sub(context).max(1), (line + context).min(total)))
}

/// Resolve a symbol to its line span via the provider, preferring the
/// more specific kind when several share the name.
fn find_symbol(
    ctx: &BrokerContext,
    safe: &SafePath,
    file: &ops::LoadedFile,
    symbol: &str,
    kind: Option<SymbolKind>,
) -> Result<(u32, u32)> {
    let not_found = || {
        crate::error::BrokerErr::from(ContentError::SymbolNotFound {
            path: safe.to_path_buf(),
            symbol: symbol.to_string(),
        })
    };
    let provider = ctx
        .symbols
        .provider
        .as_deref()
        .ok_or_else(|| crate::error::BrokerErr::Host("no symbol provider is configured".to_string()))?;
    let lang = symbols::detect_language(safe.as_path()).ok_or_else(not_found)?;
    let all = ctx
        .symbols
        .cache
        .symbols_for(provider, safe.as_path(), &file.decoded.content, file.crc, lang)
        .map_err(crate::error::BrokerErr::Host)?;
    let best = all
        .iter()
        .filter(|s| s.name == symbol)
        .filter(|s| kind.is_none_or(|k| s.kind == k))
        .max_by_key(|s| (s.kind.specificity(), std::cmp::Reverse(s.location.start_line)))
        .ok_or_else(not_found)?;
    let total = file.buffer.line_count();
    clamp_range(
        safe,
        best.location.start_line,
        best.location.end_line,
        total,
    )
}
