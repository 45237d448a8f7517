//! Search operations: grep, find, list and the ASCII structure tree.
//!
//! Grep fans out over the same parallel tree walker ripgrep uses; each
//! worker accumulates matches locally and the results are merged after
//! the walk so the only shared state is a mutex around the result vector
//! and the per-file match-count tracker.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ignore::WalkBuilder;
use ignore::WalkState;
use ignore::overrides::OverrideBuilder;
use schemars::JsonSchema;
use serde::Deserialize;
use wildmatch::WildMatch;

use crate::config::AUTO_IGNORE_DIRS;
use crate::context::BrokerContext;
use crate::encoding;
use crate::error::BrokerErr;
use crate::error::Result;
use crate::fsio;
use crate::lines::LineBuffer;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::sandbox::SafePath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SearchAction {
    List,
    Find,
    Grep,
    Structure,
    ClearMatches,
}

fn default_true() -> bool {
    true
}

/// Parameters for `search`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchParams {
    pub action: SearchAction,

    /// Directory (or file, for grep) to search; defaults to the primary
    /// project root.
    #[serde(default)]
    pub path: Option<String>,

    /// Grep query or find glob pattern.
    #[serde(default)]
    pub query: Option<String>,

    /// Treat the grep query as a regex instead of a literal.
    #[serde(default)]
    pub regex: bool,

    /// Case-sensitive matching (default true).
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    /// Context lines before/after each grep match.
    #[serde(default)]
    pub before: u32,
    #[serde(default)]
    pub after: u32,

    /// Include/exclude globs for grep.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Listing depth (default 1 level).
    #[serde(default)]
    pub depth: Option<u32>,

    /// Hide build and VCS directories in listings (default true).
    #[serde(default = "default_true")]
    pub auto_ignore: bool,

    /// Extra name patterns (`*`/`?` wildcards) hidden from listings.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Override the per-file grep match cap.
    #[serde(default)]
    pub max_matches_per_file: Option<usize>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Per-file grep match totals, kept so later `list` calls can annotate
/// `[MATCHES: n]`. Cleared explicitly.
#[derive(Debug, Default)]
pub struct MatchCountTracker {
    counts: Mutex<HashMap<PathBuf, usize>>,
}

impl MatchCountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &Path, count: usize) {
        self.lock().insert(path.to_path_buf(), count);
    }

    pub fn get(&self, path: &Path) -> Option<usize> {
        self.lock().get(path).copied()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, usize>> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn search(ctx: &BrokerContext, params: SearchParams, deadline: &Deadline) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    let root = ctx
        .sandbox
        .sanitize(params.path.as_deref().unwrap_or("."), true)?;
    match params.action {
        SearchAction::Grep => grep(ctx, &root, &params, &deadline),
        SearchAction::Find => find(ctx, &root, &params, &deadline),
        SearchAction::List => list(ctx, &root, &params),
        SearchAction::Structure => structure(ctx, &root),
        SearchAction::ClearMatches => {
            ctx.match_counts.clear();
            Ok(ToolOutput::new("[MATCH COUNTS CLEARED]".to_string()))
        }
    }
}

enum GrepMatcher {
    Regex(regex_lite::Regex),
    Literal { needle: String, case_sensitive: bool },
}

impl GrepMatcher {
    fn build(query: &str, regex: bool, case_sensitive: bool) -> Result<Self> {
        if regex {
            let pattern = if case_sensitive {
                query.to_string()
            } else {
                format!("(?i){query}")
            };
            let compiled = regex_lite::Regex::new(&pattern).map_err(|e| BrokerErr::InvalidParams {
                tool: "search".to_string(),
                message: format!("invalid regex `{query}`: {e}"),
            })?;
            Ok(GrepMatcher::Regex(compiled))
        } else {
            Ok(GrepMatcher::Literal {
                needle: if case_sensitive {
                    query.to_string()
                } else {
                    query.to_lowercase()
                },
                case_sensitive,
            })
        }
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            GrepMatcher::Regex(re) => re.is_match(line),
            GrepMatcher::Literal {
                needle,
                case_sensitive: true,
            } => line.contains(needle.as_str()),
            GrepMatcher::Literal { needle, .. } => line.to_lowercase().contains(needle.as_str()),
        }
    }
}

struct FileMatches {
    path: PathBuf,
    display: String,
    total: usize,
    /// (line number, shown lines) capped at the per-file limit.
    shown: Vec<(u32, Vec<(u32, String, bool)>)>,
}

fn grep(
    ctx: &BrokerContext,
    root: &SafePath,
    params: &SearchParams,
    deadline: &Deadline,
) -> Result<ToolOutput> {
    let query = require_query(params)?;
    let matcher = GrepMatcher::build(query, params.regex, params.case_sensitive)?;
    let cap = params
        .max_matches_per_file
        .unwrap_or(ctx.config.grep_match_cap);

    let walker = walk_builder(ctx, root, &params.include, &params.exclude)?.build_parallel();
    let results: Mutex<Vec<FileMatches>> = Mutex::new(Vec::new());
    let cancelled = AtomicBool::new(false);

    walker.run(|| {
        Box::new(|entry| {
            if deadline.expired() {
                cancelled.store(true, Ordering::Relaxed);
                return WalkState::Quit;
            }
            let Ok(entry) = entry else {
                return WalkState::Continue;
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return WalkState::Continue;
            }
            if let Some(found) = grep_one_file(ctx, root, entry.path(), &matcher, params, cap) {
                match results.lock() {
                    Ok(mut guard) => guard.push(found),
                    Err(poisoned) => poisoned.into_inner().push(found),
                }
            }
            WalkState::Continue
        })
    });

    if cancelled.load(Ordering::Relaxed) {
        deadline.check()?;
    }

    let mut results = match results.into_inner() {
        Ok(results) => results,
        Err(poisoned) => poisoned.into_inner(),
    };
    results.sort_by(|a, b| a.path.cmp(&b.path));

    let total_matches: usize = results.iter().map(|f| f.total).sum();
    for file in &results {
        ctx.match_counts.record(&file.path, file.total);
    }

    let mut out = format!(
        "[GREP: {query} | {total_matches} match(es) in {} file(s)]",
        results.len()
    );
    for file in &results {
        out.push_str(&format!("\n{}:", file.display));
        for (_, block) in &file.shown {
            for (line_no, text, is_match) in block {
                let sep = if *is_match { ':' } else { '-' };
                out.push_str(&format!("\n{line_no:>6}{sep} {text}"));
            }
        }
        if file.total > file.shown.len() {
            out.push_str(&format!(
                "\n  ... {} more match(es) not shown",
                file.total - file.shown.len()
            ));
        }
    }
    Ok(ToolOutput::new(out)
        .with_field("matches", total_matches.to_string())
        .with_field("files", results.len().to_string()))
}

fn grep_one_file(
    ctx: &BrokerContext,
    root: &SafePath,
    path: &Path,
    matcher: &GrepMatcher,
    params: &SearchParams,
    cap: usize,
) -> Option<FileMatches> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.len() > ctx.config.max_file_size {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    if fsio::looks_binary(&bytes) {
        return None;
    }
    let decoded = encoding::decode(&bytes, None, ctx.config.fallback_charset);
    let buffer = LineBuffer::parse(&decoded.content);
    let lines = buffer.lines();

    let mut total = 0usize;
    let mut shown = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !matcher.is_match(line) {
            continue;
        }
        total += 1;
        if shown.len() >= cap {
            continue;
        }
        let line_no = i as u32 + 1;
        let first = i.saturating_sub(params.before as usize);
        let last = (i + params.after as usize).min(lines.len().saturating_sub(1));
        let block: Vec<(u32, String, bool)> = (first..=last)
            .map(|j| (j as u32 + 1, lines[j].clone(), j == i))
            .collect();
        shown.push((line_no, block));
    }
    if total == 0 {
        return None;
    }
    let display = path
        .strip_prefix(root.root())
        .unwrap_or(path)
        .display()
        .to_string();
    Some(FileMatches {
        path: path.to_path_buf(),
        display,
        total,
        shown,
    })
}

fn find(
    ctx: &BrokerContext,
    root: &SafePath,
    params: &SearchParams,
    deadline: &Deadline,
) -> Result<ToolOutput> {
    let pattern = require_query(params)?;
    let include = vec![pattern.to_string()];
    let walker = walk_builder(ctx, root, &include, &[])?.build_parallel();
    let results: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let cancelled = AtomicBool::new(false);

    walker.run(|| {
        Box::new(|entry| {
            if deadline.expired() {
                cancelled.store(true, Ordering::Relaxed);
                return WalkState::Quit;
            }
            let Ok(entry) = entry else {
                return WalkState::Continue;
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return WalkState::Continue;
            }
            let display = entry
                .path()
                .strip_prefix(root.root())
                .unwrap_or(entry.path())
                .display()
                .to_string();
            match results.lock() {
                Ok(mut guard) => guard.push(display),
                Err(poisoned) => poisoned.into_inner().push(display),
            }
            WalkState::Continue
        })
    });

    if cancelled.load(Ordering::Relaxed) {
        deadline.check()?;
    }

    let mut found = match results.into_inner() {
        Ok(found) => found,
        Err(poisoned) => poisoned.into_inner(),
    };
    found.sort();
    let mut out = format!("[FIND: {pattern} | {} file(s)]", found.len());
    for path in &found {
        out.push('\n');
        out.push_str(path);
    }
    Ok(ToolOutput::new(out).with_field("files", found.len().to_string()))
}

fn require_query<'a>(params: &'a SearchParams) -> Result<&'a str> {
    params
        .query
        .as_deref()
        .filter(|q| !q.is_empty())
        .ok_or_else(|| BrokerErr::InvalidParams {
            tool: "search".to_string(),
            message: "`query` is required".to_string(),
        })
}

/// Full-tree walker: no gitignore semantics (the broker has its own
/// protected set), hidden files visible, bounded parallelism.
pub(crate) fn walk_builder(
    ctx: &BrokerContext,
    root: &SafePath,
    include: &[String],
    exclude: &[String],
) -> Result<WalkBuilder> {
    let mut builder = WalkBuilder::new(root.as_path());
    builder
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .threads(ctx.config.grep_threads);

    if !include.is_empty() || !exclude.is_empty() {
        let mut overrides = OverrideBuilder::new(root.as_path());
        for glob in include {
            overrides.add(glob).map_err(invalid_glob)?;
        }
        for glob in exclude {
            overrides.add(&format!("!{glob}")).map_err(invalid_glob)?;
        }
        builder.overrides(overrides.build().map_err(invalid_glob)?);
    }

    let protected: Vec<String> = AUTO_IGNORE_DIRS.iter().map(|s| s.to_string()).collect();
    builder.filter_entry(move |entry| {
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_some_and(|ft| ft.is_dir()) && protected.iter().any(|p| p == &name))
    });
    Ok(builder)
}

fn invalid_glob(e: ignore::Error) -> BrokerErr {
    BrokerErr::InvalidParams {
        tool: "search".to_string(),
        message: format!("invalid glob: {e}"),
    }
}

fn list(ctx: &BrokerContext, root: &SafePath, params: &SearchParams) -> Result<ToolOutput> {
    let depth = params.depth.unwrap_or(1).max(1);
    let hidden: Vec<WildMatch> = params.ignore_patterns.iter().map(|p| WildMatch::new(p)).collect();
    let name = if root.display_name().is_empty() {
        ".".to_string()
    } else {
        root.display_name()
    };
    let mut out = format!("[LIST: {name} | depth {depth}]");
    let mut file_count = 0usize;
    list_dir(ctx, root.as_path(), params, &hidden, depth, 0, &mut out, &mut file_count)?;
    Ok(ToolOutput::new(out)
        .with_field("path", name)
        .with_field("files", file_count.to_string()))
}

#[allow(clippy::too_many_arguments)]
fn list_dir(
    ctx: &BrokerContext,
    dir: &Path,
    params: &SearchParams,
    hidden: &[WildMatch],
    depth_left: u32,
    indent: usize,
    out: &mut String,
    file_count: &mut usize,
) -> Result<()> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if skip_name(ctx, params, hidden, &name) {
            continue;
        }
        let pad = "  ".repeat(indent);
        let path = entry.path();
        if path.is_dir() {
            out.push_str(&format!("\n{pad}[DIR] {name}"));
            if depth_left > 1 {
                list_dir(ctx, &path, params, hidden, depth_left - 1, indent + 1, out, file_count)?;
            }
        } else {
            *file_count += 1;
            let mut markers = String::new();
            if ctx.tracker.contains(&path) {
                markers.push_str(" [READ]");
            }
            if let Some(count) = ctx.match_counts.get(&path) {
                markers.push_str(&format!(" [MATCHES: {count}]"));
            }
            out.push_str(&format!("\n{pad}[FILE] {name}{markers}"));
        }
    }
    Ok(())
}

fn structure(ctx: &BrokerContext, root: &SafePath) -> Result<ToolOutput> {
    let name = if root.display_name().is_empty() {
        root.root()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string())
    } else {
        root.display_name()
    };
    let mut out = format!("{name}/");
    structure_dir(ctx, root.as_path(), "", &mut out)?;
    Ok(ToolOutput::new(out))
}

fn structure_dir(ctx: &BrokerContext, dir: &Path, prefix: &str, out: &mut String) -> Result<()> {
    let entries: Vec<_> = sorted_entries(dir)?
        .into_iter()
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            !ctx.sandbox.is_protected_segment(&name)
        })
        .collect();
    let last_index = entries.len().saturating_sub(1);
    for (i, entry) in entries.iter().enumerate() {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_last = i == last_index;
        let branch = if is_last { "└── " } else { "├── " };
        let path = entry.path();
        if path.is_dir() {
            out.push_str(&format!("\n{prefix}{branch}{name}/"));
            let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
            structure_dir(ctx, &path, &child_prefix, out)?;
        } else {
            out.push_str(&format!("\n{prefix}{branch}{name}"));
        }
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn skip_name(ctx: &BrokerContext, params: &SearchParams, hidden: &[WildMatch], name: &str) -> bool {
    if params.auto_ignore && AUTO_IGNORE_DIRS.contains(&name) {
        return true;
    }
    if ctx.sandbox.is_protected_segment(name) {
        return true;
    }
    hidden.iter().any(|pattern| pattern.matches(name))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn context_for(dir: &TempDir) -> BrokerContext {
        let config = Config::load_with_overrides(ConfigOverrides {
            roots: Some(vec![dir.path().to_path_buf()]),
            ..Default::default()
        })
        .unwrap();
        BrokerContext::new(config)
    }

    fn base(action: SearchAction) -> SearchParams {
        SearchParams {
            action,
            path: None,
            query: None,
            regex: false,
            case_sensitive: true,
            before: 0,
            after: 0,
            include: Vec::new(),
            exclude: Vec::new(),
            depth: None,
            auto_ignore: true,
            ignore_patterns: Vec::new(),
            max_matches_per_file: None,
            timeout_ms: None,
        }
    }

    fn seed_tree(dir: &TempDir) {
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {\n    needle();\n}\n").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn needle() {}\npub fn other() {}\n")
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "docs about Needle\n").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/x.js"), "needle\n").unwrap();
        std::fs::write(dir.path().join("bin.dat"), b"nee\0dle").unwrap();
    }

    #[test]
    fn grep_literal_counts_and_skips_protected_and_binary() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some("needle".to_string()),
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        // node_modules and the binary file are excluded; README has
        // different case.
        assert_eq!(out.fields["matches"], "2");
        assert_eq!(out.fields["files"], "2");
        assert!(out.text.contains("src/main.rs:"));
        assert!(out.text.contains("src/lib.rs:"));
        assert!(!out.text.contains("node_modules"));
    }

    #[test]
    fn grep_case_insensitive_and_context() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some("needle".to_string()),
                case_sensitive: false,
                before: 1,
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(out.fields["matches"], "3");
        assert!(out.text.contains("     2: "), "{}", out.text);
        assert!(out.text.contains("     1- "), "{}", out.text);
    }

    #[test]
    fn grep_regex_mode() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some(r"fn \w+\(\)".to_string()),
                regex: true,
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(out.fields["matches"], "3");

        let err = search(
            &ctx,
            SearchParams {
                query: Some("(unclosed".to_string()),
                regex: true,
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerErr::InvalidParams { .. }));
    }

    #[test]
    fn grep_include_exclude_globs() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some("needle".to_string()),
                include: vec!["*.rs".to_string()],
                exclude: vec!["main.rs".to_string()],
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(out.fields["files"], "1");
        assert!(out.text.contains("src/lib.rs:"));
    }

    #[test]
    fn grep_cap_truncates_but_counts_all() {
        let dir = TempDir::new().unwrap();
        let body: String = (0..10).map(|_| "hit\n").collect();
        std::fs::write(dir.path().join("many.txt"), body).unwrap();
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some("hit".to_string()),
                max_matches_per_file: Some(3),
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(out.fields["matches"], "10");
        assert!(out.text.contains("... 7 more match(es) not shown"));
    }

    #[test]
    fn find_globs_files() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                query: Some("*.rs".to_string()),
                ..base(SearchAction::Find)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(out.fields["files"], "2");
        assert!(out.text.contains("src/lib.rs"));
        assert!(out.text.contains("src/main.rs"));
    }

    #[test]
    fn list_annotates_read_and_match_markers() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);

        // Grep populates the match tracker; a fake snapshot marks README
        // as read.
        search(
            &ctx,
            SearchParams {
                query: Some("needle".to_string()),
                ..base(SearchAction::Grep)
            },
            &Deadline::none(),
        )
        .unwrap();
        let readme = dir.path().canonicalize().unwrap().join("README.md");
        ctx.tracker.update(
            &readme,
            crate::tracker::FileSnapshot::new(Vec::new(), 0, crate::encoding::Charset::Utf8 { bom: false }, 1),
        );

        let out = search(
            &ctx,
            SearchParams {
                depth: Some(2),
                ..base(SearchAction::List)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert!(out.text.contains("[DIR] src"));
        assert!(out.text.contains("[FILE] README.md [READ]"));
        assert!(out.text.contains("[FILE] main.rs [MATCHES: 1]"), "{}", out.text);
        assert!(!out.text.contains("node_modules"));

        // clear_matches drops the annotations.
        search(&ctx, base(SearchAction::ClearMatches), &Deadline::none()).unwrap();
        let out = search(
            &ctx,
            SearchParams {
                depth: Some(2),
                ..base(SearchAction::List)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert!(!out.text.contains("[MATCHES:"));
    }

    #[test]
    fn list_respects_depth_and_ignore_patterns() {
        let dir = TempDir::new().unwrap();
        seed_tree(&dir);
        let ctx = context_for(&dir);
        let out = search(
            &ctx,
            SearchParams {
                depth: Some(1),
                ignore_patterns: vec!["*.md".to_string()],
                ..base(SearchAction::List)
            },
            &Deadline::none(),
        )
        .unwrap();
        assert!(out.text.contains("[DIR] src"));
        assert!(!out.text.contains("main.rs"));
        assert!(!out.text.contains("README.md"));
    }

    #[test]
    fn structure_draws_a_box_tree() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "x").unwrap();
        std::fs::write(dir.path().join("zz.txt"), "x").unwrap();
        let ctx = context_for(&dir);
        let out = search(&ctx, base(SearchAction::Structure), &Deadline::none()).unwrap();
        let expected = "\
├── src/
│   ├── a.rs
│   └── b.rs
└── zz.txt";
        assert!(out.text.ends_with(expected), "{}", out.text);
    }

    #[test]
    fn grep_requires_a_query() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(&dir);
        let err = search(&ctx, base(SearchAction::Grep), &Deadline::none()).unwrap_err();
        assert!(matches!(err, BrokerErr::InvalidParams { .. }));
    }
}
