//! Project-wide substitution under a single root transaction.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::BrokerContext;
use crate::encoding;
use crate::error::BrokerErr;
use crate::error::Result;
use crate::fsio;
use crate::lines::LineBuffer;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::ops::TxnGuard;
use crate::ops::search::walk_builder;
use crate::sandbox::SafePath;
use crate::tracker::FileSnapshot;

/// Parameters for `project_replace`: literal or regex global substitution
/// over every text file under a root, filtered by include/exclude globs.
/// All files mutate in one transaction; any failure reverts them all.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProjectReplaceParams {
    /// Directory to operate under; defaults to the primary root.
    #[serde(default)]
    pub path: Option<String>,

    /// Text (or regex, with `regex: true`) to replace.
    pub query: String,

    /// Replacement text; regex mode supports `$1`-style captures.
    pub replacement: String,

    #[serde(default)]
    pub regex: bool,

    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn project_replace(
    ctx: &BrokerContext,
    params: ProjectReplaceParams,
    deadline: &Deadline,
) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    let root = ctx
        .sandbox
        .sanitize(params.path.as_deref().unwrap_or("."), true)?;

    let substitution = Substitution::build(&params)?;

    // Deterministic order: serial walk, sorted paths.
    let mut files = Vec::new();
    for entry in walk_builder(ctx, &root, &params.include, &params.exclude)?.build() {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let txn = TxnGuard::begin(
        &ctx.journal,
        &format!("replace `{}` -> `{}`", params.query, params.replacement),
        &deadline,
    )?;
    let mut touched_files = 0usize;
    let mut total_replacements = 0usize;
    for path in &files {
        if let Err(e) = deadline.check() {
            return Err(txn.fail(e));
        }
        match replace_in_file(ctx, &root, path, &substitution, &deadline) {
            Ok(0) => {}
            Ok(n) => {
                touched_files += 1;
                total_replacements += n;
            }
            Err(e) => return Err(txn.fail(e)),
        }
    }
    txn.commit()?;

    let text = format!(
        "[REPLACE: `{}` -> `{}` | {total_replacements} replacement(s) in {touched_files} file(s)]",
        params.query, params.replacement
    );
    Ok(ToolOutput::new(text)
        .with_field("files", touched_files.to_string())
        .with_field("replacements", total_replacements.to_string()))
}

enum Substitution {
    Literal { query: String, replacement: String },
    Regex { re: regex_lite::Regex, replacement: String },
}

impl Substitution {
    fn build(params: &ProjectReplaceParams) -> Result<Self> {
        if params.regex {
            let re = regex_lite::Regex::new(&params.query).map_err(|e| BrokerErr::InvalidParams {
                tool: "project_replace".to_string(),
                message: format!("invalid regex `{}`: {e}", params.query),
            })?;
            Ok(Substitution::Regex {
                re,
                replacement: params.replacement.clone(),
            })
        } else {
            if params.query.is_empty() {
                return Err(BrokerErr::InvalidParams {
                    tool: "project_replace".to_string(),
                    message: "`query` must not be empty".to_string(),
                });
            }
            Ok(Substitution::Literal {
                query: params.query.clone(),
                replacement: params.replacement.clone(),
            })
        }
    }

    /// Apply to `content`, returning the new text and the match count.
    fn apply(&self, content: &str) -> (String, usize) {
        match self {
            Substitution::Literal { query, replacement } => {
                let count = content.matches(query.as_str()).count();
                if count == 0 {
                    return (content.to_string(), 0);
                }
                (content.replace(query.as_str(), replacement), count)
            }
            Substitution::Regex { re, replacement } => {
                let count = re.find_iter(content).count();
                if count == 0 {
                    return (content.to_string(), 0);
                }
                (re.replace_all(content, replacement.as_str()).into_owned(), count)
            }
        }
    }
}

fn replace_in_file(
    ctx: &BrokerContext,
    root: &SafePath,
    path: &std::path::Path,
    substitution: &Substitution,
    deadline: &Deadline,
) -> Result<usize> {
    let Ok(metadata) = std::fs::metadata(path) else {
        return Ok(0);
    };
    if metadata.len() > ctx.config.max_file_size {
        return Ok(0);
    }
    let bytes = std::fs::read(path)?;
    if fsio::looks_binary(&bytes) {
        return Ok(0);
    }
    let charset = ctx.tracker.snapshot(path).map(|s| s.charset);
    let decoded = encoding::decode(&bytes, charset, ctx.config.fallback_charset);
    let (new_content, count) = substitution.apply(&decoded.content);
    if count == 0 {
        return Ok(0);
    }

    let _lock = ctx.locks.acquire(vec![path.to_path_buf()], deadline)?;
    let before_lines = LineBuffer::parse(&decoded.content).line_count();
    let after_lines = LineBuffer::parse(&new_content).line_count();
    ctx.journal.backup(path, &bytes)?;
    let (crc, new_bytes) = encoding::write_text(path, &new_content, decoded.charset)?;
    let display = path.strip_prefix(root.root()).unwrap_or(path).display();
    ctx.journal.record_mutation(
        path,
        &new_bytes,
        before_lines,
        after_lines,
        &format!("replace in {display}"),
    )?;
    ctx.tracker.update(
        path,
        FileSnapshot::new(new_bytes, crc, decoded.charset, after_lines),
    );
    ctx.symbols.cache.invalidate(path);
    Ok(count)
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

    fn base(query: &str, replacement: &str) -> ProjectReplaceParams {
        ProjectReplaceParams {
            path: None,
            query: query.to_string(),
            replacement: replacement.to_string(),
            regex: false,
            include: Vec::new(),
            exclude: Vec::new(),
            timeout_ms: None,
        }
    }

    #[test]
    fn literal_replace_spans_files_and_is_one_undo_entry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old old\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "keep old\n").unwrap();
        std::fs::write(dir.path().join("c.txt"), "nothing here\n").unwrap();
        let ctx = context_for(&dir);

        let out = project_replace(&ctx, base("old", "new"), &Deadline::none()).unwrap();
        assert_eq!(out.fields["replacements"], "3");
        assert_eq!(out.fields["files"], "2");
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new new\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "keep new\n");

        assert_eq!(ctx.journal.undo_depth(), 1);
        ctx.journal.undo().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old old\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "keep old\n");
    }

    #[test]
    fn regex_replace_supports_captures() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "id=42\nid=7\n").unwrap();
        let ctx = context_for(&dir);
        project_replace(
            &ctx,
            ProjectReplaceParams {
                regex: true,
                ..base(r"id=(\d+)", "key=$1")
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "key=42\nkey=7\n"
        );
    }

    #[test]
    fn include_filter_limits_the_sweep() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "old\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "old\n").unwrap();
        let ctx = context_for(&dir);
        project_replace(
            &ctx,
            ProjectReplaceParams {
                include: vec!["*.rs".to_string()],
                ..base("old", "new")
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.rs")).unwrap(), "new\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old\n");
    }

    #[test]
    fn failure_rolls_back_every_file() {
        let dir = TempDir::new().unwrap();
        // First file is fine; the second cannot re-encode the replacement
        // into its windows-1251 charset.
        std::fs::write(dir.path().join("a.txt"), "old\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), [0xCF, b' ', b'o', b'l', b'd', 0x0A]).unwrap();
        let ctx = context_for(&dir);

        let err = project_replace(&ctx, base("old", "arrow \u{2192}"), &Deadline::none()).unwrap_err();
        assert!(matches!(
            err,
            BrokerErr::Encoding(crate::error::EncodingError::Unmappable { .. })
        ));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old\n");
        assert_eq!(
            std::fs::read(dir.path().join("b.txt")).unwrap(),
            vec![0xCF, b' ', b'o', b'l', b'd', 0x0A]
        );
        assert_eq!(ctx.journal.undo_depth(), 0);
    }
}
