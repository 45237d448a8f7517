//! Operation layer: every broker verb composed from the core components.
//!
//! All operations follow the same scaffold: sandbox the paths, take the
//! per-file advisory locks, open a transaction (nested when the caller
//! already holds one, as the batch orchestrator does), do the work, then
//! commit, with rollback tied to a scope guard so an early `?` can never
//! leave a transaction dangling.

pub mod batch;
pub mod edit;
pub mod file_manage;
pub mod history;
pub mod read;
pub mod replace;
pub mod search;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::context::BrokerContext;
use crate::digest;
use crate::encoding;
use crate::encoding::Charset;
use crate::encoding::DecodedText;
use crate::error::BrokerErr;
use crate::error::ConcurrencyError;
use crate::error::PathError;
use crate::error::Result;
use crate::fsio;
use crate::journal::CommitOutcome;
use crate::journal::TransactionJournal;
use crate::lines::LineBuffer;
use crate::sandbox::SafePath;
use crate::tracker::CheckOutcome;
use crate::tracker::FileSnapshot;

/// How long a lock acquisition waits when the caller set no deadline.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

pub const EXTERNAL_BANNER: &str = "[EXTERNAL CHANGE DETECTED - recorded in file history]";

/// Caller-supplied deadline; operations abort at the next suspension
/// point after it passes and roll their transaction back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn from_timeout_ms(timeout_ms: Option<u64>) -> Self {
        Self(timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)))
    }

    /// Combine with a per-call timeout, keeping whichever expires first.
    pub fn tighten(&self, timeout_ms: Option<u64>) -> Self {
        match (self.0, Self::from_timeout_ms(timeout_ms).0) {
            (Some(a), Some(b)) => Self(Some(a.min(b))),
            (a, b) => Self(a.or(b)),
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<()> {
        if self.expired() {
            return Err(ConcurrencyError::Cancelled.into());
        }
        Ok(())
    }
}

/// Per-file advisory locks keyed by canonical path. Multi-path
/// acquisition is all-or-nothing over a sorted, deduplicated set, so two
/// operations can never deadlock on lock order.
#[derive(Debug, Default)]
pub struct FileLockSet {
    locked: Mutex<HashSet<PathBuf>>,
}

#[derive(Debug)]
pub struct FileLockGuard<'a> {
    set: &'a FileLockSet,
    paths: Vec<PathBuf>,
}

impl FileLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, mut paths: Vec<PathBuf>, deadline: &Deadline) -> Result<FileLockGuard<'_>> {
        paths.sort();
        paths.dedup();
        let wait_cap = Instant::now() + DEFAULT_LOCK_WAIT;
        loop {
            let contended: Option<PathBuf> = {
                let mut locked = self.lock();
                let busy = paths.iter().find(|p| locked.contains(*p)).cloned();
                if busy.is_none() {
                    for path in &paths {
                        locked.insert(path.clone());
                    }
                }
                busy
            };
            let Some(contended) = contended else {
                return Ok(FileLockGuard { set: self, paths });
            };
            deadline.check()?;
            if Instant::now() >= wait_cap {
                return Err(ConcurrencyError::FileLockedByAnotherOp(contended).into());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        match self.locked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let mut locked = self.set.lock();
        for path in &self.paths {
            locked.remove(path);
        }
    }
}

/// Scope guard for a journal transaction: commit consumes it, an early
/// return rolls back via `Drop`, and `fail` chains a rollback failure
/// onto the original error instead of swallowing either.
pub(crate) struct TxnGuard<'a> {
    journal: &'a TransactionJournal,
    done: bool,
}

impl<'a> TxnGuard<'a> {
    pub(crate) fn begin(
        journal: &'a TransactionJournal,
        description: &str,
        deadline: &Deadline,
    ) -> Result<Self> {
        journal.begin(description, deadline.instant())?;
        Ok(Self {
            journal,
            done: false,
        })
    }

    pub(crate) fn commit(mut self) -> Result<CommitOutcome> {
        self.done = true;
        self.journal.commit().map_err(Into::into)
    }

    pub(crate) fn fail(mut self, original: BrokerErr) -> BrokerErr {
        self.done = true;
        match self.journal.rollback() {
            Ok(_) => original,
            Err(rollback) => BrokerErr::RollbackFailed {
                original: Box::new(original),
                rollback: Box::new(rollback.into()),
            },
        }
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.journal.rollback() {
                tracing::error!("implicit rollback failed: {e}");
            }
        }
    }
}

/// Result of one operation: the text channel plus the declared output
/// fields the batch orchestrator may substitute into later steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub fields: BTreeMap<String, String>,
}

impl ToolOutput {
    pub fn new(text: String) -> Self {
        Self {
            text,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Tools served by the broker, in the order they are listed to clients.
pub const TOOL_NAMES: &[&str] = &[
    "read_file",
    "edit_file",
    "manage_file",
    "search",
    "project_replace",
    "batch",
    "undo",
    "redo",
    "checkpoint",
    "journal",
];

/// Single entry point shared by the host adapter and the batch
/// orchestrator.
pub fn dispatch_tool(
    ctx: &BrokerContext,
    tool: &str,
    args: JsonValue,
    deadline: &Deadline,
) -> Result<ToolOutput> {
    match tool {
        "read_file" => read::read_file(ctx, parse_params(tool, args)?, deadline),
        "edit_file" => edit::edit_file(ctx, parse_params(tool, args)?, deadline),
        "manage_file" => file_manage::manage_file(ctx, parse_params(tool, args)?, deadline),
        "search" => search::search(ctx, parse_params(tool, args)?, deadline),
        "project_replace" => replace::project_replace(ctx, parse_params(tool, args)?, deadline),
        "batch" => batch::run_batch(ctx, parse_params(tool, args)?, deadline),
        "undo" => history::undo(ctx),
        "redo" => history::redo(ctx),
        "checkpoint" => history::checkpoint(ctx, parse_params(tool, args)?),
        "journal" => history::journal(ctx, parse_params(tool, args)?),
        other => Err(BrokerErr::UnknownTool(other.to_string())),
    }
}

fn parse_params<T: DeserializeOwned>(tool: &str, args: JsonValue) -> Result<T> {
    serde_json::from_value(args).map_err(|e| BrokerErr::InvalidParams {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------
// Shared plumbing for file-touching operations
// ---------------------------------------------------------------------

pub(crate) struct LoadedFile {
    pub bytes: Vec<u8>,
    pub decoded: DecodedText,
    pub buffer: LineBuffer,
    pub crc: u32,
}

/// Read and decode a text file that already passed the sandbox. Rejects
/// directories, oversized files and binary content.
pub(crate) fn load_text_file(
    ctx: &BrokerContext,
    safe: &SafePath,
    forced: Option<Charset>,
) -> Result<LoadedFile> {
    if ctx.sandbox.is_directory(safe) {
        return Err(PathError::IsDirectory(safe.to_path_buf()).into());
    }
    ctx.sandbox.check_file_size(safe)?;
    let bytes = std::fs::read(safe.as_path())?;
    if fsio::looks_binary(&bytes) {
        return Err(PathError::Binary(safe.to_path_buf()).into());
    }
    let decoded = encoding::decode(&bytes, forced, ctx.config.fallback_charset);
    let buffer = LineBuffer::parse(&decoded.content);
    let crc = digest::crc32c_bytes(&bytes);
    Ok(LoadedFile {
        bytes,
        decoded,
        buffer,
        crc,
    })
}

/// Run the external-change protocol for a freshly loaded file: journal a
/// record and refresh the snapshot when the content diverged. Returns
/// whether the response should carry the external-change banner.
pub(crate) fn note_external_change(ctx: &BrokerContext, safe: &SafePath, file: &LoadedFile) -> bool {
    match ctx.tracker.check(safe.as_path(), file.crc) {
        CheckOutcome::External { previous } => {
            ctx.journal.record_external_change(
                safe.as_path(),
                &previous.content,
                &file.bytes,
                "modified outside the broker",
            );
            ctx.tracker.update(
                safe.as_path(),
                FileSnapshot::new(
                    file.bytes.clone(),
                    file.crc,
                    file.decoded.charset,
                    file.buffer.line_count(),
                ),
            );
            ctx.symbols.cache.invalidate(safe.as_path());
            true
        }
        CheckOutcome::FirstRead | CheckOutcome::NoChange => false,
    }
}

// ---------------------------------------------------------------------
// Response formatting: header shapes are part of the wire contract
// ---------------------------------------------------------------------

pub(crate) fn file_header(
    name: &str,
    start: u32,
    end: u32,
    total: u32,
    charset: &str,
    crc: u32,
) -> String {
    format!(
        "[FILE: {name} | LINES: {start}-{end} of {total} | ENCODING: {charset} | CRC32C: {}]",
        digest::crc32c_hex(crc)
    )
}

pub(crate) fn access_line(start: u32, end: u32, token: &str) -> String {
    format!("[ACCESS: lines {start}-{end} | TOKEN: {token}]")
}

pub(crate) fn unchanged_header(start: u32, end: u32, total: u32, crc: u32) -> String {
    format!(
        "[STATUS: UNCHANGED | LINES: {start}-{end} of {total} | CRC32C: {}]",
        digest::crc32c_hex(crc)
    )
}

/// Body rendering with the fixed `NNNN\t` display prefix.
pub(crate) fn number_lines(lines: &[String], start_line: u32) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>4}\t{}", start_line + i as u32, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn headers_match_the_wire_format() {
        assert_eq!(
            file_header("a.txt", 1, 3, 10, "UTF-8", 0xDEADBEEF),
            "[FILE: a.txt | LINES: 1-3 of 10 | ENCODING: UTF-8 | CRC32C: DEADBEEF]"
        );
        assert_eq!(
            unchanged_header(50, 60, 100, 0xAB),
            "[STATUS: UNCHANGED | LINES: 50-60 of 100 | CRC32C: 000000AB]"
        );
        assert_eq!(
            access_line(1, 2, "tok"),
            "[ACCESS: lines 1-2 | TOKEN: tok]"
        );
    }

    #[test]
    fn line_numbering_uses_four_column_tab_prefix() {
        let lines = vec!["Hello World".to_string(), "second".to_string()];
        assert_eq!(number_lines(&lines, 1), "   1\tHello World\n   2\tsecond");
    }

    #[test]
    fn deadline_tighten_keeps_the_earlier_expiry() {
        let never = Deadline::none();
        assert!(never.instant().is_none());
        let loose = Deadline::from_timeout_ms(Some(60_000));
        let tight = loose.tighten(Some(1));
        assert!(tight.instant().unwrap() < loose.instant().unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(tight.expired());
        assert!(!loose.expired());
    }

    #[test]
    fn file_locks_are_exclusive_and_released_on_drop() {
        let set = FileLockSet::new();
        let a = PathBuf::from("/p/a");
        let guard = set.acquire(vec![a.clone()], &Deadline::none()).unwrap();
        let err = set
            .acquire(vec![a.clone()], &Deadline::from_timeout_ms(Some(20)))
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerErr::Concurrency(ConcurrencyError::Cancelled)
        ));
        drop(guard);
        set.acquire(vec![a], &Deadline::none()).unwrap();
    }
}
