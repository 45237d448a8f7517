use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerErr>;

/// Why a previously issued line-access token no longer matches the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    LineCountChanged,
    RangeCrcMismatch,
    OutOfRange,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StaleReason::LineCountChanged => "the file's line count changed",
            StaleReason::RangeCrcMismatch => "the covered lines changed",
            StaleReason::OutOfRange => "the covered range no longer exists",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("path `{0}` resolves outside every project root")]
    OutsideRoot(PathBuf),

    #[error("path `{0}` is protected and cannot be touched by the broker")]
    Protected(PathBuf),

    #[error("path `{0}` does not exist")]
    NotFound(PathBuf),

    #[error("path `{0}` is a directory")]
    IsDirectory(PathBuf),

    #[error("file `{path}` is {size} bytes which exceeds the {limit}-byte limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("file `{0}` appears to be binary; only text files are served")]
    Binary(PathBuf),
}

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("no access token supplied for `{0}`; read the lines first to obtain one")]
    MissingToken(PathBuf),

    #[error("access token is malformed")]
    MalformedToken,

    #[error("access token was not issued for `{0}`")]
    PathMismatch(PathBuf),

    #[error(
        "access token for `{path}` is stale: {reason}; re-read the lines to obtain a fresh token"
    )]
    StaleToken { path: PathBuf, reason: StaleReason },

    #[error(
        "access token for `{path}` covers lines {held_start}-{held_end} but the edit touches lines {start}-{end}"
    )]
    TokenDoesNotCover {
        path: PathBuf,
        held_start: u32,
        held_end: u32,
        start: u32,
        end: u32,
    },

    #[error("`{0}` already exists; read it first and pass its checksum to overwrite")]
    MustReadFirst(PathBuf),
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error(
        "exactly one access selector (line, line range, ranges, context pattern or symbol) must be supplied; whole-file reads are not served"
    )]
    MustSpecifyRange,

    #[error("pattern `{pattern}` not found in `{path}`")]
    PatternNotFound { path: PathBuf, pattern: String },

    #[error("symbol `{symbol}` not found in `{path}`")]
    SymbolNotFound { path: PathBuf, symbol: String },

    #[error("line {line} is out of range for `{path}` which has {total} lines")]
    LineOutOfRange { path: PathBuf, line: u32, total: u32 },

    #[error(
        "expected content does not match `{path}`; actual content of the range:\n{actual}\n{diff}"
    )]
    ExpectedMismatch {
        path: PathBuf,
        actual: String,
        diff: String,
    },
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("character `{ch}` at position {pos} cannot be encoded as {charset}")]
    Unmappable {
        ch: char,
        pos: usize,
        charset: String,
    },

    #[error("unknown charset label `{0}`")]
    UnknownCharset(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("no transaction is active")]
    NoActiveTransaction,

    #[error("no backup was captured for `{0}` in the active transaction")]
    MissingBackup(PathBuf),

    #[error("rollback failed while restoring `{path}`: {source}; remaining backups were kept")]
    RollbackPartial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("unknown checkpoint `{0}`")]
    UnknownCheckpoint(String),
}

#[derive(Error, Debug)]
pub enum ConcurrencyError {
    #[error("`{0}` is locked by another operation")]
    FileLockedByAnotherOp(PathBuf),

    #[error("operation cancelled: deadline expired")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum BrokerErr {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// A batch step failed; every earlier mutation was rolled back.
    #[error("batch step {step} (`{tool}`) failed: {source}")]
    BatchStep {
        step: usize,
        tool: String,
        #[source]
        source: Box<BrokerErr>,
    },

    /// The original failure plus a rollback that could not complete.
    #[error("{original} (additionally, rollback failed: {rollback})")]
    RollbackFailed {
        original: Box<BrokerErr>,
        rollback: Box<BrokerErr>,
    },

    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid parameters for `{tool}`: {message}")]
    InvalidParams { tool: String, message: String },

    /// Pass-through failure from an external collaborator.
    #[error("{0}")]
    Host(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
