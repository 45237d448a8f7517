//! Nested transactions with per-file backups, undo/redo and checkpoints.
//!
//! One process-wide journal. Transactions form a single chain: a root
//! transaction plus any nested transactions opened while it is active.
//! Only the root commit is visible to undo, which is what makes batches
//! atomic from the caller's point of view. Backups are byte images held
//! in memory, keyed by a backup id; every mutating entry also captures
//! its after-image so redo replays saved state instead of re-executing
//! operations.
//!
//! The chain is owned by the thread that opened the root transaction;
//! other threads wanting a transaction wait for the chain to free up.
//! File restores run outside the state lock; the lock only guards
//! bookkeeping, never more than a single backup lookup at a time.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

use uuid::Uuid;

use crate::digest;
use crate::error::ConcurrencyError;
use crate::error::TransactionError;
use crate::fsio;

pub type BackupId = u64;

#[derive(Debug, Clone)]
pub enum TransactionEntry {
    FileMutation {
        path: PathBuf,
        backup_id: BackupId,
        after_backup_id: BackupId,
        before_crc: u32,
        after_crc: u32,
        before_lines: u32,
        after_lines: u32,
        description: String,
    },
    FileCreate {
        path: PathBuf,
        after_backup_id: BackupId,
        after_crc: u32,
    },
    FileDelete {
        path: PathBuf,
        backup_id: BackupId,
        before_crc: u32,
    },
    FileRename {
        from: PathBuf,
        to: PathBuf,
    },
    ExternalChange {
        path: PathBuf,
        backup_id: BackupId,
        after_backup_id: BackupId,
        before_crc: u32,
        after_crc: u32,
        description: String,
    },
}

impl TransactionEntry {
    fn paths(&self) -> Vec<&Path> {
        match self {
            TransactionEntry::FileMutation { path, .. }
            | TransactionEntry::FileCreate { path, .. }
            | TransactionEntry::FileDelete { path, .. }
            | TransactionEntry::ExternalChange { path, .. } => vec![path],
            TransactionEntry::FileRename { from, to } => vec![from, to],
        }
    }

    fn backup_ids(&self) -> Vec<BackupId> {
        match self {
            TransactionEntry::FileMutation {
                backup_id,
                after_backup_id,
                ..
            }
            | TransactionEntry::ExternalChange {
                backup_id,
                after_backup_id,
                ..
            } => vec![*backup_id, *after_backup_id],
            TransactionEntry::FileCreate { after_backup_id, .. } => vec![*after_backup_id],
            TransactionEntry::FileDelete { backup_id, .. } => vec![*backup_id],
            TransactionEntry::FileRename { .. } => Vec::new(),
        }
    }

    fn is_external(&self) -> bool {
        matches!(self, TransactionEntry::ExternalChange { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub description: String,
    pub status: TxnStatus,
    started_at: Instant,
    entries: Vec<TransactionEntry>,
    pending_backups: HashMap<PathBuf, BackupId>,
}

impl Transaction {
    fn new(description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            status: TxnStatus::Active,
            started_at: Instant::now(),
            entries: Vec::new(),
            pending_backups: HashMap::new(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn affected_paths(&self) -> BTreeSet<PathBuf> {
        self.entries
            .iter()
            .flat_map(|e| e.paths())
            .map(Path::to_path_buf)
            .collect()
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }
}

#[derive(Debug)]
pub struct CommitOutcome {
    /// True when the root transaction committed and the batch became
    /// visible to undo.
    pub root: bool,
    pub description: String,
}

#[derive(Debug)]
pub struct UndoReport {
    pub description: String,
    pub affected: Vec<PathBuf>,
}

/// A single filesystem step derived from a journal entry.
enum FsAction {
    Write { path: PathBuf, bytes: Vec<u8> },
    Remove { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
}

impl FsAction {
    fn path(&self) -> &Path {
        match self {
            FsAction::Write { path, .. } | FsAction::Remove { path } => path,
            FsAction::Rename { from, .. } => from,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        match self {
            FsAction::Write { path, bytes } => fsio::write_bytes_atomic_creating_dirs(path, bytes),
            FsAction::Remove { path } => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
            FsAction::Rename { from, to } => {
                if let Some(parent) = to.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::rename(from, to)
            }
        }
    }
}

#[derive(Debug, Default)]
struct JournalState {
    active: Vec<Transaction>,
    chain_owner: Option<ThreadId>,
    undo_stack: Vec<Transaction>,
    redo_stack: Vec<Transaction>,
    checkpoints: HashMap<String, usize>,
    backups: HashMap<BackupId, Vec<u8>>,
    next_backup_id: BackupId,
    histories: HashMap<PathBuf, Vec<String>>,
}

impl JournalState {
    fn store_backup(&mut self, bytes: Vec<u8>) -> BackupId {
        let id = self.next_backup_id;
        self.next_backup_id += 1;
        self.backups.insert(id, bytes);
        id
    }

    fn release_transaction_backups(&mut self, txn: &Transaction) {
        for id in txn.entries.iter().flat_map(TransactionEntry::backup_ids) {
            self.backups.remove(&id);
        }
        // Pending backups that never became entries are garbage too.
        for id in txn.pending_backups.values() {
            self.backups.remove(id);
        }
    }

    fn innermost(&mut self) -> Result<&mut Transaction, TransactionError> {
        self.active
            .last_mut()
            .ok_or(TransactionError::NoActiveTransaction)
    }

    fn record_history(&mut self, entry: &TransactionEntry) {
        match entry {
            TransactionEntry::FileMutation {
                path,
                before_lines,
                after_lines,
                description: entry_desc,
                ..
            } => {
                self.histories.entry(path.clone()).or_default().push(format!(
                    "edit: {entry_desc} (lines {before_lines} -> {after_lines})"
                ));
            }
            TransactionEntry::FileCreate { path, .. } => {
                self.histories
                    .entry(path.clone())
                    .or_default()
                    .push("created".to_string());
            }
            TransactionEntry::FileDelete { path, .. } => {
                self.histories
                    .entry(path.clone())
                    .or_default()
                    .push("deleted".to_string());
            }
            TransactionEntry::FileRename { from, to } => {
                let mut history = self.histories.remove(from).unwrap_or_default();
                history.push(format!("moved from {}", from.display()));
                self.histories
                    .entry(to.clone())
                    .or_default()
                    .append(&mut history);
            }
            TransactionEntry::ExternalChange {
                path,
                description: entry_desc,
                ..
            } => {
                self.histories
                    .entry(path.clone())
                    .or_default()
                    .push(format!("[EXTERNAL] {entry_desc}"));
            }
        }
    }

    fn commit_root(&mut self, txn: Transaction) {
        for entry in &txn.entries {
            self.record_history(entry);
        }
        for dropped in self.redo_stack.drain(..).collect::<Vec<_>>() {
            self.release_transaction_backups(&dropped);
        }
        self.undo_stack.push(txn);
    }
}

#[derive(Debug, Default)]
pub struct TransactionJournal {
    state: Mutex<JournalState>,
    chain_freed: Condvar,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. Nests when the calling thread already owns the
    /// chain; otherwise waits (up to `deadline`) for the chain to free up.
    pub fn begin(
        &self,
        description: &str,
        deadline: Option<Instant>,
    ) -> Result<Uuid, ConcurrencyError> {
        let current = std::thread::current().id();
        let mut state = self.lock();
        loop {
            match state.chain_owner {
                None => {
                    state.chain_owner = Some(current);
                    break;
                }
                Some(owner) if owner == current => break,
                Some(_) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(ConcurrencyError::Cancelled);
                    }
                    let (next, _) = match self
                        .chain_freed
                        .wait_timeout(state, Duration::from_millis(25))
                    {
                        Ok(pair) => pair,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    state = next;
                }
            }
        }
        let txn = Transaction::new(description.to_string());
        let id = txn.id;
        state.active.push(txn);
        Ok(id)
    }

    pub fn in_transaction(&self) -> bool {
        !self.lock().active.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.lock().active.len()
    }

    /// Capture `bytes` as the pre-image of `path` unless the innermost
    /// transaction already backed this path up.
    pub fn backup(&self, path: &Path, bytes: &[u8]) -> Result<BackupId, TransactionError> {
        let mut state = self.lock();
        if let Some(id) = state
            .active
            .last()
            .and_then(|txn| txn.pending_backups.get(path))
        {
            return Ok(*id);
        }
        state.innermost()?;
        let id = state.store_backup(bytes.to_vec());
        if let Some(txn) = state.active.last_mut() {
            txn.pending_backups.insert(path.to_path_buf(), id);
        }
        Ok(id)
    }

    /// Record a content mutation of `path`. Requires a prior [`Self::backup`]
    /// for the path in the same transaction.
    pub fn record_mutation(
        &self,
        path: &Path,
        after_bytes: &[u8],
        before_lines: u32,
        after_lines: u32,
        description: &str,
    ) -> Result<(), TransactionError> {
        let mut state = self.lock();
        state.innermost()?;
        let backup_id = state
            .active
            .last()
            .and_then(|txn| txn.pending_backups.get(path).copied())
            .ok_or_else(|| TransactionError::MissingBackup(path.to_path_buf()))?;
        let before_crc = state
            .backups
            .get(&backup_id)
            .map(|b| digest::crc32c_bytes(b))
            .unwrap_or_default();
        let after_crc = digest::crc32c_bytes(after_bytes);
        let after_backup_id = state.store_backup(after_bytes.to_vec());
        let entry = TransactionEntry::FileMutation {
            path: path.to_path_buf(),
            backup_id,
            after_backup_id,
            before_crc,
            after_crc,
            before_lines,
            after_lines,
            description: description.to_string(),
        };
        state.innermost()?.entries.push(entry);
        Ok(())
    }

    pub fn record_create(&self, path: &Path, after_bytes: &[u8]) -> Result<(), TransactionError> {
        let mut state = self.lock();
        state.innermost()?;
        let after_crc = digest::crc32c_bytes(after_bytes);
        let after_backup_id = state.store_backup(after_bytes.to_vec());
        state.innermost()?.entries.push(TransactionEntry::FileCreate {
            path: path.to_path_buf(),
            after_backup_id,
            after_crc,
        });
        Ok(())
    }

    pub fn record_delete(&self, path: &Path, before_bytes: &[u8]) -> Result<(), TransactionError> {
        let mut state = self.lock();
        state.innermost()?;
        let before_crc = digest::crc32c_bytes(before_bytes);
        let backup_id = state.store_backup(before_bytes.to_vec());
        state.innermost()?.entries.push(TransactionEntry::FileDelete {
            path: path.to_path_buf(),
            backup_id,
            before_crc,
        });
        Ok(())
    }

    pub fn record_rename(&self, from: &Path, to: &Path) -> Result<(), TransactionError> {
        let mut state = self.lock();
        state.innermost()?.entries.push(TransactionEntry::FileRename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    /// Record an edit that happened outside the broker. Appends to the
    /// calling thread's open transaction when there is one; otherwise the
    /// record becomes a committed singleton transaction so plain `undo`
    /// can recover the pre-external state.
    pub fn record_external_change(
        &self,
        path: &Path,
        before_bytes: &[u8],
        after_bytes: &[u8],
        description: &str,
    ) {
        let mut state = self.lock();
        let before_crc = digest::crc32c_bytes(before_bytes);
        let after_crc = digest::crc32c_bytes(after_bytes);
        let backup_id = state.store_backup(before_bytes.to_vec());
        let after_backup_id = state.store_backup(after_bytes.to_vec());
        let entry = TransactionEntry::ExternalChange {
            path: path.to_path_buf(),
            backup_id,
            after_backup_id,
            before_crc,
            after_crc,
            description: description.to_string(),
        };
        let owns_chain = state.chain_owner == Some(std::thread::current().id());
        if owns_chain && !state.active.is_empty() {
            if let Some(txn) = state.active.last_mut() {
                txn.entries.push(entry);
            }
            return;
        }
        let mut txn = Transaction::new(format!("external change to {}", path.display()));
        txn.entries.push(entry);
        txn.status = TxnStatus::Committed;
        state.commit_root(txn);
    }

    /// Commit the innermost transaction. Nested commits flush entries into
    /// the parent; the root commit pushes onto the undo stack and clears
    /// the redo stack.
    pub fn commit(&self) -> Result<CommitOutcome, TransactionError> {
        let mut state = self.lock();
        let mut txn = state
            .active
            .pop()
            .ok_or(TransactionError::NoActiveTransaction)?;
        txn.status = TxnStatus::Committed;
        let description = txn.description.clone();
        if let Some(parent) = state.active.last_mut() {
            parent.entries.append(&mut txn.entries);
            for (path, id) in txn.pending_backups.drain() {
                parent.pending_backups.entry(path).or_insert(id);
            }
            return Ok(CommitOutcome {
                root: false,
                description,
            });
        }
        state.commit_root(txn);
        state.chain_owner = None;
        drop(state);
        self.chain_freed.notify_all();
        Ok(CommitOutcome {
            root: true,
            description,
        })
    }

    /// Undo the innermost transaction's entries in reverse order and drop
    /// it. A nested rollback leaves the parent active.
    pub fn rollback(&self) -> Result<Vec<PathBuf>, TransactionError> {
        let (mut txn, actions) = {
            let mut state = self.lock();
            let txn = state
                .active
                .pop()
                .ok_or(TransactionError::NoActiveTransaction)?;
            let actions = revert_actions(&txn, &state.backups);
            if state.active.is_empty() {
                state.chain_owner = None;
            }
            (txn, actions)
        };
        self.chain_freed.notify_all();
        let affected: Vec<PathBuf> = txn.affected_paths().into_iter().collect();
        if let Err((path, source)) = apply_actions(&actions) {
            // Keep the backups for forensic recovery.
            tracing::error!("rollback of `{}` failed at {}", txn.description, path.display());
            return Err(TransactionError::RollbackPartial { path, source });
        }
        txn.status = TxnStatus::RolledBack;
        let mut state = self.lock();
        state.release_transaction_backups(&txn);
        Ok(affected)
    }

    /// Reverse-apply the most recent committed transaction and park it on
    /// the redo stack.
    pub fn undo(&self) -> Result<UndoReport, TransactionError> {
        let (txn, actions) = {
            let mut state = self.lock();
            let txn = state.undo_stack.pop().ok_or(TransactionError::NothingToUndo)?;
            let actions = revert_actions(&txn, &state.backups);
            (txn, actions)
        };
        match apply_actions(&actions) {
            Ok(()) => {
                let report = UndoReport {
                    description: txn.description.clone(),
                    affected: txn.affected_paths().into_iter().collect(),
                };
                let mut state = self.lock();
                for path in &report.affected {
                    state
                        .histories
                        .entry(path.clone())
                        .or_default()
                        .push(format!("undo: {}", report.description));
                }
                state.redo_stack.push(txn);
                Ok(report)
            }
            Err((path, source)) => {
                self.lock().undo_stack.push(txn);
                Err(TransactionError::RollbackPartial { path, source })
            }
        }
    }

    /// Re-apply the most recently undone transaction from its saved
    /// after-images.
    pub fn redo(&self) -> Result<UndoReport, TransactionError> {
        let (txn, actions) = {
            let mut state = self.lock();
            let txn = state.redo_stack.pop().ok_or(TransactionError::NothingToRedo)?;
            let actions = replay_actions(&txn, &state.backups);
            (txn, actions)
        };
        match apply_actions(&actions) {
            Ok(()) => {
                let report = UndoReport {
                    description: txn.description.clone(),
                    affected: txn.affected_paths().into_iter().collect(),
                };
                let mut state = self.lock();
                for path in &report.affected {
                    state
                        .histories
                        .entry(path.clone())
                        .or_default()
                        .push(format!("redo: {}", report.description));
                }
                state.undo_stack.push(txn);
                Ok(report)
            }
            Err((path, source)) => {
                self.lock().redo_stack.push(txn);
                Err(TransactionError::RollbackPartial { path, source })
            }
        }
    }

    /// Remember the current undo-stack depth under `name`.
    pub fn checkpoint(&self, name: &str) {
        let mut state = self.lock();
        let depth = state.undo_stack.len();
        state.checkpoints.insert(name.to_string(), depth);
    }

    /// Undo every transaction committed after the named checkpoint.
    pub fn rollback_to(&self, name: &str) -> Result<Vec<UndoReport>, TransactionError> {
        let depth = *self
            .lock()
            .checkpoints
            .get(name)
            .ok_or_else(|| TransactionError::UnknownCheckpoint(name.to_string()))?;
        let mut reports = Vec::new();
        while self.lock().undo_stack.len() > depth {
            reports.push(self.undo()?);
        }
        Ok(reports)
    }

    pub fn undo_depth(&self) -> usize {
        self.lock().undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.lock().redo_stack.len()
    }

    /// Human-readable listing of the committed transactions.
    pub fn journal_text(&self) -> String {
        let state = self.lock();
        let mut out = format!(
            "TRANSACTION JOURNAL: {} committed, {} redoable\n",
            state.undo_stack.len(),
            state.redo_stack.len()
        );
        for (i, txn) in state.undo_stack.iter().enumerate() {
            let marker = if txn.entries.iter().any(TransactionEntry::is_external) {
                " [EXTERNAL]"
            } else {
                ""
            };
            out.push_str(&format!(
                "{:3}. {}{} ({} change(s))\n",
                i + 1,
                txn.description,
                marker,
                txn.entries.len()
            ));
            for entry in &txn.entries {
                out.push_str(&format!("       {}\n", describe_entry(entry)));
            }
        }
        if !state.checkpoints.is_empty() {
            let mut names: Vec<_> = state.checkpoints.iter().collect();
            names.sort_by_key(|(_, depth)| **depth);
            for (name, depth) in names {
                out.push_str(&format!("checkpoint `{name}` at position {depth}\n"));
            }
        }
        out
    }

    /// Per-file history: descriptions and deltas, including external
    /// changes and undo/redo events. Survives undo, unlike the stacks.
    pub fn history_of(&self, path: &Path) -> Vec<String> {
        self.lock().histories.get(path).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn describe_entry(entry: &TransactionEntry) -> String {
    match entry {
        TransactionEntry::FileMutation {
            path,
            before_lines,
            after_lines,
            ..
        } => format!("{}: lines {} -> {}", path.display(), before_lines, after_lines),
        TransactionEntry::FileCreate { path, .. } => format!("{}: created", path.display()),
        TransactionEntry::FileDelete { path, .. } => format!("{}: deleted", path.display()),
        TransactionEntry::FileRename { from, to } => {
            format!("{} -> {}", from.display(), to.display())
        }
        TransactionEntry::ExternalChange { path, description, .. } => {
            format!("{}: [EXTERNAL] {}", path.display(), description)
        }
    }
}

fn backup_bytes(backups: &HashMap<BackupId, Vec<u8>>, id: BackupId) -> Vec<u8> {
    backups.get(&id).cloned().unwrap_or_default()
}

/// Filesystem steps that undo `txn`, in reverse entry order.
fn revert_actions(txn: &Transaction, backups: &HashMap<BackupId, Vec<u8>>) -> Vec<FsAction> {
    txn.entries
        .iter()
        .rev()
        .map(|entry| match entry {
            TransactionEntry::FileMutation { path, backup_id, .. }
            | TransactionEntry::FileDelete { path, backup_id, .. }
            | TransactionEntry::ExternalChange { path, backup_id, .. } => FsAction::Write {
                path: path.clone(),
                bytes: backup_bytes(backups, *backup_id),
            },
            TransactionEntry::FileCreate { path, .. } => FsAction::Remove { path: path.clone() },
            TransactionEntry::FileRename { from, to } => FsAction::Rename {
                from: to.clone(),
                to: from.clone(),
            },
        })
        .collect()
}

/// Filesystem steps that re-apply `txn`, in entry order, from after-images.
fn replay_actions(txn: &Transaction, backups: &HashMap<BackupId, Vec<u8>>) -> Vec<FsAction> {
    txn.entries
        .iter()
        .map(|entry| match entry {
            TransactionEntry::FileMutation {
                path,
                after_backup_id,
                ..
            }
            | TransactionEntry::FileCreate {
                path,
                after_backup_id,
                ..
            }
            | TransactionEntry::ExternalChange {
                path,
                after_backup_id,
                ..
            } => FsAction::Write {
                path: path.clone(),
                bytes: backup_bytes(backups, *after_backup_id),
            },
            TransactionEntry::FileDelete { path, .. } => FsAction::Remove { path: path.clone() },
            TransactionEntry::FileRename { from, to } => FsAction::Rename {
                from: from.clone(),
                to: to.clone(),
            },
        })
        .collect()
}

fn apply_actions(actions: &[FsAction]) -> Result<(), (PathBuf, std::io::Error)> {
    for action in actions {
        action
            .apply()
            .map_err(|e| (action.path().to_path_buf(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write(path: &Path, text: &str) {
        std::fs::write(path, text).unwrap();
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    /// Run an edit the way operations do: backup, write, record.
    fn edit_file(journal: &TransactionJournal, path: &Path, new_text: &str) {
        let before = std::fs::read(path).unwrap();
        journal.backup(path, &before).unwrap();
        write(path, new_text);
        journal
            .record_mutation(path, new_text.as_bytes(), 1, 1, "test edit")
            .unwrap();
    }

    #[test]
    fn commit_then_undo_restores_bytes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        write(&file, "before");

        let journal = TransactionJournal::new();
        journal.begin("change a", None).unwrap();
        edit_file(&journal, &file, "after");
        let outcome = journal.commit().unwrap();
        assert!(outcome.root);
        assert_eq!(read(&file), "after");

        let report = journal.undo().unwrap();
        assert_eq!(report.affected, vec![file.clone()]);
        assert_eq!(read(&file), "before");
    }

    #[test]
    fn undo_then_redo_round_trips() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        write(&file, "v1");

        let journal = TransactionJournal::new();
        journal.begin("edit", None).unwrap();
        edit_file(&journal, &file, "v2");
        journal.commit().unwrap();

        journal.undo().unwrap();
        assert_eq!(read(&file), "v1");
        journal.redo().unwrap();
        assert_eq!(read(&file), "v2");
        journal.undo().unwrap();
        assert_eq!(read(&file), "v1");
    }

    #[test]
    fn rollback_restores_all_entries_in_reverse() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        write(&a, "A");
        write(&b, "B");

        let journal = TransactionJournal::new();
        journal.begin("multi", None).unwrap();
        edit_file(&journal, &a, "A2");
        edit_file(&journal, &b, "B2");
        journal.rollback().unwrap();

        assert_eq!(read(&a), "A");
        assert_eq!(read(&b), "B");
        assert_eq!(journal.undo_depth(), 0);
    }

    #[test]
    fn nested_commit_flushes_into_parent() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        write(&a, "A");
        write(&b, "B");

        let journal = TransactionJournal::new();
        journal.begin("outer", None).unwrap();
        journal.begin("inner-1", None).unwrap();
        edit_file(&journal, &a, "A2");
        let outcome = journal.commit().unwrap();
        assert!(!outcome.root);
        journal.begin("inner-2", None).unwrap();
        edit_file(&journal, &b, "B2");
        journal.commit().unwrap();
        journal.commit().unwrap();

        // One undo entry for the whole batch.
        assert_eq!(journal.undo_depth(), 1);
        journal.undo().unwrap();
        assert_eq!(read(&a), "A");
        assert_eq!(read(&b), "B");
    }

    #[test]
    fn nested_rollback_leaves_parent_active() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        write(&a, "A");

        let journal = TransactionJournal::new();
        journal.begin("outer", None).unwrap();
        journal.begin("inner", None).unwrap();
        edit_file(&journal, &a, "broken");
        journal.rollback().unwrap();
        assert_eq!(read(&a), "A");
        assert!(journal.in_transaction());
        journal.commit().unwrap();
        // Outer committed empty: nothing to undo beyond it.
        assert_eq!(journal.undo_depth(), 1);
    }

    #[test]
    fn root_commit_clears_the_redo_stack() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        write(&a, "v1");

        let journal = TransactionJournal::new();
        journal.begin("one", None).unwrap();
        edit_file(&journal, &a, "v2");
        journal.commit().unwrap();
        journal.undo().unwrap();
        assert_eq!(journal.redo_depth(), 1);

        journal.begin("two", None).unwrap();
        edit_file(&journal, &a, "v3");
        journal.commit().unwrap();
        assert_eq!(journal.redo_depth(), 0);
        assert!(matches!(journal.redo(), Err(TransactionError::NothingToRedo)));
    }

    #[test]
    fn create_and_delete_round_trip_through_undo() {
        let dir = tempdir().unwrap();
        let created = dir.path().join("new.txt");
        let doomed = dir.path().join("old.txt");
        write(&doomed, "old content");

        let journal = TransactionJournal::new();
        journal.begin("create+delete", None).unwrap();
        write(&created, "fresh");
        journal.record_create(&created, b"fresh").unwrap();
        let old = std::fs::read(&doomed).unwrap();
        journal.record_delete(&doomed, &old).unwrap();
        std::fs::remove_file(&doomed).unwrap();
        journal.commit().unwrap();

        journal.undo().unwrap();
        assert!(!created.exists());
        assert_eq!(read(&doomed), "old content");

        journal.redo().unwrap();
        assert_eq!(read(&created), "fresh");
        assert!(!doomed.exists());
    }

    #[test]
    fn rename_undoes_and_redoes() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("m.txt");
        let to = dir.path().join("sub").join("n.txt");
        write(&from, "body");

        let journal = TransactionJournal::new();
        journal.begin("move", None).unwrap();
        std::fs::create_dir_all(to.parent().unwrap()).unwrap();
        std::fs::rename(&from, &to).unwrap();
        journal.record_rename(&from, &to).unwrap();
        journal.commit().unwrap();

        journal.undo().unwrap();
        assert!(from.exists());
        assert!(!to.exists());
        journal.redo().unwrap();
        assert!(!from.exists());
        assert!(to.exists());
    }

    #[test]
    fn external_change_without_txn_commits_a_singleton() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.txt");
        write(&file, "v2");

        let journal = TransactionJournal::new();
        journal.record_external_change(&file, b"v1", b"v2", "modified outside the broker");
        assert_eq!(journal.undo_depth(), 1);
        assert!(journal.journal_text().contains("[EXTERNAL]"));

        journal.undo().unwrap();
        assert_eq!(read(&file), "v1");
    }

    #[test]
    fn checkpoint_rolls_back_to_position() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        write(&file, "v1");

        let journal = TransactionJournal::new();
        journal.begin("one", None).unwrap();
        edit_file(&journal, &file, "v2");
        journal.commit().unwrap();

        journal.checkpoint("stable");

        journal.begin("two", None).unwrap();
        edit_file(&journal, &file, "v3");
        journal.commit().unwrap();
        journal.begin("three", None).unwrap();
        edit_file(&journal, &file, "v4");
        journal.commit().unwrap();

        let reports = journal.rollback_to("stable").unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(read(&file), "v2");
        assert!(matches!(
            journal.rollback_to("missing"),
            Err(TransactionError::UnknownCheckpoint(_))
        ));
    }

    #[test]
    fn history_survives_undo() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        write(&file, "v1");

        let journal = TransactionJournal::new();
        journal.begin("edit a", None).unwrap();
        edit_file(&journal, &file, "v2");
        journal.commit().unwrap();
        journal.undo().unwrap();

        let history = journal.history_of(&file);
        assert_eq!(history.len(), 2);
        assert!(history[0].starts_with("edit:"));
        assert!(history[1].starts_with("undo:"));
    }

    #[test]
    fn commit_without_transaction_errors() {
        let journal = TransactionJournal::new();
        assert!(matches!(
            journal.commit(),
            Err(TransactionError::NoActiveTransaction)
        ));
        assert!(matches!(
            journal.undo(),
            Err(TransactionError::NothingToUndo)
        ));
    }
}
