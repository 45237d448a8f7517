//! Last-known file snapshots and external-change detection.
//!
//! The broker keeps one snapshot per tracked path: the content, CRC,
//! charset and line count it last observed. A read whose on-disk CRC
//! differs from the snapshot means someone edited the file behind the
//! broker's back; the caller decides what to do with that (journal it,
//! refresh the snapshot, banner the response). `check` itself never
//! mutates the map.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use crate::encoding::Charset;

#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub content: Vec<u8>,
    pub crc32c: u32,
    pub charset: Charset,
    pub line_count: u32,
    pub taken_at: Instant,
}

impl FileSnapshot {
    pub fn new(content: Vec<u8>, crc32c: u32, charset: Charset, line_count: u32) -> Self {
        Self {
            content,
            crc32c,
            charset,
            line_count,
            taken_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub enum CheckOutcome {
    /// Snapshot exists and matches the current content.
    NoChange,
    /// No snapshot yet; this is the first time the broker sees the file.
    FirstRead,
    /// Snapshot exists and the content diverged outside the broker.
    External { previous: FileSnapshot },
}

#[derive(Debug, Default)]
pub struct ExternalChangeTracker {
    snapshots: Mutex<HashMap<PathBuf, FileSnapshot>>,
}

impl ExternalChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the current on-disk CRC with the last-known snapshot.
    pub fn check(&self, path: &Path, current_crc: u32) -> CheckOutcome {
        let snapshots = self.lock();
        match snapshots.get(path) {
            None => CheckOutcome::FirstRead,
            Some(snapshot) if snapshot.crc32c == current_crc => CheckOutcome::NoChange,
            Some(snapshot) => CheckOutcome::External {
                previous: snapshot.clone(),
            },
        }
    }

    /// Insert a snapshot only if the path is not tracked yet.
    pub fn register(&self, path: &Path, snapshot: FileSnapshot) {
        self.lock().entry(path.to_path_buf()).or_insert(snapshot);
    }

    /// Replace (or create) the snapshot for `path`.
    pub fn update(&self, path: &Path, snapshot: FileSnapshot) {
        self.lock().insert(path.to_path_buf(), snapshot);
    }

    /// Move the snapshot key when a file is renamed so the destination does
    /// not misreport an external change on its next read.
    pub fn migrate(&self, from: &Path, to: &Path) {
        let mut snapshots = self.lock();
        if let Some(snapshot) = snapshots.remove(from) {
            snapshots.insert(to.to_path_buf(), snapshot);
        }
    }

    pub fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn snapshot(&self, path: &Path) -> Option<FileSnapshot> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, FileSnapshot>> {
        match self.snapshots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
