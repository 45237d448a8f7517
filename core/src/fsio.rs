//! Low-level file plumbing shared by the codec and the journal.

use std::io;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// How many leading bytes are sniffed for NUL when deciding whether a file
/// is binary.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// A NUL byte in the first 8 KiB marks the content as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    head.contains(&0)
}

/// Write `bytes` to `path` atomically: write a sibling temp file, fsync it,
/// then rename over the destination. Readers never observe a torn file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` has no parent directory", path.display()),
        )
    })?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Like [`write_bytes_atomic`] but creates missing parent directories first.
pub fn write_bytes_atomic_creating_dirs(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_bytes_atomic(path, bytes)
}
