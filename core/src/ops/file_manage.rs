//! File lifecycle: create, move, rename and delete, all journaled.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::BrokerContext;
use crate::digest;
use crate::encoding;
use crate::encoding::Charset;
use crate::error::AccessError;
use crate::error::BrokerErr;
use crate::error::ContentError;
use crate::error::PathError;
use crate::error::Result;
use crate::ops;
use crate::ops::Deadline;
use crate::ops::ToolOutput;
use crate::ops::TxnGuard;
use crate::sandbox::SafePath;
use crate::tracker::FileSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ManageAction {
    Create,
    Move,
    Rename,
    Delete,
}

/// Parameters for `manage_file`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ManageFileParams {
    pub action: ManageAction,

    /// The file the action applies to.
    pub path: String,

    /// Destination: a directory or full path for `move`, the new file
    /// name for `rename`.
    #[serde(default)]
    pub to: Option<String>,

    /// Initial content for `create` (defaults to empty).
    #[serde(default)]
    pub content: Option<String>,

    /// CRC32C (hex) of the current content; required to overwrite an
    /// existing file with `create`.
    #[serde(default)]
    pub expected_checksum: Option<String>,

    /// Charset for `create` (defaults to UTF-8).
    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn manage_file(ctx: &BrokerContext, params: ManageFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let deadline = deadline.tighten(params.timeout_ms);
    match params.action {
        ManageAction::Create => create(ctx, &params, &deadline),
        ManageAction::Move | ManageAction::Rename => relocate(ctx, &params, &deadline),
        ManageAction::Delete => delete(ctx, &params, &deadline),
    }
}

fn create(ctx: &BrokerContext, params: &ManageFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let safe = ctx.sandbox.sanitize(&params.path, false)?;
    if ctx.sandbox.is_directory(&safe) {
        return Err(PathError::IsDirectory(safe.to_path_buf()).into());
    }
    let charset = match params.encoding.as_deref() {
        Some(label) => Charset::for_label(label)?,
        None => Charset::Utf8 { bom: false },
    };
    let content = params.content.clone().unwrap_or_default();

    let txn = TxnGuard::begin(&ctx.journal, &format!("create {}", safe.display_name()), deadline)?;
    let _lock = match ctx.locks.acquire(vec![safe.to_path_buf()], deadline) {
        Ok(lock) => lock,
        Err(e) => return Err(txn.fail(e)),
    };
    let result = create_locked(ctx, &safe, &content, charset, params);
    match result {
        Ok(output) => {
            txn.commit()?;
            Ok(output)
        }
        Err(e) => Err(txn.fail(e)),
    }
}

fn create_locked(
    ctx: &BrokerContext,
    safe: &SafePath,
    content: &str,
    charset: Charset,
    params: &ManageFileParams,
) -> Result<ToolOutput> {
    let overwriting = ctx.sandbox.exists(safe);
    if overwriting {
        let current = std::fs::read(safe.as_path())?;
        let current_crc = digest::crc32c_bytes(&current);
        let Some(expected) = params.expected_checksum.as_deref() else {
            return Err(AccessError::MustReadFirst(safe.to_path_buf()).into());
        };
        let expected_crc = u32::from_str_radix(expected.trim_start_matches("0x"), 16)
            .map_err(|_| BrokerErr::InvalidParams {
                tool: "manage_file".to_string(),
                message: format!("`expected_checksum` is not hex: {expected}"),
            })?;
        if expected_crc != current_crc {
            return Err(ContentError::ExpectedMismatch {
                path: safe.to_path_buf(),
                actual: digest::crc32c_hex(current_crc),
                diff: String::new(),
            }
            .into());
        }
        ctx.journal.backup(safe.as_path(), &current)?;
    }

    if let Some(parent) = safe.as_path().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let (crc, bytes) = encoding::write_text(safe.as_path(), content, charset)?;
    let buffer = crate::lines::LineBuffer::parse(content);
    let total = buffer.line_count();
    if overwriting {
        let before = ctx
            .tracker
            .snapshot(safe.as_path())
            .map(|s| s.line_count)
            .unwrap_or(0);
        ctx.journal.record_mutation(
            safe.as_path(),
            &bytes,
            before,
            total,
            &format!("overwrite {}", safe.display_name()),
        )?;
    } else {
        ctx.journal.record_create(safe.as_path(), &bytes)?;
    }
    ctx.tracker
        .update(safe.as_path(), FileSnapshot::new(bytes, crc, charset, total));
    ctx.symbols.cache.invalidate(safe.as_path());

    let (start, end) = if total == 0 { (0, 0) } else { (1, total) };
    let token = ctx.tokens.issue(safe, start, end, buffer.range(start, end), total);
    let encoded = ctx.tokens.encode(&token);
    let name = safe.display_name();
    let text = format!(
        "[CREATED: {name} | LINES: {total} total | ENCODING: {} | CRC32C: {}]\n{}",
        charset.label(),
        digest::crc32c_hex(crc),
        ops::access_line(start, end, &encoded),
    );
    Ok(ToolOutput::new(text)
        .with_field("token", encoded)
        .with_field("crc32c", digest::crc32c_hex(crc))
        .with_field("path", name)
        .with_field("line_count", total.to_string()))
}

fn relocate(ctx: &BrokerContext, params: &ManageFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let from = ctx.sandbox.sanitize(&params.path, true)?;
    if ctx.sandbox.is_directory(&from) {
        return Err(PathError::IsDirectory(from.to_path_buf()).into());
    }
    let to_raw = params.to.as_deref().ok_or_else(|| BrokerErr::InvalidParams {
        tool: "manage_file".to_string(),
        message: "`to` is required for move/rename".to_string(),
    })?;
    let to = resolve_destination(ctx, &from, params.action, to_raw)?;
    if ctx.sandbox.exists(&to) {
        return Err(AccessError::MustReadFirst(to.to_path_buf()).into());
    }

    let verb = if params.action == ManageAction::Move { "move" } else { "rename" };
    let txn = TxnGuard::begin(
        &ctx.journal,
        &format!("{verb} {} -> {}", from.display_name(), to.display_name()),
        deadline,
    )?;
    let _locks = match ctx
        .locks
        .acquire(vec![from.to_path_buf(), to.to_path_buf()], deadline)
    {
        Ok(locks) => locks,
        Err(e) => return Err(txn.fail(e)),
    };
    let moved = (|| -> Result<()> {
        if let Some(parent) = to.as_path().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::rename(from.as_path(), to.as_path())?;
        ctx.journal.record_rename(from.as_path(), to.as_path())?;
        Ok(())
    })();
    if let Err(e) = moved {
        return Err(txn.fail(e));
    }
    // The snapshot key follows the file, so the next read of the new path
    // does not misreport an external change.
    ctx.tracker.migrate(from.as_path(), to.as_path());
    ctx.symbols.cache.invalidate(from.as_path());
    txn.commit()?;

    let text = format!("[{}: {} -> {}]", verb.to_uppercase(), from.display_name(), to.display_name());
    Ok(ToolOutput::new(text)
        .with_field("path", to.display_name())
        .with_field("from", from.display_name()))
}

fn resolve_destination(
    ctx: &BrokerContext,
    from: &SafePath,
    action: ManageAction,
    to_raw: &str,
) -> Result<SafePath> {
    if action == ManageAction::Rename {
        // New name within the same directory.
        if to_raw.contains('/') || to_raw.contains('\\') {
            return Err(BrokerErr::InvalidParams {
                tool: "manage_file".to_string(),
                message: "`to` must be a bare file name for rename".to_string(),
            });
        }
        let parent = from
            .as_path()
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        let dest = parent.join(to_raw);
        return Ok(ctx.sandbox.sanitize(&dest.to_string_lossy(), false)?);
    }
    // `move`: destination directory or full path.
    let dest = ctx.sandbox.sanitize(to_raw, false)?;
    if ctx.sandbox.is_directory(&dest) {
        let file_name = from.as_path().file_name().unwrap_or_default();
        let full = dest.as_path().join(file_name);
        return Ok(ctx.sandbox.sanitize(&full.to_string_lossy(), false)?);
    }
    Ok(dest)
}

fn delete(ctx: &BrokerContext, params: &ManageFileParams, deadline: &Deadline) -> Result<ToolOutput> {
    let safe = ctx.sandbox.sanitize(&params.path, true)?;
    if ctx.sandbox.is_directory(&safe) {
        return Err(PathError::IsDirectory(safe.to_path_buf()).into());
    }
    let txn = TxnGuard::begin(&ctx.journal, &format!("delete {}", safe.display_name()), deadline)?;
    let _lock = match ctx.locks.acquire(vec![safe.to_path_buf()], deadline) {
        Ok(lock) => lock,
        Err(e) => return Err(txn.fail(e)),
    };
    let removed = (|| -> Result<()> {
        let bytes = std::fs::read(safe.as_path())?;
        ctx.journal.record_delete(safe.as_path(), &bytes)?;
        std::fs::remove_file(safe.as_path())?;
        Ok(())
    })();
    if let Err(e) = removed {
        return Err(txn.fail(e));
    }
    ctx.tracker.forget(safe.as_path());
    ctx.symbols.cache.invalidate(safe.as_path());
    txn.commit()?;

    let name = safe.display_name();
    Ok(ToolOutput::new(format!("[DELETED: {name}]")).with_field("path", name))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use crate::tracker::CheckOutcome;
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

    fn base(action: ManageAction, path: &str) -> ManageFileParams {
        ManageFileParams {
            action,
            path: path.to_string(),
            to: None,
            content: None,
            expected_checksum: None,
            encoding: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn create_writes_content_and_issues_a_token() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(&dir);
        let out = manage_file(
            &ctx,
            ManageFileParams {
                content: Some("one\ntwo\n".to_string()),
                ..base(ManageAction::Create, "sub/new.txt")
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/new.txt")).unwrap(),
            "one\ntwo\n"
        );
        assert_eq!(out.fields["line_count"], "2");
        assert!(!out.fields["token"].is_empty());
        // Undo removes the created file again.
        ctx.journal.undo().unwrap();
        assert!(!dir.path().join("sub/new.txt").exists());
    }

    #[test]
    fn overwrite_without_checksum_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let ctx = context_for(&dir);
        let err = manage_file(
            &ctx,
            ManageFileParams {
                content: Some("new".to_string()),
                ..base(ManageAction::Create, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerErr::Access(AccessError::MustReadFirst(_))));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
    }

    #[test]
    fn overwrite_with_matching_checksum_succeeds() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let ctx = context_for(&dir);
        let crc = digest::crc32c_hex(digest::crc32c_bytes(b"old"));

        manage_file(
            &ctx,
            ManageFileParams {
                content: Some("new".to_string()),
                expected_checksum: Some(crc),
                ..base(ManageAction::Create, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");

        ctx.journal.undo().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
    }

    #[test]
    fn overwrite_with_wrong_checksum_reports_actual() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let ctx = context_for(&dir);
        let err = manage_file(
            &ctx,
            ManageFileParams {
                content: Some("new".to_string()),
                expected_checksum: Some("00000000".to_string()),
                ..base(ManageAction::Create, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BrokerErr::Content(ContentError::ExpectedMismatch { .. })
        ));
    }

    #[test]
    fn move_migrates_the_snapshot_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("m.txt"), "body\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let ctx = context_for(&dir);

        // Simulate a prior read.
        let crc = digest::crc32c_bytes(b"body\n");
        ctx.tracker.update(
            &dir.path().canonicalize().unwrap().join("m.txt"),
            FileSnapshot::new(b"body\n".to_vec(), crc, Charset::Utf8 { bom: false }, 1),
        );

        manage_file(
            &ctx,
            ManageFileParams {
                to: Some("sub".to_string()),
                ..base(ManageAction::Move, "m.txt")
            },
            &Deadline::none(),
        )
        .unwrap();

        let new_path = dir.path().canonicalize().unwrap().join("sub/m.txt");
        assert!(new_path.exists());
        assert!(matches!(ctx.tracker.check(&new_path, crc), CheckOutcome::NoChange));

        // Undo restores the original location.
        ctx.journal.undo().unwrap();
        assert!(dir.path().join("m.txt").exists());
        assert!(!new_path.exists());
    }

    #[test]
    fn rename_requires_a_bare_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let ctx = context_for(&dir);
        let err = manage_file(
            &ctx,
            ManageFileParams {
                to: Some("sub/b.txt".to_string()),
                ..base(ManageAction::Rename, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerErr::InvalidParams { .. }));

        manage_file(
            &ctx,
            ManageFileParams {
                to: Some("b.txt".to_string()),
                ..base(ManageAction::Rename, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap();
        assert!(dir.path().join("b.txt").exists());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn delete_backs_up_and_undo_restores() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("doomed.txt"), "keep me\n").unwrap();
        let ctx = context_for(&dir);

        manage_file(&ctx, base(ManageAction::Delete, "doomed.txt"), &Deadline::none()).unwrap();
        assert!(!dir.path().join("doomed.txt").exists());

        ctx.journal.undo().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("doomed.txt")).unwrap(),
            "keep me\n"
        );
    }

    #[test]
    fn move_onto_an_existing_file_is_refused() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let ctx = context_for(&dir);
        let err = manage_file(
            &ctx,
            ManageFileParams {
                to: Some("b.txt".to_string()),
                ..base(ManageAction::Move, "a.txt")
            },
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerErr::Access(AccessError::MustReadFirst(_))));
    }
}
