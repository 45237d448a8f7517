//! The single choke-point through which every user-supplied path passes.
//!
//! All other components consume only [`SafePath`]: an absolute, normalised
//! path proven to live under one of the configured project roots and to
//! avoid the protected set.

use std::collections::HashSet;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::config::Config;
use crate::config::PROTECTED_ROOT_FILES;
use crate::config::PROTECTED_SEGMENTS;
use crate::error::PathError;

/// An absolute canonical path inside a project root. Once constructed, all
/// operations may assume the path is safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafePath {
    abs: PathBuf,
    root: PathBuf,
}

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.abs
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.abs.clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to its root, used for display in response headers.
    pub fn display_name(&self) -> String {
        self.abs
            .strip_prefix(&self.root)
            .unwrap_or(&self.abs)
            .display()
            .to_string()
    }
}

#[derive(Debug)]
pub struct PathSandbox {
    roots: Vec<PathBuf>,
    protected_segments: HashSet<&'static str>,
    protected_root_files: HashSet<&'static str>,
    max_file_size: u64,
}

impl PathSandbox {
    pub fn new(config: &Config) -> Self {
        Self {
            roots: config.roots.clone(),
            protected_segments: PROTECTED_SEGMENTS.iter().copied().collect(),
            protected_root_files: PROTECTED_ROOT_FILES.iter().copied().collect(),
            max_file_size: config.max_file_size,
        }
    }

    /// Resolve `user_path` to a [`SafePath`].
    ///
    /// Relative inputs are resolved against the first root in which the path
    /// exists, falling back to the primary root. The normalised result must
    /// stay a descendant of some root, and no component of it may be in the
    /// protected set.
    pub fn sanitize(&self, user_path: &str, must_exist: bool) -> Result<SafePath, PathError> {
        let input = Path::new(user_path);
        let candidate = if input.is_absolute() {
            normalize(input)
        } else {
            self.resolve_relative(input)
        };

        // Resolve symlinks for existing paths so containment is checked on
        // canonical paths; paths that are yet to be created are compared
        // lexically (the roots themselves are canonical).
        let candidate = match candidate.canonicalize() {
            Ok(canonical) => canonical,
            Err(_) => candidate,
        };

        let root = self
            .roots
            .iter()
            .find(|root| candidate.starts_with(root))
            .cloned()
            .ok_or_else(|| PathError::OutsideRoot(PathBuf::from(user_path)))?;

        let rel = candidate
            .strip_prefix(&root)
            .map_err(|_| PathError::OutsideRoot(PathBuf::from(user_path)))?
            .to_path_buf();
        self.check_protected(&rel, user_path)?;

        if must_exist && !candidate.exists() {
            return Err(PathError::NotFound(PathBuf::from(user_path)));
        }

        Ok(SafePath {
            abs: candidate,
            root,
        })
    }

    /// Reject files above the configured size bound.
    pub fn check_file_size(&self, path: &SafePath) -> Result<(), PathError> {
        let Ok(metadata) = std::fs::metadata(path.as_path()) else {
            return Ok(());
        };
        if metadata.len() > self.max_file_size {
            return Err(PathError::TooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    pub fn is_directory(&self, path: &SafePath) -> bool {
        path.as_path().is_dir()
    }

    pub fn exists(&self, path: &SafePath) -> bool {
        path.as_path().exists()
    }

    /// True when `name` is a directory name searches should never enter.
    pub fn is_protected_segment(&self, name: &str) -> bool {
        self.protected_segments.contains(name)
    }

    fn resolve_relative(&self, input: &Path) -> PathBuf {
        for root in &self.roots {
            let candidate = normalize(&root.join(input));
            if candidate.exists() {
                return candidate;
            }
        }
        normalize(&self.roots[0].join(input))
    }

    fn check_protected(&self, rel: &Path, user_path: &str) -> Result<(), PathError> {
        let components: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        for segment in &components {
            if self.protected_segments.contains(segment) {
                return Err(PathError::Protected(PathBuf::from(user_path)));
            }
        }
        // Build and wrapper scripts directly at the root stay read-only.
        if components.len() == 1 && self.protected_root_files.contains(components[0]) {
            return Err(PathError::Protected(PathBuf::from(user_path)));
        }
        Ok(())
    }
}

/// Remove `.` and resolve `..` lexically, without touching the filesystem.
/// Works for paths that do not exist yet; `..` that would climb above the
/// filesystem root is dropped, so escapes are caught by the containment
/// check afterwards.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
