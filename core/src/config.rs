use std::io;
use std::path::PathBuf;

/// Environment variable overriding the project roots supplied by the host
/// handshake. Entries are separated by `:` or `;`. In containerised
/// deployments the variable wins over the handshake.
pub const BROKER_ROOTS_ENV_VAR: &str = "BROKER_ROOTS";

/// Files larger than this are refused by read and edit operations.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10 MiB

/// Default cap on matches reported per file by `grep`.
pub const DEFAULT_GREP_MATCH_CAP: usize = 50;

/// Directory names hidden by `list` when auto-ignore is on and never
/// descended into by searches.
pub const AUTO_IGNORE_DIRS: &[&str] = &["build", ".gradle", "node_modules", "target", ".git", ".nts"];

/// Path segments no operation may touch, anywhere in a path.
pub const PROTECTED_SEGMENTS: &[&str] = &[".git", ".nts", "build", "target", "node_modules", ".gradle"];

/// Build and wrapper scripts at a project root that stay read-only.
pub const PROTECTED_ROOT_FILES: &[&str] = &[
    "build.gradle",
    "build.gradle.kts",
    "settings.gradle",
    "settings.gradle.kts",
    "gradlew",
    "gradlew.bat",
];

/// Broker configuration assembled at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical project roots; the first entry is the primary root.
    pub roots: Vec<PathBuf>,

    /// Upper bound on the size of files served or edited.
    pub max_file_size: u64,

    /// 8-bit charset used when a file is neither UTF-8 nor BOM-tagged.
    pub fallback_charset: &'static encoding_rs::Encoding,

    /// Fan-out for the parallel grep walker.
    pub grep_threads: usize,

    /// Matches reported per file before truncation.
    pub grep_match_cap: usize,
}

/// Optional overrides applied on top of the defaults, mirroring how the
/// host passes through per-session settings.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub roots: Option<Vec<PathBuf>>,
    pub max_file_size: Option<u64>,
    pub fallback_charset_label: Option<String>,
    pub grep_threads: Option<usize>,
    pub grep_match_cap: Option<usize>,
}

impl Config {
    /// Build a configuration from overrides plus the environment. Roots are
    /// canonicalised eagerly so that every later containment check compares
    /// canonical paths; a root that does not exist is an error.
    pub fn load_with_overrides(overrides: ConfigOverrides) -> io::Result<Self> {
        let ConfigOverrides {
            roots,
            max_file_size,
            fallback_charset_label,
            grep_threads,
            grep_match_cap,
        } = overrides;

        let raw_roots = match roots_from_env() {
            Some(env_roots) => env_roots,
            None => roots.unwrap_or_default(),
        };
        if raw_roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no project roots configured (pass roots or set BROKER_ROOTS)",
            ));
        }

        let mut canonical_roots = Vec::with_capacity(raw_roots.len());
        for root in raw_roots {
            let canonical = root.canonicalize().map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("project root `{}` is not usable: {e}", root.display()),
                )
            })?;
            if !canonical.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("project root `{}` is not a directory", canonical.display()),
                ));
            }
            canonical_roots.push(canonical);
        }

        let fallback_charset = match fallback_charset_label {
            Some(label) => encoding_rs::Encoding::for_label(label.as_bytes()).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown fallback charset `{label}`"),
                )
            })?,
            None => encoding_rs::WINDOWS_1251,
        };

        Ok(Self {
            roots: canonical_roots,
            max_file_size: max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
            fallback_charset,
            grep_threads: grep_threads.unwrap_or_else(default_grep_threads),
            grep_match_cap: grep_match_cap.unwrap_or(DEFAULT_GREP_MATCH_CAP),
        })
    }

    /// The primary root: backups, `.nts/` collaborator state and relative
    /// fallbacks all hang off this directory.
    pub fn primary_root(&self) -> &PathBuf {
        // Invariant: `roots` is non-empty after load_with_overrides.
        &self.roots[0]
    }
}

fn default_grep_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(2)
}

fn roots_from_env() -> Option<Vec<PathBuf>> {
    let raw = std::env::var(BROKER_ROOTS_ENV_VAR).ok()?;
    let roots: Vec<PathBuf> = raw
        .split([':', ';'])
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect();
    if roots.is_empty() { None } else { Some(roots) }
}
