//! The long-lived components of one broker instance, threaded explicitly
//! into every operation instead of living as globals. Tests build a fresh
//! context per case.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::digest;
use crate::encoding;
use crate::journal::TransactionJournal;
use crate::lines::LineBuffer;
use crate::ops::FileLockSet;
use crate::ops::search::MatchCountTracker;
use crate::sandbox::PathSandbox;
use crate::symbols::SymbolCache;
use crate::symbols::SymbolProvider;
use crate::token::TokenCodec;
use crate::tracker::ExternalChangeTracker;
use crate::tracker::FileSnapshot;

pub struct SymbolRegistry {
    pub provider: Option<Arc<dyn SymbolProvider>>,
    pub cache: SymbolCache,
}

pub struct BrokerContext {
    pub config: Config,
    pub sandbox: PathSandbox,
    pub tracker: ExternalChangeTracker,
    pub journal: TransactionJournal,
    pub tokens: TokenCodec,
    pub match_counts: MatchCountTracker,
    pub locks: FileLockSet,
    pub symbols: SymbolRegistry,
}

impl BrokerContext {
    pub fn new(config: Config) -> Self {
        let sandbox = PathSandbox::new(&config);
        Self {
            config,
            sandbox,
            tracker: ExternalChangeTracker::new(),
            journal: TransactionJournal::new(),
            tokens: TokenCodec::new(),
            match_counts: MatchCountTracker::new(),
            locks: FileLockSet::new(),
            symbols: SymbolRegistry {
                provider: None,
                cache: SymbolCache::new(),
            },
        }
    }

    pub fn with_symbol_provider(mut self, provider: Arc<dyn SymbolProvider>) -> Self {
        self.symbols.provider = Some(provider);
        self
    }

    /// Re-sync tracker snapshots after the journal rewrote files (undo,
    /// redo, checkpoint rollback) so the next read does not misreport the
    /// journal's own restore as an external change.
    pub fn refresh_snapshots(&self, paths: &[PathBuf]) {
        for path in paths {
            self.refresh_snapshot(path);
        }
    }

    fn refresh_snapshot(&self, path: &Path) {
        match std::fs::read(path) {
            Ok(bytes) => {
                let crc = digest::crc32c_bytes(&bytes);
                let decoded = encoding::decode(&bytes, None, self.config.fallback_charset);
                let line_count = LineBuffer::parse(&decoded.content).line_count();
                self.tracker.update(
                    path,
                    FileSnapshot::new(bytes, crc, decoded.charset, line_count),
                );
                self.symbols.cache.invalidate(path);
            }
            Err(_) => {
                self.tracker.forget(path);
                self.symbols.cache.invalidate(path);
            }
        }
    }
}
