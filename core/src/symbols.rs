//! Contract for the external symbol provider plus the broker-side cache.
//!
//! The heavy lifting (tree-sitter grammars, per-language extraction) lives
//! outside the core behind [`SymbolProvider`]. The broker contributes the
//! data model, extension-based language detection, and a cache keyed by
//! `(path, content CRC32C)` so repeated symbol reads of an unchanged file
//! never re-parse. All positions are 1-based, matching the token model.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Interface,
    Struct,
    Enum,
    Method,
    Function,
    Constructor,
    Property,
    Field,
    Variable,
    Namespace,
    Trait,
    Object,
    Event,
    TypeAlias,
    Import,
}

impl SymbolKind {
    /// Preference order when several symbols share a name: callables beat
    /// members beat locals beat containers.
    pub fn specificity(&self) -> u8 {
        match self {
            SymbolKind::Method | SymbolKind::Function | SymbolKind::Constructor => 3,
            SymbolKind::Field | SymbolKind::Property => 2,
            SymbolKind::Variable => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolLocation {
    pub path: PathBuf,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub varargs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    pub parameters: Vec<ParameterInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    pub location: SymbolLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LanguageId {
    Rust,
    Java,
    Kotlin,
    Python,
    JavaScript,
    TypeScript,
    Go,
    C,
    Cpp,
}

/// Language detection by extension; `None` means the provider has nothing
/// to offer for this file.
pub fn detect_language(path: &Path) -> Option<LanguageId> {
    let ext = path.extension()?.to_str()?;
    match ext {
        "rs" => Some(LanguageId::Rust),
        "java" => Some(LanguageId::Java),
        "kt" | "kts" => Some(LanguageId::Kotlin),
        "py" => Some(LanguageId::Python),
        "js" | "mjs" | "cjs" | "jsx" => Some(LanguageId::JavaScript),
        "ts" | "tsx" => Some(LanguageId::TypeScript),
        "go" => Some(LanguageId::Go),
        "c" | "h" => Some(LanguageId::C),
        "cc" | "cpp" | "cxx" | "hpp" => Some(LanguageId::Cpp),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceScope {
    File,
    Project,
}

/// External parser contract. Implementations must not mutate the
/// filesystem and must report 1-based positions.
pub trait SymbolProvider: Send + Sync {
    fn extract_symbols(
        &self,
        path: &Path,
        content: &str,
        lang: LanguageId,
    ) -> Result<Vec<SymbolInfo>, String>;

    fn find_references(
        &self,
        path: &Path,
        line: u32,
        col: u32,
        scope: ReferenceScope,
        include_declaration: bool,
    ) -> Result<Vec<SymbolLocation>, String>;
}

/// Extraction results cached per path, invalidated when the content CRC
/// moves. Values are shared `Arc`s so readers do not clone symbol lists.
#[derive(Default)]
pub struct SymbolCache {
    entries: Mutex<HashMap<PathBuf, (u32, Arc<Vec<SymbolInfo>>)>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbols_for(
        &self,
        provider: &dyn SymbolProvider,
        path: &Path,
        content: &str,
        content_crc: u32,
        lang: LanguageId,
    ) -> Result<Arc<Vec<SymbolInfo>>, String> {
        if let Some((crc, symbols)) = self.lock().get(path) {
            if *crc == content_crc {
                return Ok(Arc::clone(symbols));
            }
        }
        let mut symbols = provider.extract_symbols(path, content, lang)?;
        symbols.sort_by_key(|s| (s.location.start_line, s.location.start_col));
        let symbols = Arc::new(symbols);
        self.lock()
            .insert(path.to_path_buf(), (content_crc, Arc::clone(&symbols)));
        Ok(symbols)
    }

    pub fn invalidate(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, (u32, Arc<Vec<SymbolInfo>>)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
