//! Document parsing contract.
//!
//! The indexer never looks inside a document itself. It hands the raw bytes to the
//! [`DocumentParser`] registered for the file extension and works with the resulting
//! [`ParsedDocument`]: frontmatter fields, a body, and cross-references already resolved to
//! target ids.
//!
//! ## Built-in Parsers
//!
//! - **Markdown** (`.md`) - via [`frontmatter::FrontmatterParser`]: YAML frontmatter between
//!   `---` fences plus `[[wiki links]]` in the body.
//!
//! Register custom parsers via [`ParserMap::insert`]:
//!
//! ```rust
//! use std::sync::Arc;
//! use vaultgraph_core::{
//!     codec::{DocumentParser, ParsedDocument, ParserMap},
//!     error::VaultError,
//! };
//!
//! struct PlainText;
//!
//! impl DocumentParser for PlainText {
//!     fn parse(&self, _path: &str, content: &[u8]) -> Result<ParsedDocument, VaultError> {
//!         Ok(ParsedDocument {
//!             frontmatter: None,
//!             body: String::from_utf8_lossy(content).into_owned(),
//!             cross_references: Vec::new(),
//!         })
//!     }
//! }
//!
//! let parsers = ParserMap::create();
//! parsers.insert("txt", Arc::new(PlainText));
//! assert!(parsers.extensions().contains(&"txt".to_string()));
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{path::Path, sync::Arc};

use crate::error::VaultError;

pub mod frontmatter;

pub use frontmatter::{slugify, FrontmatterParser};

/// A link found in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    /// Link target as written by the author
    pub display_target: String,
    /// Node id the target resolves to; `None` when it cannot name a node
    pub resolved_id: Option<String>,
    /// Explicitly requested relationship, `None` for plain links
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// `None` when the document carries no frontmatter block at all
    pub frontmatter: Option<Map<String, Value>>,
    pub body: String,
    pub cross_references: Vec<CrossReference>,
}

pub trait DocumentParser: Send + Sync {
    /// `path` is vault-relative. Malformed input is an `Err`; the indexer records it against the
    /// document and moves on.
    fn parse(&self, path: &str, content: &[u8]) -> Result<ParsedDocument, VaultError>;
}

/// Extension-keyed parser registry. Clones share state.
#[derive(Clone)]
pub struct ParserMap(Arc<RwLock<Vec<(String, Arc<dyn DocumentParser>)>>>);

impl std::fmt::Debug for ParserMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ParserMap").field(&self.extensions()).finish()
    }
}

impl Default for ParserMap {
    fn default() -> Self {
        ParserMap::create()
    }
}

impl ParserMap {
    pub fn create() -> Self {
        ParserMap(Arc::new(RwLock::new(vec![(
            "md".to_string(),
            Arc::new(FrontmatterParser) as Arc<dyn DocumentParser>,
        )])))
    }

    /// Registers `parser` for `extension` (without the leading dot), replacing any previous one.
    pub fn insert<S: AsRef<str>>(&self, extension: S, parser: Arc<dyn DocumentParser>) {
        let extension = extension.as_ref().trim_start_matches('.').to_lowercase();
        let mut writer = self.0.write();
        if let Some(entry) = writer.iter_mut().find(|(ext, _)| *ext == extension) {
            tracing::info!("[ParserMap::insert] replacing parser for .{}", extension);
            entry.1 = parser;
        } else {
            writer.push((extension, parser));
        }
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn DocumentParser>> {
        let ext = ext.to_lowercase();
        self.0
            .read()
            .iter()
            .find(|(codec_ext, _)| *codec_ext == ext)
            .map(|(_, parser)| parser.clone())
    }

    pub fn for_path<P: AsRef<Path>>(&self, path: P) -> Option<Arc<dyn DocumentParser>> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.get(ext))
    }

    pub fn supports<P: AsRef<Path>>(&self, path: P) -> bool {
        self.for_path(path).is_some()
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0.read().iter().map(|(ext, _)| ext.clone()).collect()
    }
}
