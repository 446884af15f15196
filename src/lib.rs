//! # vaultgraph-core
//!
//! A template-driven document indexer and knowledge-graph engine for folders of Markdown notes.
//!
//! ## Overview
//!
//! A *vault* is a directory of documents. Each document describes one entity (a character, a
//! location, a faction...) whose shape is declared by the active **template**: entity types with
//! typed fields, relationship types (directed, or bidirectional with a reverse id), and default
//! relationships per pair of entity types. vaultgraph-core turns a vault into:
//!
//! - **Nodes**: validated, normalized records of every typed document
//! - **Edges**: typed relationships derived from the links between documents, mirrored when the
//!   relationship is bidirectional
//! - **A full-text index**: bm25-ranked search over titles and bodies
//!
//! all persisted in one SQLite database and kept current by incremental scans.
//!
//! ## Architecture
//!
//! - **[`template`]**: template definitions, the [`TemplateRegistry`](template::TemplateRegistry)
//!   with snapshot semantics, and the validator cache ([`SchemaFactory`](template::SchemaFactory))
//! - **[`folders`]**: folder conventions that type documents without an explicit `type`
//! - **[`codec`]**: the [`DocumentParser`](codec::DocumentParser) seam and the YAML frontmatter
//!   parser
//! - **[`indexer`]**: the single writer: scans, per-document transactions, [`ScanReport`](indexer::ScanReport)
//! - **[`graph`]**: edge derivation, incremental reconciliation, consistency checks
//! - **[`db`]**: schema, migrations and storage primitives
//! - **[`query`]**: full-text search and bounded neighbor traversal
//! - **[`vault`]**: the façade tying it together, plus [`commands`] for transports
//! - **[`watch`]**: file watching (requires the `service` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vaultgraph_core::{
//!     db::db_init,
//!     codec::ParserMap,
//!     config::IndexOptions,
//!     folders::{FolderMapping, FolderMappingConfig},
//!     query::SearchFilters,
//!     template::{builtin::WORLDBUILDING_ID, TEMPLATES},
//!     vault::Vault,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     TEMPLATES.activate(WORLDBUILDING_ID)?;
//!     let folders = FolderMappingConfig {
//!         mappings: vec![
//!             FolderMapping::new("characters/**", ["character"]),
//!             FolderMapping::new("places/**", ["location"]),
//!         ],
//!         fallback_type: Some("lore".to_string()),
//!     };
//!     let vault = Vault::open(
//!         "./world",
//!         db_init("./world/.vaultgraph.db").await?,
//!         TEMPLATES.clone(),
//!         &folders,
//!         ParserMap::create(),
//!         IndexOptions::default(),
//!         None,
//!     )?;
//!
//!     let report = vault.scan().await?;
//!     for invalid in report.invalid.iter() {
//!         println!("{}: {}", invalid.path, invalid.failure);
//!     }
//!
//!     let results = vault.search("harbor", &SearchFilters::default()).await?;
//!     for hit in results.hits {
//!         println!("{} ({})", hit.node.title, hit.node.entity_type);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Documents
//!
//! ```markdown
//! ---
//! type: character
//! name: Aria Stormborn
//! status: canon
//! relations:
//!   member_of: [storm-wardens]
//! ---
//! Aria keeps watch over [[Harbor Town]].
//! ```
//!
//! The frontmatter keys `id`, `type`, `status` and `relations` are reserved; everything else is
//! validated against the entity type's fields. The node id is the slug of `id`, or of the file
//! stem when `id` is absent. Wiki links (`[[Target]]`, `[[Target|label]]`) become untyped
//! references resolved through the template's default relationship for the type pair.
//!
//! ## Features
//!
//! - **default** (`service`): the [`watch`] module (`notify`, `notify-debouncer-full`)

pub mod codec;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod folders;
pub mod graph;
pub mod indexer;
pub mod properties;
pub mod query;
pub mod template;
pub mod vault;
#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
