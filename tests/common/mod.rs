//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::{
    path::Path,
    sync::{mpsc::Sender, Arc},
};
use tempfile::TempDir;
use vaultgraph_core::{
    codec::ParserMap,
    config::IndexOptions,
    db::{db_init, VAULT_DB},
    event::VaultEvent,
    folders::{FolderMapping, FolderMappingConfig},
    template::{builtin, TemplateRegistry, TemplateSource},
    vault::Vault,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A registry of its own (not the global one) with the worldbuilding template active.
#[allow(dead_code)]
pub fn worldbuilding_registry() -> TemplateRegistry {
    let registry = TemplateRegistry::default();
    registry
        .register(builtin::worldbuilding(), TemplateSource::Builtin)
        .unwrap();
    registry.activate(builtin::WORLDBUILDING_ID).unwrap();
    registry
}

/// `characters/**` and `places/**` conventions of the worldbuilding fixtures.
#[allow(dead_code)]
pub fn worldbuilding_folders() -> FolderMappingConfig {
    FolderMappingConfig {
        mappings: vec![
            FolderMapping::new("characters/**", ["character"]),
            FolderMapping::new("places/**", ["location"]),
            FolderMapping::new("factions/**", ["faction"]),
        ],
        fallback_type: None,
    }
}

#[allow(dead_code)]
pub async fn open_vault(
    temp_dir: &TempDir,
    registry: TemplateRegistry,
    folders: &FolderMappingConfig,
    events: Option<Sender<VaultEvent>>,
) -> Arc<Vault> {
    let db = db_init(temp_dir.path().join(VAULT_DB)).await.unwrap();
    Arc::new(
        Vault::open(
            temp_dir.path(),
            db,
            registry,
            folders,
            ParserMap::create(),
            IndexOptions::default(),
            events,
        )
        .unwrap(),
    )
}

/// Vault over `temp_dir` with the worldbuilding template and folder conventions.
#[allow(dead_code)]
pub async fn worldbuilding_vault(temp_dir: &TempDir) -> Arc<Vault> {
    open_vault(
        temp_dir,
        worldbuilding_registry(),
        &worldbuilding_folders(),
        None,
    )
    .await
}

/// Writes `content` at the vault-relative `rel`, creating parent directories.
#[allow(dead_code)]
pub fn write_doc(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Sorted `source -[rel]-> target` renderings of every stored edge.
#[allow(dead_code)]
pub async fn edge_strings(vault: &Vault) -> Vec<String> {
    let export = vault.export_graph().await.unwrap();
    let mut edges: Vec<String> = export.edges.iter().map(|e| e.to_string()).collect();
    edges.sort();
    edges
}
