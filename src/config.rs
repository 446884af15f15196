//! Configuration records and the provider that loads them.
//!
//! A vault's configuration lives in one TOML document:
//!
//! ```toml
//! dbPath = ".vaultgraph.db"
//!
//! [template]
//! activeTemplate = "worldbuilding"
//!
//! [folders]
//! fallbackType = "lore"
//!
//! [[folders.mappings]]
//! pattern = "characters/**"
//! types = ["character"]
//!
//! [index]
//! maxDocumentBytes = 8388608
//!
//! [watch]
//! debounceMs = 500
//! ```
//!
//! Templates beyond the builtin ones go under `[[template.templates]]` using the same camelCase
//! keys as the JSON template format.

use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

use crate::{
    error::VaultError,
    folders::FolderMappingConfig,
    template::{TemplateDefinition, TemplateRegistry, TemplateSnapshot, TemplateSource},
};

pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_template: Option<String>,
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    /// Documents larger than this are recorded invalid without being read
    pub max_document_bytes: u64,
    /// Follow symlinks while walking the vault
    pub follow_links: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            follow_links: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Debounce window of the file system watcher
    pub debounce_ms: u64,
    /// Quiet period the change batcher waits for before flushing
    pub flush_interval_ms: u64,
    /// Distinct pending paths kept before degrading to a full rescan
    pub batch_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            debounce_ms: 500,
            flush_interval_ms: 250,
            batch_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub folders: FolderMappingConfig,
    #[serde(default)]
    pub index: IndexOptions,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Database location; relative paths are resolved against the vault root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

pub trait VaultConfigProvider: Send + Sync {
    fn load(&self) -> Result<VaultConfig, VaultError>;
    fn store(&self, config: &VaultConfig) -> Result<(), VaultError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        TomlConfigProvider {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VaultConfigProvider for TomlConfigProvider {
    fn load(&self) -> Result<VaultConfig, VaultError> {
        tracing::debug!("Attempting to read vault config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(VaultConfig::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    fn store(&self, config: &VaultConfig) -> Result<(), VaultError> {
        tracing::debug!("Attempting to write vault config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

/// Registers the configured templates under [`TemplateSource::Config`] and activates the
/// configured one. Re-applying an unchanged configuration is a no-op.
pub fn apply_template_config(
    registry: &TemplateRegistry,
    config: &TemplateConfig,
) -> Result<Option<TemplateSnapshot>, VaultError> {
    for template in config.templates.iter() {
        if registry
            .get(&template.id)
            .is_some_and(|existing| *existing == *template)
        {
            tracing::debug!(
                "[apply_template_config] template '{}' already registered unchanged",
                template.id
            );
            continue;
        }
        registry.register(template.clone(), TemplateSource::Config)?;
    }
    if let Some(active) = config.active_template.as_deref() {
        let already_active = registry
            .get_active()
            .is_some_and(|snapshot| snapshot.id == active);
        if !already_active {
            registry.activate(active)?;
        }
    }
    Ok(registry.get_active())
}
