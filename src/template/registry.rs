use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ops::Deref, sync::Arc};

use super::{builtin, schema::SchemaFactory, TemplateDefinition};
use crate::error::VaultError;

/// Global registry, pre-loaded with the builtin templates. No template is active until
/// [`TemplateRegistry::activate`] is called.
pub static TEMPLATES: Lazy<TemplateRegistry> = Lazy::new(TemplateRegistry::with_builtins);

/// Where a template registration came from. A template id can only be replaced by a source of
/// strictly higher precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    Builtin,
    Config,
    Runtime,
}

/// Immutable view of the active template. Scans hold one for their whole run so a concurrent
/// activation or re-registration only affects later scans.
#[derive(Debug, Clone)]
pub struct TemplateSnapshot {
    pub definition: Arc<TemplateDefinition>,
    pub generation: u64,
}

impl Deref for TemplateSnapshot {
    type Target = TemplateDefinition;

    fn deref(&self) -> &TemplateDefinition {
        &self.definition
    }
}

/// Summary row returned by [`TemplateRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub source: TemplateSource,
    pub active: bool,
}

#[derive(Debug)]
struct Registered {
    definition: Arc<TemplateDefinition>,
    source: TemplateSource,
}

#[derive(Debug, Default)]
struct RegistryState {
    templates: BTreeMap<String, Registered>,
    active: Option<String>,
    generation: u64,
}

/// Thread-safe template store. Clones share state, so a registry handed to a
/// [`Vault`](crate::vault::Vault) observes activations made through any other clone.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    state: Arc<RwLock<RegistryState>>,
    schemas: SchemaFactory,
}

impl TemplateRegistry {
    /// Registry with every builtin template registered under [`TemplateSource::Builtin`].
    pub fn with_builtins() -> Self {
        let registry = TemplateRegistry::default();
        for template in builtin::all() {
            let id = template.id.clone();
            if let Err(e) = registry.register(template, TemplateSource::Builtin) {
                tracing::error!(
                    "[TemplateRegistry::with_builtins] builtin template '{}' rejected: {}",
                    id,
                    e
                );
            }
        }
        registry
    }

    /// Validates `template`, compiles its validators, and stores it.
    ///
    /// Fails with [`VaultError::Configuration`] for a malformed template and with
    /// [`VaultError::Conflict`] when the id is already held by an equal or higher source.
    /// Replacing the active template bumps the snapshot generation.
    pub fn register(
        &self,
        template: TemplateDefinition,
        source: TemplateSource,
    ) -> Result<(), VaultError> {
        template.validate()?;

        let mut writer = self.state.write();
        if let Some(existing) = writer.templates.get(&template.id) {
            if source <= existing.source {
                return Err(VaultError::Conflict(format!(
                    "template '{}' is already registered from {:?}; {:?} cannot replace it",
                    template.id, existing.source, source
                )));
            }
            tracing::info!(
                "[TemplateRegistry::register] replacing template '{}' ({:?} -> {:?})",
                template.id,
                existing.source,
                source
            );
        }

        let definition = Arc::new(template);
        self.schemas.prime(&definition)?;
        let id = definition.id.clone();
        writer
            .templates
            .insert(id.clone(), Registered { definition, source });
        if writer.active.as_deref() == Some(id.as_str()) {
            writer.generation += 1;
        }
        tracing::debug!(
            "[TemplateRegistry::register] registered '{}' from {:?}",
            id,
            source
        );
        Ok(())
    }

    pub fn activate(&self, id: &str) -> Result<TemplateSnapshot, VaultError> {
        let mut writer = self.state.write();
        let definition = writer
            .templates
            .get(id)
            .map(|r| r.definition.clone())
            .ok_or_else(|| VaultError::NotFound(format!("template '{id}' is not registered")))?;
        writer.active = Some(id.to_string());
        writer.generation += 1;
        tracing::info!(
            "[TemplateRegistry::activate] active template is now '{}' (generation {})",
            id,
            writer.generation
        );
        Ok(TemplateSnapshot {
            definition,
            generation: writer.generation,
        })
    }

    pub fn get_active(&self) -> Option<TemplateSnapshot> {
        let reader = self.state.read();
        let id = reader.active.as_ref()?;
        reader.templates.get(id).map(|r| TemplateSnapshot {
            definition: r.definition.clone(),
            generation: reader.generation,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<TemplateDefinition>> {
        self.state
            .read()
            .templates
            .get(id)
            .map(|r| r.definition.clone())
    }

    pub fn list(&self) -> Vec<TemplateInfo> {
        let reader = self.state.read();
        reader
            .templates
            .iter()
            .map(|(id, r)| TemplateInfo {
                id: id.clone(),
                name: r.definition.name.clone(),
                version: r.definition.version.clone(),
                source: r.source,
                active: reader.active.as_ref() == Some(id),
            })
            .collect()
    }

    /// Drops every template and the active selection. Compiled validators are discarded too.
    pub fn clear(&self) {
        let mut writer = self.state.write();
        writer.templates.clear();
        writer.active = None;
        writer.generation += 1;
        self.schemas.clear();
    }

    pub fn schema_factory(&self) -> SchemaFactory {
        self.schemas.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{EntityTypeConfig, FieldConfig, FieldKind};
    use test_log::test;

    #[test]
    fn test_nothing_active_before_activation() {
        let registry = TemplateRegistry::with_builtins();
        assert!(registry.get_active().is_none());
        assert!(registry.get(builtin::WORLDBUILDING_ID).is_some());
        assert!(matches!(
            registry.activate("missing"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_precedence() {
        let registry = TemplateRegistry::with_builtins();
        let again = registry.register(builtin::worldbuilding(), TemplateSource::Builtin);
        assert!(matches!(again, Err(VaultError::Conflict(_))));

        registry
            .register(builtin::worldbuilding(), TemplateSource::Config)
            .unwrap();
        assert!(matches!(
            registry.register(builtin::worldbuilding(), TemplateSource::Config),
            Err(VaultError::Conflict(_))
        ));
        registry
            .register(builtin::worldbuilding(), TemplateSource::Runtime)
            .unwrap();
        let info = registry.list();
        assert_eq!(info[0].source, TemplateSource::Runtime);
    }

    #[test]
    fn test_invalid_template_is_not_stored() {
        let registry = TemplateRegistry::default();
        let mut template = builtin::worldbuilding();
        template.id = "broken".to_string();
        template.entity_types.push(
            EntityTypeConfig::new("vehicle", "Vehicle", "Vehicles")
                .with_field(FieldConfig::new("fuel", FieldKind::Enum)),
        );
        assert!(matches!(
            registry.register(template, TemplateSource::Runtime),
            Err(VaultError::Configuration(_))
        ));
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let registry = TemplateRegistry::with_builtins();
        let before = registry.activate(builtin::WORLDBUILDING_ID).unwrap();

        let mut updated = builtin::worldbuilding();
        updated.version = "1.1.0".to_string();
        registry.register(updated, TemplateSource::Runtime).unwrap();

        let after = registry.get_active().unwrap();
        assert_eq!(before.version, "1.0.0");
        assert_eq!(after.version, "1.1.0");
        assert!(after.generation > before.generation);
    }

    #[test]
    fn test_clear() {
        let registry = TemplateRegistry::with_builtins();
        registry.activate(builtin::WORLDBUILDING_ID).unwrap();
        registry.clear();
        assert!(registry.get_active().is_none());
        assert!(registry.list().is_empty());
        assert!(registry.schema_factory().is_empty());
    }
}
