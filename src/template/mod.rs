//! Runtime-defined entity and relationship types.
//!
//! A [`TemplateDefinition`] declares which entity types may appear in a vault, which fields each
//! carries, and which relationships link them. Templates are registered with a
//! [`TemplateRegistry`](registry::TemplateRegistry) (globally accessible via [`TEMPLATES`]) and one
//! of them is activated; scans validate documents against an immutable
//! [`TemplateSnapshot`](registry::TemplateSnapshot) of the active template.
//!
//! ```rust
//! use vaultgraph_core::template::{builtin, registry::{TemplateRegistry, TemplateSource}};
//!
//! let registry = TemplateRegistry::default();
//! registry.register(builtin::worldbuilding(), TemplateSource::Builtin).unwrap();
//! registry.activate(builtin::WORLDBUILDING_ID).unwrap();
//! let snapshot = registry.get_active().unwrap();
//! assert!(snapshot.entity_type("character").is_some());
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::{error::VaultError, properties::RELATED};

pub mod builtin;
pub mod registry;
pub mod schema;

pub use registry::{TemplateRegistry, TemplateSnapshot, TemplateSource, TEMPLATES};
pub use schema::{SchemaFactory, Validator};

static ENTITY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*$").unwrap_or_else(|e| panic!("invalid entity name regex: {e}"))
});
static FIELD_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][A-Za-z0-9]*$").unwrap_or_else(|e| panic!("invalid field name regex: {e}"))
});
static SEMVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .unwrap_or_else(|e| panic!("invalid semver regex: {e}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Date,
    Enum,
    Array,
    Record,
}

impl FieldKind {
    /// Kinds allowed as array elements.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldKind::String | FieldKind::Number | FieldKind::Boolean | FieldKind::Date
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_item_kind: Option<FieldKind>,
}

impl FieldConfig {
    pub fn new<S: Into<String>>(name: S, kind: FieldKind) -> Self {
        FieldConfig {
            name: name.into(),
            kind,
            required: false,
            default: None,
            enum_values: None,
            array_item_kind: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_item_kind(mut self, kind: FieldKind) -> Self {
        self.array_item_kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeConfig {
    pub name: String,
    pub display_name: String,
    pub plural_name: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

impl EntityTypeConfig {
    pub fn new<N: Into<String>, D: Into<String>, P: Into<String>>(
        name: N,
        display_name: D,
        plural_name: P,
    ) -> Self {
        EntityTypeConfig {
            name: name.into(),
            display_name: display_name.into(),
            plural_name: plural_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldConfig) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipTypeConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_id: Option<String>,
    #[serde(default)]
    pub bidirectional: bool,
}

impl RelationshipTypeConfig {
    pub fn directed<S: Into<String>>(id: S) -> Self {
        RelationshipTypeConfig {
            id: id.into(),
            reverse_id: None,
            bidirectional: false,
        }
    }

    pub fn bidirectional<S: Into<String>, R: Into<String>>(id: S, reverse_id: R) -> Self {
        RelationshipTypeConfig {
            id: id.into(),
            reverse_id: Some(reverse_id.into()),
            bidirectional: true,
        }
    }
}

/// Relationship used for untyped cross-references from `source_type` to `target_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDefault {
    pub source_type: String,
    pub target_type: String,
    pub relationship: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub entity_types: Vec<EntityTypeConfig>,
    pub relationship_types: Vec<RelationshipTypeConfig>,
    #[serde(default)]
    pub relationship_defaults: Vec<RelationshipDefault>,
}

impl TemplateDefinition {
    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeConfig> {
        self.entity_types.iter().find(|et| et.name == name)
    }

    pub fn has_entity_type(&self, name: &str) -> bool {
        self.entity_type(name).is_some()
    }

    pub fn entity_type_names(&self) -> Vec<String> {
        self.entity_types.iter().map(|et| et.name.clone()).collect()
    }

    pub fn relationship(&self, id: &str) -> Option<&RelationshipTypeConfig> {
        self.relationship_types.iter().find(|rt| rt.id == id)
    }

    /// Declared default for untyped references between the two types, if any.
    pub fn default_relationship(&self, source_type: &str, target_type: &str) -> Option<&str> {
        self.relationship_defaults
            .iter()
            .find(|d| d.source_type == source_type && d.target_type == target_type)
            .map(|d| d.relationship.as_str())
    }

    /// Digest of everything edge derivation reads: the template id, the entity type names, the
    /// relationship types and the defaults. Two definitions with the same fingerprint derive the
    /// same edges from the same references.
    pub fn edge_fingerprint(&self) -> Result<String, VaultError> {
        let rules = serde_json::to_vec(&(
            &self.id,
            self.entity_type_names(),
            &self.relationship_types,
            &self.relationship_defaults,
        ))?;
        Ok(hex::encode(Sha256::digest(&rules)))
    }

    /// Checks every structural rule of a template. All violations are collected into one
    /// configuration error so a broken config is fixed in one pass.
    pub fn validate(&self) -> Result<(), VaultError> {
        let mut problems = Vec::<String>::new();

        if self.id.trim().is_empty() {
            problems.push("template id must not be empty".to_string());
        }
        if !SEMVER.is_match(&self.version) {
            problems.push(format!(
                "version '{}' is not a semantic version (MAJOR.MINOR.PATCH)",
                self.version
            ));
        }

        let mut entity_names = BTreeSet::new();
        for entity_type in self.entity_types.iter() {
            if !ENTITY_NAME.is_match(&entity_type.name) {
                problems.push(format!(
                    "entity type name '{}' must be a lowercase token",
                    entity_type.name
                ));
            }
            if !entity_names.insert(entity_type.name.as_str()) {
                problems.push(format!("duplicate entity type '{}'", entity_type.name));
            }
            let mut field_names = BTreeSet::new();
            for field in entity_type.fields.iter() {
                if !FIELD_NAME.is_match(&field.name) {
                    problems.push(format!(
                        "{}.{}: field names must be camelCase",
                        entity_type.name, field.name
                    ));
                }
                if !field_names.insert(field.name.as_str()) {
                    problems.push(format!(
                        "{}.{}: duplicate field",
                        entity_type.name, field.name
                    ));
                }
                // Constraint compilation reports enum/array/default problems.
                if let Err(VaultError::Configuration(msg)) =
                    schema::FieldConstraint::compile(field)
                {
                    problems.push(format!("{}.{}", entity_type.name, msg));
                }
            }
        }

        let relationships: BTreeMap<&str, &RelationshipTypeConfig> = self
            .relationship_types
            .iter()
            .map(|rt| (rt.id.as_str(), rt))
            .collect();
        if relationships.len() != self.relationship_types.len() {
            problems.push("duplicate relationship type ids".to_string());
        }
        if !relationships.contains_key(RELATED) {
            problems.push(format!(
                "template must declare the fallback relationship '{RELATED}'"
            ));
        }
        problems.extend(relationship_symmetry_problems(&relationships));

        for default in self.relationship_defaults.iter() {
            for ty in [&default.source_type, &default.target_type] {
                if !entity_names.contains(ty.as_str()) {
                    problems.push(format!(
                        "relationship default references undeclared entity type '{ty}'"
                    ));
                }
            }
            if !relationships.contains_key(default.relationship.as_str()) {
                problems.push(format!(
                    "relationship default ({}, {}) references undeclared relationship '{}'",
                    default.source_type, default.target_type, default.relationship
                ));
            }
        }
        let mut default_pairs = BTreeSet::new();
        for default in self.relationship_defaults.iter() {
            if !default_pairs.insert((&default.source_type, &default.target_type)) {
                problems.push(format!(
                    "duplicate relationship default for ({}, {})",
                    default.source_type, default.target_type
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(VaultError::Configuration(format!(
                "template '{}': {}",
                self.id,
                problems.join("; ")
            )))
        }
    }
}

/// Bidirectional relationships must name a declared reverse whose own reverse points back.
fn relationship_symmetry_problems(
    relationships: &BTreeMap<&str, &RelationshipTypeConfig>,
) -> Vec<String> {
    let mut problems = Vec::new();
    for (id, rt) in relationships.iter() {
        let Some(reverse_id) = rt.reverse_id.as_deref() else {
            if rt.bidirectional {
                problems.push(format!(
                    "bidirectional relationship '{id}' must declare a reverseId"
                ));
            }
            continue;
        };
        match relationships.get(reverse_id) {
            None => problems.push(format!(
                "relationship '{id}' names undeclared reverse '{reverse_id}'"
            )),
            Some(reverse) => {
                if rt.bidirectional && reverse.reverse_id.as_deref() != Some(*id) {
                    problems.push(format!(
                        "bidirectional relationship '{id}' is not symmetric: '{reverse_id}' \
                         reverses to {:?}",
                        reverse.reverse_id
                    ));
                }
                if rt.bidirectional != reverse.bidirectional {
                    problems.push(format!(
                        "relationships '{id}' and '{reverse_id}' disagree on bidirectionality"
                    ));
                }
            }
        }
    }
    problems
}
