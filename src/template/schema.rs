//! Compiles [`EntityTypeConfig`]s into [`Validator`]s and caches them per (template, type).
//!
//! A validator is plain data: one [`FieldConstraint`] per declared field, each holding a
//! [`ValueCheck`] tag. Nothing is generated as code, so a template loaded at runtime gets exactly
//! the same treatment as a builtin one.

use chrono::{DateTime, NaiveDate};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use super::{EntityTypeConfig, FieldConfig, FieldKind, TemplateDefinition, TemplateSnapshot};
use crate::error::{FieldError, VaultError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueCheck {
    String,
    Number,
    Boolean,
    /// `YYYY-MM-DD` or an RFC 3339 timestamp
    Date,
    Enum(BTreeSet<String>),
    Array(Box<ValueCheck>),
    /// Any JSON object
    Record,
}

impl ValueCheck {
    fn describe(&self) -> String {
        match self {
            ValueCheck::String => "a string".to_string(),
            ValueCheck::Number => "a number".to_string(),
            ValueCheck::Boolean => "a boolean".to_string(),
            ValueCheck::Date => "a date (YYYY-MM-DD or RFC 3339)".to_string(),
            ValueCheck::Enum(values) => format!(
                "one of [{}]",
                values.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            ValueCheck::Array(item) => format!("an array of {}", item.describe()),
            ValueCheck::Record => "a record (key/value map)".to_string(),
        }
    }

    /// Pushes one [`FieldError`] per offending value; array elements are reported individually.
    pub fn check(&self, path: &str, value: &Value, errors: &mut Vec<FieldError>) {
        let ok = match (self, value) {
            (ValueCheck::String, Value::String(_)) => true,
            (ValueCheck::Number, Value::Number(_)) => true,
            (ValueCheck::Boolean, Value::Bool(_)) => true,
            (ValueCheck::Date, Value::String(s)) => is_date(s),
            (ValueCheck::Enum(values), Value::String(s)) => values.contains(s),
            (ValueCheck::Record, Value::Object(_)) => true,
            (ValueCheck::Array(item), Value::Array(elements)) => {
                for (idx, element) in elements.iter().enumerate() {
                    item.check(&format!("{path}[{idx}]"), element, errors);
                }
                true
            }
            _ => false,
        };
        if !ok {
            errors.push(FieldError::new(
                path,
                format!("expected {}, found {}", self.describe(), value_kind(value)),
            ));
        }
    }
}

fn is_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}

fn value_kind(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "a record".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldConstraint {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
    pub check: ValueCheck,
}

impl FieldConstraint {
    /// Configuration errors are prefixed with the field name.
    pub fn compile(field: &FieldConfig) -> Result<FieldConstraint, VaultError> {
        let fail = |reason: String| VaultError::Configuration(format!("{}: {reason}", field.name));

        if field.kind != FieldKind::Enum && field.enum_values.is_some() {
            return Err(fail("enumValues is only allowed on enum fields".to_string()));
        }
        if field.kind != FieldKind::Array && field.array_item_kind.is_some() {
            return Err(fail("arrayItemKind is only allowed on array fields".to_string()));
        }

        let check = match field.kind {
            FieldKind::String => ValueCheck::String,
            FieldKind::Number => ValueCheck::Number,
            FieldKind::Boolean => ValueCheck::Boolean,
            FieldKind::Date => ValueCheck::Date,
            FieldKind::Record => ValueCheck::Record,
            FieldKind::Enum => {
                let values = field
                    .enum_values
                    .as_ref()
                    .map(|values| values.iter().cloned().collect::<BTreeSet<String>>())
                    .unwrap_or_default();
                if values.is_empty() {
                    return Err(fail("enum fields need a non-empty enumValues list".to_string()));
                }
                ValueCheck::Enum(values)
            }
            FieldKind::Array => {
                let item_kind = field.array_item_kind.unwrap_or(FieldKind::String);
                if !item_kind.is_scalar() {
                    return Err(fail(format!(
                        "arrayItemKind must be string, number, boolean or date, got {item_kind:?}"
                    )));
                }
                let item = match item_kind {
                    FieldKind::Number => ValueCheck::Number,
                    FieldKind::Boolean => ValueCheck::Boolean,
                    FieldKind::Date => ValueCheck::Date,
                    _ => ValueCheck::String,
                };
                ValueCheck::Array(Box::new(item))
            }
        };

        if let Some(default) = field.default.as_ref() {
            let mut errors = Vec::new();
            check.check(&field.name, default, &mut errors);
            if let Some(err) = errors.first() {
                return Err(fail(format!("default does not satisfy the field: {}", err.reason)));
            }
        }

        Ok(FieldConstraint {
            name: field.name.clone(),
            required: field.required,
            default: field.default.clone(),
            check,
        })
    }
}

/// Runtime validator for one entity type of one template definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Validator {
    pub template_id: String,
    pub entity_type: String,
    pub fields: Vec<FieldConstraint>,
}

impl Validator {
    pub fn compile(
        template_id: &str,
        entity_type: &EntityTypeConfig,
    ) -> Result<Validator, VaultError> {
        let fields = entity_type
            .fields
            .iter()
            .map(FieldConstraint::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                VaultError::Configuration(msg) => VaultError::Configuration(format!(
                    "template '{template_id}', type '{}': {msg}",
                    entity_type.name
                )),
                other => other,
            })?;
        Ok(Validator {
            template_id: template_id.to_string(),
            entity_type: entity_type.name.clone(),
            fields,
        })
    }

    /// Returns the normalized field object: declared fields checked, defaults substituted for
    /// absent or null optional fields, unknown fields carried through untouched. On failure every
    /// offending field is reported.
    pub fn validate(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, Vec<FieldError>> {
        let mut output = input.clone();
        let mut errors = Vec::new();

        for constraint in self.fields.iter() {
            match input.get(&constraint.name) {
                None | Some(Value::Null) => {
                    if constraint.required {
                        errors.push(FieldError::new(&constraint.name, "required field is missing"));
                    } else if let Some(default) = constraint.default.as_ref() {
                        output.insert(constraint.name.clone(), default.clone());
                    } else {
                        output.remove(&constraint.name);
                    }
                }
                Some(value) => constraint.check.check(&constraint.name, value, &mut errors),
            }
        }

        if errors.is_empty() {
            Ok(output)
        } else {
            Err(errors)
        }
    }
}

type CacheKey = (String, String);

/// Caches compiled validators per (template id, type name). An entry remembers the definition it
/// was compiled from and is only served to snapshots of that same definition.
#[derive(Debug, Clone, Default)]
pub struct SchemaFactory(Arc<RwLock<HashMap<CacheKey, (Arc<TemplateDefinition>, Arc<Validator>)>>>);

impl SchemaFactory {
    pub fn get_validator(
        &self,
        snapshot: &TemplateSnapshot,
        entity_type: &str,
    ) -> Result<Arc<Validator>, VaultError> {
        let key = (snapshot.id.clone(), entity_type.to_string());
        if let Some((definition, validator)) = self.0.read().get(&key) {
            if Arc::ptr_eq(definition, &snapshot.definition) {
                return Ok(validator.clone());
            }
        }

        let config = snapshot.entity_type(entity_type).ok_or_else(|| {
            VaultError::NotFound(format!(
                "entity type '{entity_type}' is not declared by template '{}'",
                snapshot.id
            ))
        })?;
        let validator = Arc::new(Validator::compile(&snapshot.id, config)?);
        tracing::debug!(
            "[SchemaFactory::get_validator] compiled validator for {}/{} (generation {})",
            snapshot.id,
            entity_type,
            snapshot.generation
        );
        self.0
            .write()
            .insert(key, (snapshot.definition.clone(), validator.clone()));
        Ok(validator)
    }

    /// Compiles every entity type of `definition` and stores the results, replacing whatever was
    /// cached for the template id.
    pub fn prime(&self, definition: &Arc<TemplateDefinition>) -> Result<(), VaultError> {
        let compiled = definition
            .entity_types
            .iter()
            .map(|et| Validator::compile(&definition.id, et).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let mut writer = self.0.write();
        writer.retain(|(template_id, _), _| template_id != &definition.id);
        for validator in compiled {
            writer.insert(
                (definition.id.clone(), validator.entity_type.clone()),
                (definition.clone(), validator),
            );
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.0.write().clear();
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
