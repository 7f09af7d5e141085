//! Validation support for records and relation lists
//!
//! Relations register declarative validators on their source and target
//! models at declaration time (unique embedded identifiers, unique
//! reference identifiers, identifier presence when auto-id is disabled,
//! recursive embedded validation). Failures accumulate per field in a
//! `ValidationErrors` map rather than aborting on the first problem.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::Record;
use crate::schema::Schema;
use crate::value::{id_to_string, is_missing};

/// One validation failure message with a stable machine-readable code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub message: String,
    pub code: String,
}

/// Field-to-messages error accumulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    errors: BTreeMap<String, Vec<ValidationMessage>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure against a field.
    pub fn add(&mut self, field: &str, message: &str, code: &str) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(ValidationMessage {
                message: message.to_string(),
                code: code.to_string(),
            });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Fields that have at least one failure.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    pub fn messages_for(&self, field: &str) -> &[ValidationMessage] {
        self.errors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when any failure on the field carries the given code.
    pub fn has_code(&self, field: &str, code: &str) -> bool {
        self.messages_for(field).iter().any(|m| m.code == code)
    }

    /// Merge failures from another accumulator, prefixing fields with the
    /// given relation field name (`emails.id`, for example).
    pub fn absorb_under(&mut self, prefix: &str, other: &ValidationErrors) {
        for (field, messages) in &other.errors {
            let key = format!("{}.{}", prefix, field);
            self.errors.entry(key).or_default().extend(messages.clone());
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.errors {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{} {}", field, message.message)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Declarative validators attached to model definitions
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    /// Field must be present and non-null
    PresenceOf { field: String },
    /// Identifiers of the objects in an embedded list property must be unique
    UniqueEmbeddedIds { property: String, id_field: String },
    /// Identifier values in a reference list property must be unique
    UniqueReferenceIds { property: String },
    /// Every object in an embedded list must itself pass the named model's
    /// validators
    ValidEmbedded { property: String, model: String },
}

impl Validator {
    /// Run the validator against a record, accumulating failures.
    pub fn run(&self, record: &Record, schema: &Schema, errors: &mut ValidationErrors) {
        match self {
            Validator::PresenceOf { field } => {
                if is_missing(record.get(field)) {
                    errors.add(field, "can't be blank", "presence");
                }
            }
            Validator::UniqueEmbeddedIds { property, id_field } => {
                let items = list_items(record, property);
                let ids: Vec<&Value> = items
                    .iter()
                    .filter_map(|item| item.as_object().and_then(|o| o.get(id_field)))
                    .filter(|v| !v.is_null())
                    .collect();
                if has_duplicates(&ids) {
                    errors.add(property, "contains duplicate identifiers", "uniqueness");
                }
            }
            Validator::UniqueReferenceIds { property } => {
                let items = list_items(record, property);
                let ids: Vec<&Value> = items.iter().filter(|v| !v.is_null()).collect();
                if has_duplicates(&ids) {
                    errors.add(property, "contains duplicate identifiers", "uniqueness");
                }
            }
            Validator::ValidEmbedded { property, model } => {
                for item in list_items(record, property) {
                    let Some(fields) = item.as_object() else {
                        errors.add(property, "contains a non-object element", "embedded");
                        continue;
                    };
                    let element = Record::new(model.clone(), fields.clone());
                    let element_errors = schema.collect_errors(&element);
                    if !element_errors.is_empty() {
                        errors.absorb_under(property, &element_errors);
                    }
                }
            }
        }
    }
}

fn list_items(record: &Record, property: &str) -> Vec<Value> {
    match record.get(property) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn has_duplicates(ids: &[&Value]) -> bool {
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            if id_to_string(a) == id_to_string(b) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(model: &str, fields: Value) -> Record {
        Record::new(model.to_string(), fields.as_object().cloned().unwrap())
    }

    #[test]
    fn test_presence_of() {
        let schema = Schema::new();
        let mut errors = ValidationErrors::new();
        let validator = Validator::PresenceOf {
            field: "id".to_string(),
        };

        validator.run(&record("Email", json!({"id": 1})), &schema, &mut errors);
        assert!(errors.is_empty());

        validator.run(&record("Email", json!({"label": "work"})), &schema, &mut errors);
        assert!(errors.has_code("id", "presence"));
    }

    #[test]
    fn test_unique_embedded_ids() {
        let schema = Schema::new();
        let validator = Validator::UniqueEmbeddedIds {
            property: "emails".to_string(),
            id_field: "id".to_string(),
        };

        let mut errors = ValidationErrors::new();
        let ok = record("Person", json!({"emails": [{"id": 1}, {"id": 2}]}));
        validator.run(&ok, &schema, &mut errors);
        assert!(errors.is_empty());

        let dup = record("Person", json!({"emails": [{"id": 1}, {"id": "1"}]}));
        validator.run(&dup, &schema, &mut errors);
        assert!(errors.has_code("emails", "uniqueness"));
    }

    #[test]
    fn test_unique_reference_ids() {
        let schema = Schema::new();
        let validator = Validator::UniqueReferenceIds {
            property: "tag_ids".to_string(),
        };
        let mut errors = ValidationErrors::new();
        validator.run(
            &record("Post", json!({"tag_ids": [1, 2, 1]})),
            &schema,
            &mut errors,
        );
        assert!(errors.has_code("tag_ids", "uniqueness"));
    }

    #[test]
    fn test_errors_display() {
        let mut errors = ValidationErrors::new();
        errors.add("id", "can't be blank", "presence");
        assert_eq!(errors.to_string(), "id can't be blank");
    }
}
