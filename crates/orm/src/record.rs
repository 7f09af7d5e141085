//! Dynamic record instances and the per-instance relation cache
//!
//! A `Record` is one instance of a schema-declared model: a dynamic field
//! map, a per-relation cache slot, and a validation-error accumulator. The
//! cache distinguishes "never loaded" (no entry) from "loaded, empty"
//! (`One(None)` / empty `Many`), and is mutated only by relation bindings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Schema;
use crate::validation::ValidationErrors;
use crate::value::{ids_equal, Document};

/// Cached value of one resolved relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedRelation {
    /// Singular relation: `None` means loaded and absent
    One(Option<Record>),
    /// Plural relation, ordered
    Many(Vec<Record>),
}

/// One instance of a declared model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    model: String,
    fields: Document,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    cache: HashMap<String, CachedRelation>,
    #[serde(default, skip_serializing_if = "ValidationErrors::is_empty")]
    errors: ValidationErrors,
}

impl Record {
    pub fn new(model: impl Into<String>, fields: Document) -> Self {
        Self {
            model: model.into(),
            fields,
            cache: HashMap::new(),
            errors: ValidationErrors::new(),
        }
    }

    /// Empty record of a model.
    pub fn empty(model: impl Into<String>) -> Self {
        Self::new(model, Document::new())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Document {
        &mut self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Non-null value of an identifier-bearing field.
    pub fn id_value(&self, id_field: &str) -> Option<&Value> {
        self.fields.get(id_field).filter(|v| !v.is_null())
    }

    /// Validation failures from the last `is_valid` call (or attached by
    /// relation operations).
    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ValidationErrors {
        &mut self.errors
    }

    /// Run the model's registered validators, replacing the error
    /// accumulator with the outcome.
    pub fn is_valid(&mut self, schema: &Schema) -> bool {
        self.errors = schema.collect_errors(self);
        self.errors.is_empty()
    }

    // --- relation cache slot ---

    /// Cached value for a relation; `None` means never loaded.
    pub fn cached(&self, relation: &str) -> Option<&CachedRelation> {
        self.cache.get(relation)
    }

    /// Drop a relation's cache entry back to "never loaded".
    pub fn reset_cache(&mut self, relation: &str) {
        self.cache.remove(relation);
    }

    /// Cache a singular relation value.
    pub fn cache_one(&mut self, relation: &str, value: Option<Record>) {
        self.cache
            .insert(relation.to_string(), CachedRelation::One(value));
    }

    /// Cache a plural relation value, replacing any previous entry.
    pub fn cache_many(&mut self, relation: &str, values: Vec<Record>) {
        self.cache
            .insert(relation.to_string(), CachedRelation::Many(values));
    }

    /// Upsert one record into a plural relation's cache. A cached entry
    /// with the same identifier is replaced in place; otherwise the record
    /// is appended. A missing cache slot is created.
    pub fn add_to_cache(&mut self, relation: &str, record: Record, id_field: &str) {
        match self.cache.get_mut(relation) {
            Some(CachedRelation::Many(values)) => {
                let incoming_id = record.id_value(id_field).cloned();
                let existing = incoming_id.as_ref().and_then(|id| {
                    values
                        .iter()
                        .position(|v| v.id_value(id_field).map(|e| ids_equal(e, id)) == Some(true))
                });
                match existing {
                    Some(index) => values[index] = record,
                    None => values.push(record),
                }
            }
            Some(CachedRelation::One(slot)) => {
                *slot = Some(record);
            }
            None => {
                self.cache
                    .insert(relation.to_string(), CachedRelation::Many(vec![record]));
            }
        }
    }

    /// Remove the first cached entry with a matching identifier from a
    /// plural relation's cache. Missing slot or id is a no-op.
    pub fn remove_from_cache(&mut self, relation: &str, id: &Value, id_field: &str) {
        if let Some(CachedRelation::Many(values)) = self.cache.get_mut(relation) {
            if let Some(index) = values
                .iter()
                .position(|v| v.id_value(id_field).map(|e| ids_equal(e, id)) == Some(true))
            {
                values.remove(index);
            }
        }
    }
}
