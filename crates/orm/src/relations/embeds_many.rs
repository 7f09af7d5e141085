//! EmbedsMany operations
//!
//! Embedded elements live as an ordered JSON array inside a property of
//! the source record, so reads are in-memory scans and every mutation
//! persists the whole sequence back through the source record's model.
//! An invalid candidate element never reaches the stored sequence.

use serde_json::Value;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelationError, RelationResult};
use crate::filter::Filter;
use crate::record::Record;
use crate::validation::ValidationErrors;
use crate::value::{id_to_string, ids_equal, Document};

use super::binding::RelationEngine;
use super::metadata::RelationDefinition;
use super::scope::apply_scope;

#[derive(Debug)]
pub struct EmbedsManyBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> EmbedsManyBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// Current embedded elements as raw documents.
    pub fn items(&self, source: &Record) -> Vec<Document> {
        match source.get(&self.def.key_from) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Filter the embedded sequence in memory against the merged scope and
    /// caller condition. The store is only touched when the caller asks
    /// for included relations on the elements.
    pub async fn related(&self, source: &Record, mut filter: Filter) -> RelationResult<Vec<Record>> {
        let target = self.target()?;
        apply_scope(&self.def, source, &mut filter);
        let mut records: Vec<Record> = filter
            .apply_in_memory(self.items(source))
            .into_iter()
            .map(|doc| self.engine.record_from(&target, doc))
            .collect();
        if !filter.include.is_empty() {
            self.engine
                .expand_includes(&mut records, &filter.include)
                .await?;
        }
        Ok(records)
    }

    /// Linear scan by identifier.
    pub fn find_by_id(&self, source: &Record, id: &Value) -> RelationResult<Record> {
        let target = self.target()?;
        self.items(source)
            .into_iter()
            .find(|item| {
                item.get(&self.def.key_to)
                    .map(|stored| ids_equal(stored, id))
                    .unwrap_or(false)
            })
            .map(|doc| self.engine.record_from(&target, doc))
            .ok_or_else(|| RelationError::NotFound {
                model: target.clone(),
                id: id_to_string(id),
            })
    }

    /// Positional access into the embedded sequence.
    pub fn at(&self, source: &Record, index: usize) -> RelationResult<Option<Record>> {
        let target = self.target()?;
        Ok(self
            .items(source)
            .into_iter()
            .nth(index)
            .map(|doc| self.engine.record_from(&target, doc)))
    }

    /// Construct an element and insert it into the in-memory sequence
    /// without persisting. Auto-assigns an identifier (running numeric
    /// maximum plus one) when enabled and none was supplied; honors the
    /// `prepend` option.
    pub fn build(&self, source: &mut Record, data: Document) -> RelationResult<Record> {
        let target = self.target()?;
        let element = self.prepare(source, data)?;
        self.insert_element(source, element.clone());
        Ok(self.engine.record_from(&target, element))
    }

    /// Build, validate, and persist. An invalid element fails with a
    /// validation error and leaves the stored sequence untouched.
    pub async fn create(&self, source: &mut Record, data: Document) -> RelationResult<Record> {
        let target = self.target()?;
        let element = self.prepare(source, data)?;
        self.validate_element(source, &element, None)?;
        debug!(relation = %self.def.name, "embedding element");

        let previous = source.get(&self.def.key_from).cloned();
        self.insert_element(source, element.clone());
        if let Err(err) = self.engine.save_record(source).await {
            restore(source, &self.def.key_from, previous);
            return Err(err);
        }
        Ok(self.engine.record_from(&target, element))
    }

    /// Apply a field-by-field update to one element, re-validating the
    /// modified element before persisting the sequence. Null change values
    /// unset fields.
    pub async fn update_by_id(
        &self,
        source: &mut Record,
        id: &Value,
        changes: Document,
    ) -> RelationResult<Record> {
        let target = self.target()?;
        let mut items = self.items(source);
        let index = items
            .iter()
            .position(|item| {
                item.get(&self.def.key_to)
                    .map(|stored| ids_equal(stored, id))
                    .unwrap_or(false)
            })
            .ok_or_else(|| RelationError::NotFound {
                model: target.clone(),
                id: id_to_string(id),
            })?;

        let mut element = items[index].clone();
        for (field, value) in changes {
            if value.is_null() {
                element.remove(&field);
            } else {
                element.insert(field, value);
            }
        }
        self.validate_element(source, &element, Some(index))?;

        items[index] = element.clone();
        self.persist_items(source, items).await?;
        Ok(self.engine.record_from(&target, element))
    }

    /// Remove one element by identifier and persist the remaining
    /// sequence.
    pub async fn destroy_by_id(&self, source: &mut Record, id: &Value) -> RelationResult<()> {
        let target = self.target()?;
        let mut items = self.items(source);
        let index = items
            .iter()
            .position(|item| {
                item.get(&self.def.key_to)
                    .map(|stored| ids_equal(stored, id))
                    .unwrap_or(false)
            })
            .ok_or_else(|| RelationError::NotFound {
                model: target,
                id: id_to_string(id),
            })?;
        items.remove(index);
        self.persist_items(source, items).await
    }

    /// Link a referenced record through the back-reference belongsTo
    /// relation declared on the embedded model: embeds an element carrying
    /// the referenced identifier in that relation's foreign key. The
    /// identifier is verified against the store first, so a dangling
    /// reference never enters the sequence.
    pub async fn add(
        &self,
        source: &mut Record,
        referenced_id: &Value,
        extra: Document,
    ) -> RelationResult<Record> {
        let back_ref = self.back_reference()?;
        let referenced = back_ref.target_model.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "belongsTo relation '{}' has no target model",
                back_ref.name
            ))
        })?;
        let id_field = self.engine.schema().id_field(&referenced)?;
        let found = self
            .engine
            .store()
            .find_by_id(&referenced, &id_field, referenced_id)
            .await?;
        if found.is_none() {
            return Err(RelationError::NotFound {
                model: referenced,
                id: id_to_string(referenced_id),
            });
        }
        let mut data = extra;
        data.insert(back_ref.key_from.clone(), referenced_id.clone());
        self.create(source, data).await
    }

    /// Unlink a referenced record: removes embedded elements whose
    /// back-reference foreign key matches. An absent match is a no-op.
    pub async fn remove(&self, source: &mut Record, referenced_id: &Value) -> RelationResult<()> {
        let back_ref = self.back_reference()?;
        let items = self.items(source);
        let remaining: Vec<Document> = items
            .into_iter()
            .filter(|item| {
                !item
                    .get(&back_ref.key_from)
                    .map(|stored| ids_equal(stored, referenced_id))
                    .unwrap_or(false)
            })
            .collect();
        if remaining.len() == self.items(source).len() {
            return Ok(());
        }
        self.persist_items(source, remaining).await
    }

    fn target(&self) -> RelationResult<String> {
        self.def.target_model.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "embedsMany relation '{}' has no embedded model",
                self.def.name
            ))
        })
    }

    /// The belongsTo relation on the embedded model named by the
    /// declaration's back-reference option.
    fn back_reference(&self) -> RelationResult<Arc<RelationDefinition>> {
        let name = self.def.options.belongs_to.as_ref().ok_or_else(|| {
            RelationError::Configuration(format!(
                "embedsMany relation '{}' declares no belongsTo back-reference",
                self.def.name
            ))
        })?;
        let target = self.target()?;
        self.engine
            .schema()
            .relations()
            .get(&target, name)
            .ok_or_else(|| {
                RelationError::InvalidReference(format!(
                    "embedded model '{}' has no relation '{}'",
                    target, name
                ))
            })
    }

    fn prepare(&self, source: &Record, mut data: Document) -> RelationResult<Document> {
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }
        let missing_id = data
            .get(&self.def.key_to)
            .map(Value::is_null)
            .unwrap_or(true);
        if missing_id && self.def.options.auto_id {
            data.insert(self.def.key_to.clone(), Value::from(self.next_id(source)));
        }
        Ok(data)
    }

    /// Running numeric maximum plus one; the first identifier is 1.
    fn next_id(&self, source: &Record) -> u64 {
        self.items(source)
            .iter()
            .filter_map(|item| item.get(&self.def.key_to))
            .filter_map(Value::as_u64)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Validate a candidate element: its own model validators plus
    /// identifier uniqueness within the sequence. `skip` excludes the
    /// element's current position when re-validating an update.
    fn validate_element(
        &self,
        source: &mut Record,
        element: &Document,
        skip: Option<usize>,
    ) -> RelationResult<()> {
        let target = self.target()?;
        let candidate = Record::new(target, element.clone());
        let mut element_errors = self.engine.schema().collect_errors(&candidate);

        if let Some(id) = element.get(&self.def.key_to).filter(|v| !v.is_null()) {
            let duplicate = self
                .items(source)
                .iter()
                .enumerate()
                .filter(|(i, _)| skip != Some(*i))
                .any(|(_, item)| {
                    item.get(&self.def.key_to)
                        .map(|stored| ids_equal(stored, id))
                        .unwrap_or(false)
                });
            if duplicate {
                element_errors.add(&self.def.key_to, "is already taken", "uniqueness");
            }
        }

        if element_errors.is_empty() {
            return Ok(());
        }
        let mut relation_errors = ValidationErrors::new();
        relation_errors.absorb_under(&self.def.key_from, &element_errors);
        source
            .errors_mut()
            .absorb_under(&self.def.key_from, &element_errors);
        Err(RelationError::Validation(relation_errors))
    }

    fn insert_element(&self, source: &mut Record, element: Document) {
        let mut items = match source.unset(&self.def.key_from) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        if self.def.options.prepend {
            items.insert(0, Value::Object(element));
        } else {
            items.push(Value::Object(element));
        }
        source.set(&self.def.key_from, Value::Array(items));
    }

    async fn persist_items(&self, source: &mut Record, items: Vec<Document>) -> RelationResult<()> {
        let previous = source.get(&self.def.key_from).cloned();
        source.set(
            &self.def.key_from,
            Value::Array(items.into_iter().map(Value::Object).collect()),
        );
        if let Err(err) = self.engine.save_record(source).await {
            restore(source, &self.def.key_from, previous);
            return Err(err);
        }
        Ok(())
    }
}

fn restore(source: &mut Record, property: &str, previous: Option<Value>) {
    match previous {
        Some(value) => source.set(property, value),
        None => {
            source.unset(property);
        }
    }
}
