//! HasMany operations
//!
//! Plural relation with the foreign key on the target side; the cache slot
//! is an ordered sequence mutated through upsert/evict helpers so a second
//! operation on the same identifier never duplicates an entry.

use serde_json::Value;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelationError, RelationResult};
use crate::filter::Filter;
use crate::record::Record;
use crate::value::{id_to_string, ids_equal, Document};

use super::binding::RelationEngine;
use super::metadata::RelationDefinition;
use super::scope::apply_scope;

#[derive(Debug)]
pub struct HasManyBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> HasManyBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// Fetch related records matching the caller's filter, refreshing the
    /// cache slot with the result.
    pub async fn related(&self, source: &mut Record, mut filter: Filter) -> RelationResult<Vec<Record>> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;
        filter.where_clause.and_eq(&self.def.key_to, source_id);
        apply_scope(&self.def, source, &mut filter);
        debug!(relation = %self.def.name, target = %target, "loading hasMany");

        let docs = self.engine.store().find(&target, &filter).await?;
        let mut records: Vec<Record> = docs
            .into_iter()
            .map(|doc| self.engine.record_from(&target, doc))
            .collect();
        if !filter.include.is_empty() {
            self.engine
                .expand_includes(&mut records, &filter.include)
                .await?;
        }
        source.cache_many(&self.def.name, records.clone());
        Ok(records)
    }

    /// Fetch one related record by identifier, constrained to and verified
    /// against the source's foreign key.
    pub async fn find_by_id(&self, source: &Record, id: &Value) -> RelationResult<Record> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.engine.schema().id_field(&target)?;

        let mut filter = Filter::where_eq(&id_field, id.clone());
        filter.where_clause.and_eq(&self.def.key_to, source_id.clone());
        apply_scope(&self.def, source, &mut filter);

        let doc = self
            .engine
            .store()
            .find_one(&target, &filter)
            .await?
            .ok_or_else(|| RelationError::NotFound {
                model: target.clone(),
                id: id_to_string(id),
            })?;
        let record = self.engine.record_from(&target, doc);
        // integrity check against a misbehaving store
        let actual = record.id_value(&self.def.key_to).cloned().unwrap_or(Value::Null);
        if !ids_equal(&actual, &source_id) {
            return Err(RelationError::KeyMismatch {
                model: target,
                expected: id_to_string(&source_id),
                actual: id_to_string(&actual),
            });
        }
        Ok(record)
    }

    /// Whether a target with this identifier exists and belongs to the
    /// source. Never errors on absence.
    pub async fn exists(&self, source: &Record, id: &Value) -> RelationResult<bool> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.engine.schema().id_field(&target)?;

        let found = self.engine.store().find_by_id(&target, &id_field, id).await?;
        Ok(match found {
            Some(doc) => doc
                .get(&self.def.key_to)
                .map(|fk| ids_equal(fk, &source_id))
                .unwrap_or(false),
            None => false,
        })
    }

    /// Update one related record's fields, upserting the result into the
    /// cache slot.
    pub async fn update_by_id(
        &self,
        source: &mut Record,
        id: &Value,
        changes: Document,
    ) -> RelationResult<Record> {
        self.find_by_id(source, id).await?;
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.engine.schema().id_field(&target)?;
        let updated = self
            .engine
            .store()
            .update_by_id(&target, &id_field, id, changes)
            .await?
            .ok_or_else(|| RelationError::NotFound {
                model: target.clone(),
                id: id_to_string(id),
            })?;
        let record = self.engine.record_from(&target, updated);
        source.add_to_cache(&self.def.name, record.clone(), &id_field);
        Ok(record)
    }

    /// Delete one related record, evicting it from the cache slot.
    pub async fn destroy_by_id(&self, source: &mut Record, id: &Value) -> RelationResult<()> {
        self.find_by_id(source, id).await?;
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.engine.schema().id_field(&target)?;
        self.engine.store().delete_by_id(&target, &id_field, id).await?;
        source.remove_from_cache(&self.def.name, id, &id_field);
        Ok(())
    }

    /// Create a related record with the foreign key stamped, upserting it
    /// into the cache slot.
    pub async fn create(&self, source: &mut Record, data: Document) -> RelationResult<Record> {
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.engine.schema().id_field(&target)?;
        let data = self.stamp(source, data)?;
        let created = self.engine.store().insert(&target, &id_field, data).await?;
        let record = self.engine.record_from(&target, created);
        source.add_to_cache(&self.def.name, record.clone(), &id_field);
        Ok(record)
    }

    /// Construct an unpersisted, foreign-key-stamped target instance.
    pub fn build(&self, source: &Record, data: Document) -> RelationResult<Record> {
        let target = self.engine.target_model(&self.def, source)?;
        let data = self.stamp(source, data)?;
        Ok(self.engine.record_from(&target, data))
    }

    /// Count related records matching an extra condition.
    pub async fn count(&self, source: &Record, extra: Filter) -> RelationResult<usize> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;
        let mut filter = extra;
        filter.where_clause.and_eq(&self.def.key_to, source_id);
        apply_scope(&self.def, source, &mut filter);
        self.engine.store().count(&target, &filter.where_clause).await
    }

    fn stamp(&self, source: &Record, mut data: Document) -> RelationResult<Document> {
        let source_id = self.engine.source_id(&self.def, source)?;
        data.insert(self.def.key_to.clone(), source_id);
        if let Some(poly) = &self.def.polymorphic {
            data.insert(
                poly.discriminator_field.clone(),
                Value::String(source.model().to_string()),
            );
        }
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CachedRelation;
    use crate::relations::metadata::RelationConfig;
    use crate::schema::Schema;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> RelationEngine {
        let schema = Arc::new(Schema::new());
        schema.define_model("Author");
        schema.define_model("Post");
        schema
            .has_many("Author", "posts", RelationConfig::new().target("Post"))
            .unwrap();
        RelationEngine::new(schema, Arc::new(MemoryStore::new()))
    }

    fn cached_len(record: &Record, relation: &str) -> usize {
        match record.cached(relation) {
            Some(CachedRelation::Many(values)) => values.len(),
            _ => 0,
        }
    }

    #[tokio::test]
    async fn test_create_then_find_by_id() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut author = Record::new("Author", doc(json!({"id": 1})));

        let post = binding
            .create(&mut author, doc(json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(post.get("author_id"), Some(&json!(1)));

        let id = post.id_value("id").cloned().unwrap();
        let found = binding.find_by_id(&author, &id).await.unwrap();
        assert_eq!(found.get("title"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_find_by_id_scoped_to_owner() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut owner = Record::new("Author", doc(json!({"id": 1})));
        let mut other = Record::new("Author", doc(json!({"id": 2})));

        let post = binding
            .create(&mut owner, doc(json!({"title": "a"})))
            .await
            .unwrap();
        let id = post.id_value("id").cloned().unwrap();

        let err = binding.find_by_id(&other, &id).await.unwrap_err();
        assert!(matches!(err, RelationError::NotFound { .. }));
        assert!(!binding.exists(&other, &id).await.unwrap());
        assert!(binding.exists(&owner, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_upserts_cache_without_duplicates() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut author = Record::new("Author", doc(json!({"id": 1})));

        let post = binding
            .create(&mut author, doc(json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(cached_len(&author, "posts"), 1);

        let id = post.id_value("id").cloned().unwrap();
        binding
            .update_by_id(&mut author, &id, doc(json!({"title": "b"})))
            .await
            .unwrap();
        // same identifier replaced in place, not appended
        assert_eq!(cached_len(&author, "posts"), 1);
    }

    #[tokio::test]
    async fn test_destroy_by_id_evicts_cache_and_storage() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut author = Record::new("Author", doc(json!({"id": 1})));

        let post = binding
            .create(&mut author, doc(json!({"title": "a"})))
            .await
            .unwrap();
        let id = post.id_value("id").cloned().unwrap();

        binding.destroy_by_id(&mut author, &id).await.unwrap();
        assert_eq!(cached_len(&author, "posts"), 0);
        let err = binding.find_by_id(&author, &id).await.unwrap_err();
        assert!(matches!(err, RelationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_related_applies_scope_and_filter() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut author = Record::new("Author", doc(json!({"id": 1})));
        for title in ["a", "b"] {
            binding
                .create(&mut author, doc(json!({"title": title})))
                .await
                .unwrap();
        }

        let all = binding.related(&mut author, Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let some = binding
            .related(&mut author, Filter::where_eq("title", json!("b")))
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(cached_len(&author, "posts"), 1);
    }

    #[tokio::test]
    async fn test_count() {
        let engine = engine();
        let binding = engine.has_many("Author", "posts").unwrap();
        let mut author = Record::new("Author", doc(json!({"id": 1})));
        binding
            .create(&mut author, doc(json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(binding.count(&author, Filter::new()).await.unwrap(), 1);
    }
}
