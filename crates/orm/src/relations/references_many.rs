//! ReferencesMany operations
//!
//! The source record holds an ordered list of target identifiers.
//! Membership tests are in-memory under the identifier policy; resolution
//! goes through the store's batch-by-identifiers query and restores the
//! list order afterwards.

use serde_json::Value;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelationError, RelationResult};
use crate::filter::Filter;
use crate::record::Record;
use crate::value::{id_to_string, ids_equal, Document};

use super::binding::{RelationEngine, TargetRef};
use super::metadata::RelationDefinition;
use super::scope::apply_scope;

#[derive(Debug)]
pub struct ReferencesManyBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> ReferencesManyBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// The stored identifier list.
    pub fn ids(&self, source: &Record) -> Vec<Value> {
        match source.get(&self.def.key_from) {
            Some(Value::Array(ids)) => ids.iter().filter(|v| !v.is_null()).cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Resolve all referenced identifiers through the store's batch query,
    /// restoring the identifier-list order on the result and refreshing
    /// the cache slot.
    pub async fn related(&self, source: &mut Record, mut filter: Filter) -> RelationResult<Vec<Record>> {
        let target = self.target()?;
        let ids = self.ids(source);
        if ids.is_empty() {
            source.cache_many(&self.def.name, Vec::new());
            return Ok(Vec::new());
        }

        filter.where_clause.and_inq(&self.def.key_to, ids.clone());
        apply_scope(&self.def, source, &mut filter);
        debug!(relation = %self.def.name, count = ids.len(), "resolving references");

        let docs = self.engine.store().find(&target, &filter).await?;
        let mut resolved: Vec<Record> = docs
            .into_iter()
            .map(|doc| self.engine.record_from(&target, doc))
            .collect();
        // restore the id-list order unless the caller ordered explicitly
        if filter.order.is_empty() {
            resolved.sort_by_key(|record| {
                record
                    .id_value(&self.def.key_to)
                    .and_then(|id| ids.iter().position(|candidate| ids_equal(candidate, id)))
                    .unwrap_or(usize::MAX)
            });
        }
        if !filter.include.is_empty() {
            self.engine
                .expand_includes(&mut resolved, &filter.include)
                .await?;
        }
        source.cache_many(&self.def.name, resolved.clone());
        Ok(resolved)
    }

    /// Resolve one referenced identifier. `NotFound` when the batch query
    /// returns nothing, `KeyMismatch` when the resolved record carries a
    /// different identifier.
    pub async fn find_by_id(&self, source: &Record, id: &Value) -> RelationResult<Record> {
        let target = self.target()?;
        if !self.exists(source, id) {
            return Err(RelationError::NotFound {
                model: target,
                id: id_to_string(id),
            });
        }

        let mut filter = Filter::new();
        filter
            .where_clause
            .and_inq(&self.def.key_to, vec![id.clone()]);
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
        let actual = record.id_value(&self.def.key_to).cloned().unwrap_or(Value::Null);
        if !ids_equal(&actual, id) {
            return Err(RelationError::KeyMismatch {
                model: target,
                expected: id_to_string(id),
                actual: id_to_string(&actual),
            });
        }
        Ok(record)
    }

    /// In-memory membership test under the identifier policy.
    pub fn exists(&self, source: &Record, id: &Value) -> bool {
        self.ids(source).iter().any(|stored| ids_equal(stored, id))
    }

    /// Resolve the identifier at a position. `Ok(None)` when the position
    /// is out of bounds.
    pub async fn at(&self, source: &Record, index: usize) -> RelationResult<Option<Record>> {
        match self.ids(source).get(index).cloned() {
            Some(id) => Ok(Some(self.find_by_id(source, &id).await?)),
            None => Ok(None),
        }
    }

    /// Create and persist a new target, then record its identifier in the
    /// source's list and persist that list.
    pub async fn create(&self, source: &mut Record, mut data: Document) -> RelationResult<Record> {
        let target = self.target()?;
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }
        let created = self
            .engine
            .store()
            .insert(&target, &self.def.key_to, data)
            .await?;
        let record = self.engine.record_from(&target, created);
        let id = record
            .id_value(&self.def.key_to)
            .cloned()
            .ok_or_else(|| RelationError::InvalidReference(format!(
                "created {} record has no identifier",
                target
            )))?;
        self.append_id(source, id).await?;
        source.add_to_cache(&self.def.name, record.clone(), &self.def.key_to);
        Ok(record)
    }

    /// Record a target's identifier in the list. A raw identifier is
    /// verified against the store first; an already-present identifier is
    /// a no-op (the list holds no duplicates).
    pub async fn add(&self, source: &mut Record, target: TargetRef) -> RelationResult<()> {
        let target_model = self.target()?;
        let id = target.id(&self.def.key_to)?;
        if self.exists(source, &id) {
            return Ok(());
        }
        if target.record().is_none() {
            let found = self
                .engine
                .store()
                .find_by_id(&target_model, &self.def.key_to, &id)
                .await?;
            if found.is_none() {
                return Err(RelationError::NotFound {
                    model: target_model,
                    id: id_to_string(&id),
                });
            }
        }
        self.append_id(source, id.clone()).await?;
        if let Some(record) = target.record() {
            source.add_to_cache(&self.def.name, record.clone(), &self.def.key_to);
        }
        Ok(())
    }

    /// Remove an identifier from the list and persist. Absent identifiers
    /// are a no-op, not an error.
    pub async fn remove(&self, source: &mut Record, id: &Value) -> RelationResult<()> {
        let ids = self.ids(source);
        let remaining: Vec<Value> = ids
            .iter()
            .filter(|stored| !ids_equal(stored, id))
            .cloned()
            .collect();
        if remaining.len() == ids.len() {
            return Ok(());
        }
        self.persist_ids(source, remaining).await?;
        source.remove_from_cache(&self.def.name, id, &self.def.key_to);
        Ok(())
    }

    fn target(&self) -> RelationResult<String> {
        self.def.target_model.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "referencesMany relation '{}' has no target model",
                self.def.name
            ))
        })
    }

    async fn append_id(&self, source: &mut Record, id: Value) -> RelationResult<()> {
        let mut ids = self.ids(source);
        if self.def.options.prepend {
            ids.insert(0, id);
        } else {
            ids.push(id);
        }
        self.persist_ids(source, ids).await
    }

    async fn persist_ids(&self, source: &mut Record, ids: Vec<Value>) -> RelationResult<()> {
        let previous = source.get(&self.def.key_from).cloned();
        source.set(&self.def.key_from, Value::Array(ids));
        if let Err(err) = self.engine.save_record(source).await {
            match previous {
                Some(value) => source.set(&self.def.key_from, value),
                None => {
                    source.unset(&self.def.key_from);
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::metadata::RelationConfig;
    use crate::schema::Schema;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn engine() -> (RelationEngine, Record) {
        let schema = Arc::new(Schema::new());
        schema.define_model("Post");
        schema.define_model("Tag");
        schema
            .references_many("Post", "tags", RelationConfig::new().target("Tag"))
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let stored = store
            .insert("Post", "id", doc(json!({"title": "hello"})))
            .await
            .unwrap();
        let post = Record::new("Post", stored);
        (RelationEngine::new(schema, store), post)
    }

    #[tokio::test]
    async fn test_create_appends_identifier() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();

        let tag = binding
            .create(&mut post, doc(json!({"name": "rust"})))
            .await
            .unwrap();
        let id = tag.id_value("id").cloned().unwrap();
        assert_eq!(binding.ids(&post), vec![id.clone()]);
        assert!(binding.exists(&post, &id));
        // persisted onto the source row as well
        let post_id = post.id_value("id").cloned().unwrap();
        let stored = engine
            .store()
            .find_by_id("Post", "id", &post_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("tag_ids"), Some(&json!([id])));
    }

    #[tokio::test]
    async fn test_add_then_remove_round_trips() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();
        engine
            .store()
            .insert("Tag", "id", doc(json!({"id": 5, "name": "rust"})))
            .await
            .unwrap();
        let before = binding.ids(&post);

        binding.add(&mut post, TargetRef::Id(json!(5))).await.unwrap();
        assert!(binding.exists(&post, &json!(5)));
        binding.remove(&mut post, &json!(5)).await.unwrap();
        assert_eq!(binding.ids(&post), before);

        // removing an absent identifier is a no-op
        binding.remove(&mut post, &json!(5)).await.unwrap();
        assert_eq!(binding.ids(&post), before);
    }

    #[tokio::test]
    async fn test_add_raw_id_verifies_existence() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();

        let err = binding
            .add(&mut post, TargetRef::Id(json!(99)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelationError::NotFound { .. }));
        assert!(binding.ids(&post).is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();
        engine
            .store()
            .insert("Tag", "id", doc(json!({"id": 5})))
            .await
            .unwrap();

        binding.add(&mut post, TargetRef::Id(json!(5))).await.unwrap();
        binding.add(&mut post, TargetRef::Id(json!("5"))).await.unwrap();
        assert_eq!(binding.ids(&post).len(), 1);
    }

    #[tokio::test]
    async fn test_exists_normalizes_identifier_types() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();
        engine
            .store()
            .insert("Tag", "id", doc(json!({"id": 5})))
            .await
            .unwrap();
        binding.add(&mut post, TargetRef::Id(json!(5))).await.unwrap();
        assert!(binding.exists(&post, &json!("5")));
    }

    #[tokio::test]
    async fn test_related_restores_list_order() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            engine
                .store()
                .insert("Tag", "id", doc(json!({"id": id, "name": name})))
                .await
                .unwrap();
        }
        for id in [3, 1, 2] {
            binding.add(&mut post, TargetRef::Id(json!(id))).await.unwrap();
        }

        let related = binding.related(&mut post, Filter::new()).await.unwrap();
        let names: Vec<&Value> = related.iter().filter_map(|r| r.get("name")).collect();
        assert_eq!(names, vec![&json!("c"), &json!("a"), &json!("b")]);
    }

    #[tokio::test]
    async fn test_find_by_id_requires_membership() {
        let (engine, mut post) = engine().await;
        let binding = engine.references_many("Post", "tags").unwrap();
        engine
            .store()
            .insert("Tag", "id", doc(json!({"id": 5, "name": "rust"})))
            .await
            .unwrap();

        // exists in the store but not referenced
        let err = binding.find_by_id(&post, &json!(5)).await.unwrap_err();
        assert!(matches!(err, RelationError::NotFound { .. }));

        binding.add(&mut post, TargetRef::Id(json!(5))).await.unwrap();
        let found = binding.find_by_id(&post, &json!(5)).await.unwrap();
        assert_eq!(found.get("name"), Some(&json!("rust")));
        assert_eq!(
            binding
                .at(&post, 0)
                .await
                .unwrap()
                .unwrap()
                .get("name"),
            Some(&json!("rust"))
        );
        assert!(binding.at(&post, 4).await.unwrap().is_none());
    }
}
