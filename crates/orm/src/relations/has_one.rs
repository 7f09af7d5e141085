//! HasOne operations
//!
//! Mirror of BelongsTo with the foreign key on the target side. The store
//! does not enforce uniqueness, so `create` checks the slot first and
//! fails with `DuplicateHasOne` when a target already exists.

use serde_json::Value;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelationError, RelationResult};
use crate::filter::Filter;
use crate::record::{CachedRelation, Record};
use crate::value::{id_to_string, ids_equal, Document};

use super::binding::RelationEngine;
use super::metadata::RelationDefinition;
use super::scope::apply_scope;

#[derive(Debug)]
pub struct HasOneBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> HasOneBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// Cached related record, without touching the store.
    pub fn get(&self, source: &Record) -> Option<Record> {
        match source.cached(&self.def.name) {
            Some(CachedRelation::One(value)) => value.clone(),
            _ => None,
        }
    }

    /// Link a target in memory: stamp the source's identifier (and the
    /// discriminator when polymorphic) onto the target's foreign key and
    /// cache it. Does not persist the target.
    pub fn set(&self, source: &mut Record, target: &mut Record) -> RelationResult<()> {
        let source_id = self.engine.source_id(&self.def, source)?;
        target.set(&self.def.key_to, source_id);
        if let Some(poly) = &self.def.polymorphic {
            target.set(
                &poly.discriminator_field,
                Value::String(source.model().to_string()),
            );
        }
        source.cache_one(&self.def.name, Some(target.clone()));
        Ok(())
    }

    /// Fetch the related record by foreign key, verifying the returned
    /// record actually carries the source's identifier.
    pub async fn load(&self, source: &mut Record, refresh: bool) -> RelationResult<Option<Record>> {
        if !refresh {
            if let Some(CachedRelation::One(value)) = source.cached(&self.def.name) {
                return Ok(value.clone());
            }
        }

        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;
        let mut filter = Filter::where_eq(&self.def.key_to, source_id.clone());
        apply_scope(&self.def, source, &mut filter);
        debug!(relation = %self.def.name, target = %target, "loading hasOne");

        let found = self.engine.store().find_one(&target, &filter).await?;
        let record = match found {
            Some(doc) => {
                let record = self.engine.record_from(&target, doc);
                let actual = record.id_value(&self.def.key_to).cloned().unwrap_or(Value::Null);
                if !ids_equal(&actual, &source_id) {
                    return Err(RelationError::KeyMismatch {
                        model: target,
                        expected: id_to_string(&source_id),
                        actual: id_to_string(&actual),
                    });
                }
                Some(record)
            }
            None => None,
        };
        source.cache_one(&self.def.name, record.clone());
        Ok(record)
    }

    /// Create the single target. An occupied slot fails with
    /// `DuplicateHasOne` before anything is written.
    pub async fn create(&self, source: &mut Record, data: Document) -> RelationResult<Record> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let target = self.engine.target_model(&self.def, source)?;

        let mut occupied = Filter::where_eq(&self.def.key_to, source_id);
        apply_scope(&self.def, source, &mut occupied);
        if self.engine.store().find_one(&target, &occupied).await?.is_some() {
            return Err(RelationError::DuplicateHasOne {
                relation: self.def.name.clone(),
            });
        }

        let data = self.stamp(source, data)?;
        let id_field = self.engine.schema().id_field(&target)?;
        let created = self.engine.store().insert(&target, &id_field, data).await?;
        let record = self.engine.record_from(&target, created);
        source.cache_one(&self.def.name, Some(record.clone()));
        Ok(record)
    }

    /// Construct an unpersisted, foreign-key-stamped target instance.
    pub fn build(&self, source: &Record, data: Document) -> RelationResult<Record> {
        let target = self.engine.target_model(&self.def, source)?;
        let data = self.stamp(source, data)?;
        Ok(self.engine.record_from(&target, data))
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
    use crate::relations::metadata::RelationConfig;
    use crate::schema::Schema;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> RelationEngine {
        let schema = Arc::new(Schema::new());
        schema.define_model("User");
        schema.define_model("Profile");
        schema
            .has_one("User", "profile", RelationConfig::new().target("Profile"))
            .unwrap();
        RelationEngine::new(schema, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let engine = engine();
        let binding = engine.has_one("User", "profile").unwrap();
        let mut user = Record::new("User", doc(json!({"id": 1})));

        let profile = binding
            .create(&mut user, doc(json!({"bio": "hello"})))
            .await
            .unwrap();
        assert_eq!(profile.get("user_id"), Some(&json!(1)));

        user.reset_cache("profile");
        let loaded = binding.load(&mut user, false).await.unwrap().unwrap();
        assert_eq!(loaded.get("bio"), Some(&json!("hello")));
    }

    #[tokio::test]
    async fn test_create_on_occupied_slot_fails() {
        let engine = engine();
        let binding = engine.has_one("User", "profile").unwrap();
        let mut user = Record::new("User", doc(json!({"id": 1})));

        binding
            .create(&mut user, doc(json!({"bio": "first"})))
            .await
            .unwrap();
        let err = binding
            .create(&mut user, doc(json!({"bio": "second"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RelationError::DuplicateHasOne { .. }));
        // no second row was created
        assert_eq!(engine.store().count("Profile", &Default::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_verifies_foreign_key() {
        let engine = engine();
        let binding = engine.has_one("User", "profile").unwrap();
        let mut user = Record::new("User", doc(json!({"id": 1})));
        // no profile yet
        assert!(binding.load(&mut user, false).await.unwrap().is_none());
        assert_eq!(user.cached("profile"), Some(&CachedRelation::One(None)));
    }

    #[tokio::test]
    async fn test_set_stamps_target() {
        let engine = engine();
        let binding = engine.has_one("User", "profile").unwrap();
        let mut user = Record::new("User", doc(json!({"id": 1})));
        let mut profile = Record::new("Profile", doc(json!({"id": 9})));

        binding.set(&mut user, &mut profile).unwrap();
        assert_eq!(profile.get("user_id"), Some(&json!(1)));
        assert!(binding.get(&user).is_some());
    }
}
