//! BelongsTo operations
//!
//! The foreign key lives on the source record and points at the target's
//! identifier. The original overloaded accessor is split into `get`
//! (synchronous cached read), `set` (synchronous link), and `load`
//! (async fetch).

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
pub struct BelongsToBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> BelongsToBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// Cached related record, without touching the store. `None` either
    /// means never loaded or loaded-and-absent; `cached` on the record
    /// distinguishes the two.
    pub fn get(&self, source: &Record) -> Option<Record> {
        match source.cached(&self.def.name) {
            Some(CachedRelation::One(value)) => value.clone(),
            _ => None,
        }
    }

    /// Link the source to a target in memory: copy the target's identifier
    /// into the foreign key, stamp the discriminator when polymorphic,
    /// apply the property mapper, and cache the target. `None` unlinks.
    pub fn set(&self, source: &mut Record, target: Option<&Record>) -> RelationResult<()> {
        match target {
            Some(target) => {
                let target_id_field = self.target_id_field(target.model())?;
                let id = target.id_value(&target_id_field).cloned().ok_or_else(|| {
                    RelationError::InvalidReference(format!(
                        "{} record has no identifier to link '{}'",
                        target.model(),
                        self.def.name
                    ))
                })?;
                source.set(&self.def.key_from, id);
                if let Some(poly) = &self.def.polymorphic {
                    source.set(
                        &poly.discriminator_field,
                        Value::String(target.model().to_string()),
                    );
                }
                if let Some(mapper) = &self.def.mapper {
                    mapper.apply(target, source.fields_mut());
                }
                source.cache_one(&self.def.name, Some(target.clone()));
            }
            None => {
                source.set(&self.def.key_from, Value::Null);
                if let Some(poly) = &self.def.polymorphic {
                    source.set(&poly.discriminator_field, Value::Null);
                }
                source.cache_one(&self.def.name, None);
            }
        }
        Ok(())
    }

    /// Fetch the related record. A cached value is returned unless
    /// `refresh` is set; an absent or null foreign key short-circuits to
    /// `Ok(None)` without querying. The fetched record's identifier is
    /// verified against the foreign key.
    pub async fn load(&self, source: &mut Record, refresh: bool) -> RelationResult<Option<Record>> {
        if !refresh {
            if let Some(CachedRelation::One(value)) = source.cached(&self.def.name) {
                return Ok(value.clone());
            }
        }

        let fk = match source.id_value(&self.def.key_from) {
            Some(fk) => fk.clone(),
            None => {
                source.cache_one(&self.def.name, None);
                return Ok(None);
            }
        };

        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.target_id_field(&target)?;
        let mut filter = Filter::where_eq(&id_field, fk.clone());
        apply_scope(&self.def, source, &mut filter);
        debug!(relation = %self.def.name, target = %target, "loading belongsTo");

        let found = self.engine.store().find_one(&target, &filter).await?;
        let record = match found {
            Some(doc) => {
                let record = self.engine.record_from(&target, doc);
                let actual = record.id_value(&id_field).cloned().unwrap_or(Value::Null);
                if !ids_equal(&actual, &fk) {
                    return Err(RelationError::KeyMismatch {
                        model: target,
                        expected: id_to_string(&fk),
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

    /// Create the target record and link the source to it.
    pub async fn create(&self, source: &mut Record, mut data: Document) -> RelationResult<Record> {
        let target = self.engine.target_model(&self.def, source)?;
        let id_field = self.target_id_field(&target)?;
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }
        let created = self.engine.store().insert(&target, &id_field, data).await?;
        let record = self.engine.record_from(&target, created);
        self.set(source, Some(&record))?;
        Ok(record)
    }

    /// Construct an unpersisted target instance.
    pub fn build(&self, source: &Record, mut data: Document) -> RelationResult<Record> {
        let target = self.engine.target_model(&self.def, source)?;
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }
        Ok(self.engine.record_from(&target, data))
    }

    /// Target-side identifier field: the declared `key_to` for concrete
    /// targets, the target model's id field for polymorphic ones.
    fn target_id_field(&self, target: &str) -> RelationResult<String> {
        if self.def.key_to.is_empty() {
            self.engine.schema().id_field(target)
        } else {
            Ok(self.def.key_to.clone())
        }
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

    async fn engine() -> RelationEngine {
        let schema = Arc::new(Schema::new());
        schema.define_model("User");
        schema.define_model("Post");
        schema
            .belongs_to("Post", "author", RelationConfig::new().target("User"))
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert("User", "id", doc(json!({"id": 1, "name": "ada"})))
            .await
            .unwrap();
        RelationEngine::new(schema, store)
    }

    #[tokio::test]
    async fn test_load_resolves_foreign_key() {
        let engine = engine().await;
        let binding = engine.belongs_to("Post", "author").unwrap();
        let mut post = Record::new("Post", doc(json!({"id": 10, "author_id": 1})));

        let author = binding.load(&mut post, false).await.unwrap().unwrap();
        assert_eq!(author.get("name"), Some(&json!("ada")));
        // second call is served from cache
        assert!(matches!(
            post.cached("author"),
            Some(CachedRelation::One(Some(_)))
        ));
        assert_eq!(binding.get(&post).unwrap().get("name"), Some(&json!("ada")));
    }

    #[tokio::test]
    async fn test_load_short_circuits_on_missing_foreign_key() {
        let engine = engine().await;
        let binding = engine.belongs_to("Post", "author").unwrap();
        let mut post = Record::new("Post", doc(json!({"id": 10})));

        assert!(binding.load(&mut post, false).await.unwrap().is_none());
        // loaded-and-absent, not never-loaded
        assert_eq!(post.cached("author"), Some(&CachedRelation::One(None)));
    }

    #[tokio::test]
    async fn test_load_absent_target_is_none() {
        let engine = engine().await;
        let binding = engine.belongs_to("Post", "author").unwrap();
        let mut post = Record::new("Post", doc(json!({"id": 10, "author_id": 99})));
        assert!(binding.load(&mut post, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_links_and_unlinks() {
        let engine = engine().await;
        let binding = engine.belongs_to("Post", "author").unwrap();
        let mut post = Record::new("Post", doc(json!({"id": 10})));
        let user = Record::new("User", doc(json!({"id": 1, "name": "ada"})));

        binding.set(&mut post, Some(&user)).unwrap();
        assert_eq!(post.get("author_id"), Some(&json!(1)));
        assert!(binding.get(&post).is_some());

        binding.set(&mut post, None).unwrap();
        assert_eq!(post.get("author_id"), Some(&json!(null)));
        assert!(binding.get(&post).is_none());
    }

    #[tokio::test]
    async fn test_create_links_source() {
        let engine = engine().await;
        let binding = engine.belongs_to("Post", "author").unwrap();
        let mut post = Record::new("Post", doc(json!({"id": 10})));

        let author = binding
            .create(&mut post, doc(json!({"name": "grace"})))
            .await
            .unwrap();
        let id = author.id_value("id").cloned().unwrap();
        assert_eq!(post.get("author_id"), Some(&id));
        assert!(engine
            .store()
            .find_by_id("User", "id", &id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_polymorphic_load_requires_known_discriminator() {
        let schema = Arc::new(Schema::new());
        schema.define_model("Picture");
        schema.define_model("Author");
        schema
            .belongs_to(
                "Picture",
                "imageable",
                RelationConfig::new().polymorphic_as("imageable"),
            )
            .unwrap();
        let engine = RelationEngine::new(schema, Arc::new(MemoryStore::new()));
        let binding = engine.belongs_to("Picture", "imageable").unwrap();

        let mut picture = Record::new(
            "Picture",
            doc(json!({"id": 1, "imageable_id": 5, "imageable_type": "Reader"})),
        );
        let err = binding.load(&mut picture, false).await.unwrap_err();
        assert!(matches!(err, RelationError::UnresolvedPolymorphicType(_)));

        picture.set("imageable_type", json!("author"));
        // resolves case-insensitively; the store has no row, so absent
        assert!(binding.load(&mut picture, false).await.unwrap().is_none());
    }
}
