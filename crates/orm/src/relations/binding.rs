//! Relation engine and per-kind binding dispatch
//!
//! A `RelationEngine` pairs a schema with a store and hands out bindings.
//! A binding is short-lived: it pairs one relation definition with the
//! engine for the duration of a call chain, and borrows the source record
//! mutably per operation, so the per-instance cache slot cannot be raced
//! from safe code.
//!
//! The kind-specific operation surfaces live in their own modules; the
//! `Binding` enum is the tagged dispatch over them, plus a generic `load`
//! entry point for callers driving relations by name.

use serde_json::Value;

use std::sync::Arc;

use crate::error::{RelationError, RelationResult};
use crate::filter::Filter;
use crate::record::{CachedRelation, Record};
use crate::schema::Schema;
use crate::store::Store;
use crate::value::{id_to_string, Document};

use super::belongs_to::BelongsToBinding;
use super::embeds_many::EmbedsManyBinding;
use super::has_many::HasManyBinding;
use super::has_many_through::HasManyThroughBinding;
use super::has_one::HasOneBinding;
use super::metadata::{RelationDefinition, RelationKind};
use super::polymorphic;
use super::references_many::ReferencesManyBinding;

/// Resolves declared relations against a schema and a store
#[derive(Clone)]
pub struct RelationEngine {
    schema: Arc<Schema>,
    store: Arc<dyn Store>,
}

impl RelationEngine {
    pub fn new(schema: Arc<Schema>, store: Arc<dyn Store>) -> Self {
        Self { schema, store }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Bind a declared relation of a model, dispatching on its kind.
    /// Unknown relation names are a synchronous `InvalidReference`.
    pub fn bind(&self, model: &str, relation: &str) -> RelationResult<Binding<'_>> {
        let def = self.definition(model, relation)?;
        Ok(match def.kind {
            RelationKind::BelongsTo => Binding::BelongsTo(BelongsToBinding::new(self, def)),
            RelationKind::HasOne => Binding::HasOne(HasOneBinding::new(self, def)),
            RelationKind::HasMany => Binding::HasMany(HasManyBinding::new(self, def)),
            RelationKind::HasManyThrough | RelationKind::HasAndBelongsToMany => {
                Binding::HasManyThrough(HasManyThroughBinding::new(self, def))
            }
            RelationKind::EmbedsMany => Binding::EmbedsMany(EmbedsManyBinding::new(self, def)),
            RelationKind::ReferencesMany => {
                Binding::ReferencesMany(ReferencesManyBinding::new(self, def))
            }
        })
    }

    /// Typed binding accessors, each checking the declared kind.
    pub fn belongs_to(&self, model: &str, relation: &str) -> RelationResult<BelongsToBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::BelongsTo(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "belongsTo", other.kind())),
        }
    }

    pub fn has_one(&self, model: &str, relation: &str) -> RelationResult<HasOneBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::HasOne(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "hasOne", other.kind())),
        }
    }

    pub fn has_many(&self, model: &str, relation: &str) -> RelationResult<HasManyBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::HasMany(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "hasMany", other.kind())),
        }
    }

    pub fn has_many_through(
        &self,
        model: &str,
        relation: &str,
    ) -> RelationResult<HasManyThroughBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::HasManyThrough(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "hasManyThrough", other.kind())),
        }
    }

    pub fn embeds_many(&self, model: &str, relation: &str) -> RelationResult<EmbedsManyBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::EmbedsMany(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "embedsMany", other.kind())),
        }
    }

    pub fn references_many(
        &self,
        model: &str,
        relation: &str,
    ) -> RelationResult<ReferencesManyBinding<'_>> {
        match self.bind(model, relation)? {
            Binding::ReferencesMany(binding) => Ok(binding),
            other => Err(kind_mismatch(relation, "referencesMany", other.kind())),
        }
    }

    fn definition(&self, model: &str, relation: &str) -> RelationResult<Arc<RelationDefinition>> {
        self.schema
            .relations()
            .get(model, relation)
            .ok_or_else(|| {
                RelationError::InvalidReference(format!(
                    "model '{}' has no relation '{}'",
                    model, relation
                ))
            })
    }

    /// Concrete target model of a definition, resolving the polymorphic
    /// discriminator from the source record when needed.
    pub(crate) fn target_model(
        &self,
        def: &RelationDefinition,
        source: &Record,
    ) -> RelationResult<String> {
        match &def.target_model {
            Some(target) => Ok(target.clone()),
            None => {
                let poly = def.polymorphic.as_ref().ok_or_else(|| {
                    RelationError::Configuration(format!(
                        "relation '{}' has neither a target model nor a discriminator",
                        def.name
                    ))
                })?;
                polymorphic::resolve_target(&self.schema, source.get(&poly.discriminator_field))
            }
        }
    }

    /// Identifier of a source record, required by every store-backed
    /// operation.
    pub(crate) fn source_id(
        &self,
        def: &RelationDefinition,
        source: &Record,
    ) -> RelationResult<Value> {
        let id_field = self.schema.id_field(source.model())?;
        source.id_value(&id_field).cloned().ok_or_else(|| {
            RelationError::InvalidReference(format!(
                "source record of relation '{}' has no identifier",
                def.name
            ))
        })
    }

    /// Persist a record's full field map back to the store.
    pub(crate) async fn save_record(&self, record: &Record) -> RelationResult<()> {
        let id_field = self.schema.id_field(record.model())?;
        let id = record.id_value(&id_field).cloned().ok_or_else(|| {
            RelationError::InvalidReference(format!(
                "cannot save a {} record without an identifier",
                record.model()
            ))
        })?;
        let updated = self
            .store
            .update_by_id(record.model(), &id_field, &id, record.fields().clone())
            .await?;
        match updated {
            Some(_) => Ok(()),
            None => Err(RelationError::NotFound {
                model: record.model().to_string(),
                id: id_to_string(&id),
            }),
        }
    }

    pub(crate) fn record_from(&self, model: &str, doc: Document) -> Record {
        Record::new(model.to_string(), doc)
    }

    /// Resolve the named relations of each record and park the results in
    /// its cache slots, so a caller's `include` list comes back eagerly
    /// loaded. Nested loads run with an empty filter; the inner future is
    /// boxed because an included relation may itself resolve relations.
    pub(crate) async fn expand_includes(
        &self,
        records: &mut [Record],
        includes: &[String],
    ) -> RelationResult<()> {
        use std::future::Future;
        use std::pin::Pin;

        for relation in includes {
            for record in records.iter_mut() {
                let binding = self.bind(record.model(), relation)?;
                let load: Pin<
                    Box<dyn Future<Output = RelationResult<CachedRelation>> + '_>,
                > = Box::pin(binding.load(record, Filter::new()));
                load.await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationEngine").finish_non_exhaustive()
    }
}

fn kind_mismatch(relation: &str, expected: &str, actual: RelationKind) -> RelationError {
    RelationError::InvalidReference(format!(
        "relation '{}' is {}, not {}",
        relation,
        actual.as_str(),
        expected
    ))
}

/// Tagged dispatch over the per-kind operation surfaces
#[derive(Debug)]
pub enum Binding<'a> {
    BelongsTo(BelongsToBinding<'a>),
    HasOne(HasOneBinding<'a>),
    HasMany(HasManyBinding<'a>),
    HasManyThrough(HasManyThroughBinding<'a>),
    EmbedsMany(EmbedsManyBinding<'a>),
    ReferencesMany(ReferencesManyBinding<'a>),
}

impl<'a> Binding<'a> {
    pub fn definition(&self) -> &RelationDefinition {
        match self {
            Binding::BelongsTo(b) => b.definition(),
            Binding::HasOne(b) => b.definition(),
            Binding::HasMany(b) => b.definition(),
            Binding::HasManyThrough(b) => b.definition(),
            Binding::EmbedsMany(b) => b.definition(),
            Binding::ReferencesMany(b) => b.definition(),
        }
    }

    pub fn kind(&self) -> RelationKind {
        self.definition().kind
    }

    /// Kind-agnostic resolution entry point for callers driving relations
    /// by name. Singular kinds come back as `One`, plural kinds as `Many`;
    /// the source record's cache slot is refreshed as a side effect.
    pub async fn load(
        &self,
        source: &mut Record,
        filter: Filter,
    ) -> RelationResult<CachedRelation> {
        match self {
            Binding::BelongsTo(b) => Ok(CachedRelation::One(b.load(source, true).await?)),
            Binding::HasOne(b) => Ok(CachedRelation::One(b.load(source, true).await?)),
            Binding::HasMany(b) => Ok(CachedRelation::Many(b.related(source, filter).await?)),
            Binding::HasManyThrough(b) => {
                Ok(CachedRelation::Many(b.related(source, filter).await?))
            }
            Binding::EmbedsMany(b) => Ok(CachedRelation::Many(b.related(source, filter).await?)),
            Binding::ReferencesMany(b) => {
                Ok(CachedRelation::Many(b.related(source, filter).await?))
            }
        }
    }
}

/// A target argument accepted either as a raw identifier or as a full
/// record instance.
#[derive(Debug, Clone)]
pub enum TargetRef {
    Id(Value),
    Record(Record),
}

impl TargetRef {
    /// Identifier of the referenced target.
    pub fn id(&self, id_field: &str) -> RelationResult<Value> {
        match self {
            TargetRef::Id(id) if !id.is_null() => Ok(id.clone()),
            TargetRef::Id(_) => Err(RelationError::InvalidReference(
                "null target identifier".to_string(),
            )),
            TargetRef::Record(record) => {
                record.id_value(id_field).cloned().ok_or_else(|| {
                    RelationError::InvalidReference(format!(
                        "{} record has no identifier",
                        record.model()
                    ))
                })
            }
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            TargetRef::Record(record) => Some(record),
            TargetRef::Id(_) => None,
        }
    }
}

impl From<Value> for TargetRef {
    fn from(id: Value) -> Self {
        TargetRef::Id(id)
    }
}

impl From<Record> for TargetRef {
    fn from(record: Record) -> Self {
        TargetRef::Record(record)
    }
}
