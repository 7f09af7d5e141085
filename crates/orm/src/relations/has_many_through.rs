//! HasManyThrough operations
//!
//! Many-to-many resolution via join rows in a through model. The two
//! join-side foreign keys are discovered at bind time by scanning the
//! through model's declared belongsTo relations (one pointing at the
//! source, one at the target), or taken from the discriminator-derived
//! keys when the through association is polymorphic.
//!
//! hasAndBelongsToMany is a declaration-time convenience over this
//! binding; by the time a binding exists the two kinds are identical.

use serde_json::Value;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{RelationError, RelationResult};
use crate::filter::{Filter, Where};
use crate::record::Record;
use crate::value::{id_to_string, Document};

use super::binding::{RelationEngine, TargetRef};
use super::metadata::RelationDefinition;
use super::scope::apply_scope;

/// Join-side keys discovered at bind time
#[derive(Debug, Clone)]
struct ThroughKeys {
    through: String,
    /// Foreign key on the join row pointing at the source
    source_fk: String,
    /// Foreign key on the join row pointing at the target
    target_fk: String,
    target: String,
    target_id_field: String,
    /// Discriminator field stamped on join rows of a polymorphic through,
    /// paired with the model name it must hold: the source model normally,
    /// the target model when the declaration is inverted
    discriminator: Option<(String, String)>,
}

#[derive(Debug)]
pub struct HasManyThroughBinding<'a> {
    engine: &'a RelationEngine,
    def: Arc<RelationDefinition>,
}

impl<'a> HasManyThroughBinding<'a> {
    pub(crate) fn new(engine: &'a RelationEngine, def: Arc<RelationDefinition>) -> Self {
        Self { engine, def }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.def
    }

    /// Fetch related targets by resolving join rows first, refreshing the
    /// cache slot with the result.
    pub async fn related(&self, source: &mut Record, mut filter: Filter) -> RelationResult<Vec<Record>> {
        let keys = self.keys()?;
        let source_id = self.engine.source_id(&self.def, source)?;
        debug!(relation = %self.def.name, through = %keys.through, "loading through relation");

        let join_filter = Filter {
            where_clause: self.join_where(&keys, &source_id, None),
            ..Filter::default()
        };
        let join_rows = self.engine.store().find(&keys.through, &join_filter).await?;
        let target_ids: Vec<Value> = join_rows
            .iter()
            .filter_map(|row| row.get(&keys.target_fk))
            .filter(|v| !v.is_null())
            .cloned()
            .collect();
        if target_ids.is_empty() {
            source.cache_many(&self.def.name, Vec::new());
            return Ok(Vec::new());
        }

        filter
            .where_clause
            .and_inq(&keys.target_id_field, target_ids);
        apply_scope(&self.def, source, &mut filter);
        let docs = self.engine.store().find(&keys.target, &filter).await?;
        let mut records: Vec<Record> = docs
            .into_iter()
            .map(|doc| self.engine.record_from(&keys.target, doc))
            .collect();
        if !filter.include.is_empty() {
            self.engine
                .expand_includes(&mut records, &filter.include)
                .await?;
        }
        source.cache_many(&self.def.name, records.clone());
        Ok(records)
    }

    /// Whether a join row links the source to the given target.
    pub async fn exists(&self, source: &Record, target: &TargetRef) -> RelationResult<bool> {
        let keys = self.keys()?;
        let source_id = self.engine.source_id(&self.def, source)?;
        let target_id = target.id(&keys.target_id_field)?;
        let condition = self.join_where(&keys, &source_id, Some(&target_id));
        Ok(self.engine.store().count(&keys.through, &condition).await? > 0)
    }

    /// Link the source to a target: find-or-create the join row for the
    /// pair, applying the property mapper and any extra join-row fields.
    /// A full target instance is upserted into the cache slot.
    pub async fn add(
        &self,
        source: &mut Record,
        target: TargetRef,
        extra: Document,
    ) -> RelationResult<Record> {
        let keys = self.keys()?;
        let source_id = self.engine.source_id(&self.def, source)?;
        let target_id = target.id(&keys.target_id_field)?;

        let condition = self.join_where(&keys, &source_id, Some(&target_id));
        let mut data: Document = condition.conditions().clone();
        for (field, value) in extra {
            data.insert(field, value);
        }
        if let Some(mapper) = &self.def.mapper {
            mapper.apply(source, &mut data);
        }

        let join_id_field = self.engine.schema().id_field(&keys.through)?;
        let filter = Filter {
            where_clause: condition,
            ..Filter::default()
        };
        let (join_row, created) = self
            .engine
            .store()
            .find_or_create(&keys.through, &join_id_field, &filter, data)
            .await?;
        debug!(relation = %self.def.name, created, "linked through pair");

        if let Some(record) = target.record() {
            source.add_to_cache(&self.def.name, record.clone(), &keys.target_id_field);
        }
        Ok(self.engine.record_from(&keys.through, join_row))
    }

    /// Unlink the source from a target by deleting matching join rows and
    /// evicting the target from the cache slot. Absent pairs are a no-op.
    pub async fn remove(&self, source: &mut Record, target: &TargetRef) -> RelationResult<()> {
        let keys = self.keys()?;
        let source_id = self.engine.source_id(&self.def, source)?;
        let target_id = target.id(&keys.target_id_field)?;
        let condition = self.join_where(&keys, &source_id, Some(&target_id));
        self.engine.store().delete_where(&keys.through, &condition).await?;
        source.remove_from_cache(&self.def.name, &target_id, &keys.target_id_field);
        Ok(())
    }

    /// Create a new target and link it. A failed join-row insert triggers
    /// best-effort deletion of the just-created target; a failure during
    /// compensation is logged, not reported, and the join error wins. The
    /// sequence is not atomic.
    pub async fn create(&self, source: &mut Record, data: Document) -> RelationResult<Record> {
        let keys = self.keys()?;
        let created = self
            .engine
            .store()
            .insert(&keys.target, &keys.target_id_field, data)
            .await?;
        let record = self.engine.record_from(&keys.target, created);

        let linked = self
            .add(source, TargetRef::Record(record.clone()), Document::new())
            .await;
        if let Err(join_error) = linked {
            if let Some(id) = record.id_value(&keys.target_id_field) {
                if let Err(cleanup) = self
                    .engine
                    .store()
                    .delete_by_id(&keys.target, &keys.target_id_field, id)
                    .await
                {
                    warn!(
                        relation = %self.def.name,
                        error = %cleanup,
                        "failed to delete target after join-row failure"
                    );
                }
            }
            source.remove_from_cache(
                &self.def.name,
                record.id_value(&keys.target_id_field).unwrap_or(&Value::Null),
                &keys.target_id_field,
            );
            return Err(join_error);
        }
        Ok(record)
    }

    /// Fetch one linked target by identifier. A missing join row is
    /// `NoSuchAssociation`; a missing target behind an existing join row
    /// is `NotFound`.
    pub async fn find_by_id(&self, source: &Record, id: &Value) -> RelationResult<Record> {
        let keys = self.keys()?;
        self.require_association(source, &keys, id).await?;
        let doc = self
            .engine
            .store()
            .find_by_id(&keys.target, &keys.target_id_field, id)
            .await?
            .ok_or_else(|| RelationError::NotFound {
                model: keys.target.clone(),
                id: id_to_string(id),
            })?;
        Ok(self.engine.record_from(&keys.target, doc))
    }

    /// Delete one linked target and its join rows, evicting it from the
    /// cache slot. A missing join row is `NoSuchAssociation`.
    pub async fn destroy_by_id(&self, source: &mut Record, id: &Value) -> RelationResult<()> {
        let keys = self.keys()?;
        self.require_association(source, &keys, id).await?;
        let source_id = self.engine.source_id(&self.def, source)?;
        let condition = self.join_where(&keys, &source_id, Some(id));
        self.engine.store().delete_where(&keys.through, &condition).await?;
        self.engine
            .store()
            .delete_by_id(&keys.target, &keys.target_id_field, id)
            .await?;
        source.remove_from_cache(&self.def.name, id, &keys.target_id_field);
        Ok(())
    }

    async fn require_association(
        &self,
        source: &Record,
        keys: &ThroughKeys,
        id: &Value,
    ) -> RelationResult<()> {
        let source_id = self.engine.source_id(&self.def, source)?;
        let condition = self.join_where(keys, &source_id, Some(id));
        if self.engine.store().count(&keys.through, &condition).await? == 0 {
            return Err(RelationError::NoSuchAssociation {
                relation: self.def.name.clone(),
                id: id_to_string(id),
            });
        }
        Ok(())
    }

    fn join_where(
        &self,
        keys: &ThroughKeys,
        source_id: &Value,
        target_id: Option<&Value>,
    ) -> Where {
        let mut condition = Where::new();
        condition.and_eq(&keys.source_fk, source_id.clone());
        if let Some((field, model)) = &keys.discriminator {
            condition.and_eq(field, Value::String(model.clone()));
        }
        if let Some(target_id) = target_id {
            condition.and_eq(&keys.target_fk, target_id.clone());
        }
        condition
    }

    /// Discover the join-side keys for this binding.
    fn keys(&self) -> RelationResult<ThroughKeys> {
        let through = self.def.through_model.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "relation '{}' has no through model",
                self.def.name
            ))
        })?;
        let target = self.def.target_model.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "relation '{}' has no target model",
                self.def.name
            ))
        })?;
        let registry = self.engine.schema().relations();
        let scan_side = |pointee: &str| {
            registry.find_belongs_to(&through, pointee).ok_or_else(|| {
                RelationError::InvalidReference(format!(
                    "through model '{}' declares no belongsTo pointing at '{}'",
                    through, pointee
                ))
            })
        };

        // an inverted polymorphic declaration puts the discriminator keys
        // on the target side of the join row instead of the source side
        let (source_fk, target_fk, discriminator) = match &self.def.polymorphic {
            Some(poly) if self.def.options.invert => {
                let side = scan_side(&self.def.source_model)?;
                (
                    side.key_from.clone(),
                    poly.foreign_key.clone(),
                    Some((poly.discriminator_field.clone(), target.clone())),
                )
            }
            Some(poly) => {
                let target_fk = match &self.def.key_through {
                    Some(key) => key.clone(),
                    None => scan_side(&target)?.key_from.clone(),
                };
                (
                    poly.foreign_key.clone(),
                    target_fk,
                    Some((
                        poly.discriminator_field.clone(),
                        self.def.source_model.clone(),
                    )),
                )
            }
            None => {
                let source_fk = scan_side(&self.def.source_model)?.key_from.clone();
                let target_fk = match &self.def.key_through {
                    Some(key) => key.clone(),
                    None => scan_side(&target)?.key_from.clone(),
                };
                (source_fk, target_fk, None)
            }
        };

        let target_id_field = self.engine.schema().id_field(&target)?;
        Ok(ThroughKeys {
            through,
            source_fk,
            target_fk,
            target,
            target_id_field,
            discriminator,
        })
    }
}
