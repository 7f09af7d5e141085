//! Schema - model definitions, validators, and relation declaration
//!
//! A `Schema` owns everything that in older designs lived in process-wide
//! registries: model definitions (with their identifier field names and
//! validators) and the relation registry. It is passed explicitly into
//! every declaration and resolution call, so its lifecycle is the caller's.
//!
//! Declaration order matters only in one way: a relation's target (and
//! through) models must be defined before the relation that names them.

use dashmap::DashMap;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelationError, RelationResult};
use crate::record::Record;
use crate::relations::metadata::{
    snake_case, RelationConfig, RelationDefinition, RelationKind,
};
use crate::relations::polymorphic::PolymorphicConfig;
use crate::relations::registry::RelationRegistry;
use crate::validation::{ValidationErrors, Validator};

/// Definition of one record type
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub name: String,
    /// Identifier field name, `id` by default
    pub id_field: String,
    pub validators: Vec<Validator>,
}

/// Registry of model definitions and declared relations
#[derive(Debug, Default)]
pub struct Schema {
    models: DashMap<String, ModelDefinition>,
    relations: RelationRegistry,
}

impl Schema {
    pub fn new() -> Self {
        Self {
            models: DashMap::new(),
            relations: RelationRegistry::new(),
        }
    }

    /// Define a model with the default `id` identifier field. Re-defining
    /// an existing model keeps the existing definition.
    pub fn define_model(&self, name: &str) {
        self.define_model_with_id(name, "id");
    }

    /// Define a model with an explicit identifier field name.
    pub fn define_model_with_id(&self, name: &str, id_field: &str) {
        self.models
            .entry(name.to_string())
            .or_insert_with(|| ModelDefinition {
                name: name.to_string(),
                id_field: id_field.to_string(),
                validators: Vec::new(),
            });
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Identifier field name of a model.
    pub fn id_field(&self, model: &str) -> RelationResult<String> {
        self.models
            .get(model)
            .map(|def| def.id_field.clone())
            .ok_or_else(|| {
                RelationError::Configuration(format!("model '{}' is not defined", model))
            })
    }

    /// Case-insensitive lookup returning the canonical model name.
    pub fn resolve_model(&self, name: &str) -> Option<String> {
        if self.models.contains_key(name) {
            return Some(name.to_string());
        }
        self.models
            .iter()
            .map(|entry| entry.key().clone())
            .find(|key| key.eq_ignore_ascii_case(name))
    }

    /// Attach a validator to a model.
    pub fn add_validator(&self, model: &str, validator: Validator) -> RelationResult<()> {
        let mut entry = self.models.get_mut(model).ok_or_else(|| {
            RelationError::Configuration(format!("model '{}' is not defined", model))
        })?;
        entry.validators.push(validator);
        Ok(())
    }

    pub fn validators(&self, model: &str) -> Vec<Validator> {
        self.models
            .get(model)
            .map(|def| def.validators.clone())
            .unwrap_or_default()
    }

    /// Run a record's model validators, accumulating failures.
    pub fn collect_errors(&self, record: &Record) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for validator in self.validators(record.model()) {
            validator.run(record, self, &mut errors);
        }
        errors
    }

    pub fn relations(&self) -> &RelationRegistry {
        &self.relations
    }

    // --- relation declaration ---

    /// Declare a belongsTo relation: the foreign key lives on `source` and
    /// points at the target's identifier. A polymorphic declaration names
    /// no target; the discriminator field resolves it at call time.
    pub fn belongs_to(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let mut def = RelationDefinition::new(RelationKind::BelongsTo, name, source);
        if let Some(as_name) = &config.polymorphic_as {
            let poly = PolymorphicConfig::from_as(as_name);
            def.key_from = config
                .foreign_key
                .clone()
                .unwrap_or_else(|| poly.foreign_key.clone());
            def.polymorphic = Some(poly);
        } else {
            let target = config.target.clone().ok_or_else(|| {
                RelationError::Configuration(format!(
                    "belongsTo relation '{}' requires a target model or a polymorphic name",
                    name
                ))
            })?;
            self.require_model(&target)?;
            def.key_to = self.id_field(&target)?;
            def.key_from = config
                .foreign_key
                .clone()
                .unwrap_or_else(|| format!("{}_id", name));
            def.target_model = Some(target);
        }
        self.finish(def, config)
    }

    /// Declare a hasOne relation: at most one target holds the source's
    /// identifier in its foreign key.
    pub fn has_one(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.declare_has(RelationKind::HasOne, source, name, config)
    }

    /// Declare a hasMany relation.
    pub fn has_many(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        if config.through.is_some() {
            return self.has_many_through(source, name, config);
        }
        self.declare_has(RelationKind::HasMany, source, name, config)
    }

    /// Declare a many-to-many relation resolved through an explicit join
    /// model. The join-side foreign keys are discovered at bind time from
    /// the through model's belongsTo relations.
    pub fn has_many_through(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let target = config.target.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "hasMany through relation '{}' requires a target model",
                name
            ))
        })?;
        self.require_model(&target)?;
        let through = config.through.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "hasMany through relation '{}' requires a through model",
                name
            ))
        })?;
        self.require_model(&through)?;

        let mut def = RelationDefinition::new(RelationKind::HasManyThrough, name, source);
        def.key_from = self.id_field(source)?;
        def.target_model = Some(target);
        def.through_model = Some(through);
        def.key_through = config.foreign_key.clone();
        if let Some(as_name) = &config.polymorphic_as {
            def.polymorphic = Some(PolymorphicConfig::from_as(as_name));
        }
        self.finish(def, config)
    }

    /// Declare a many-to-many relation with an auto-declared join model.
    /// The join model (named from the two sides, alphabetically) and its
    /// two belongsTo relations are created when absent, then resolution
    /// delegates to the through machinery.
    pub fn has_and_belongs_to_many(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let target = config.target.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "hasAndBelongsToMany relation '{}' requires a target model",
                name
            ))
        })?;
        self.require_model(&target)?;

        let join_model = config.through.clone().unwrap_or_else(|| {
            let mut sides = [source, target.as_str()];
            sides.sort_unstable();
            format!("{}{}", sides[0], sides[1])
        });
        if !self.has_model(&join_model) {
            debug!(join_model = %join_model, "declaring join model");
            self.define_model(&join_model);
        }
        for side in [source, target.as_str()] {
            let side_relation = snake_case(side);
            if !self.relations.has_relation(&join_model, &side_relation) {
                self.belongs_to(
                    &join_model,
                    &side_relation,
                    RelationConfig::new().target(side),
                )?;
            }
        }

        let mut def = RelationDefinition::new(RelationKind::HasAndBelongsToMany, name, source);
        def.key_from = self.id_field(source)?;
        def.target_model = Some(target);
        def.through_model = Some(join_model);
        self.finish(def, config)
    }

    /// Declare an embedsMany relation: target records live as an ordered
    /// list inside a property of the source record. Registers an
    /// embedded-identifier uniqueness validator on the source, an
    /// identifier presence validator on the embedded model when auto-id is
    /// disabled, and optionally a recursive element validator.
    pub fn embeds_many(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let target = config.target.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "embedsMany relation '{}' requires an embedded model",
                name
            ))
        })?;
        self.require_model(&target)?;
        let property = config.property.clone().unwrap_or_else(|| name.to_string());
        let id_field = self.id_field(&target)?;

        let mut def = RelationDefinition::new(RelationKind::EmbedsMany, name, source);
        def.key_from = property.clone();
        def.key_to = id_field.clone();
        def.target_model = Some(target.clone());
        let def = self.finish(def, config)?;

        self.add_validator(
            source,
            Validator::UniqueEmbeddedIds {
                property: property.clone(),
                id_field: id_field.clone(),
            },
        )?;
        if !def.options.auto_id {
            self.add_validator(&target, Validator::PresenceOf { field: id_field })?;
        }
        if def.options.validate {
            self.add_validator(
                source,
                Validator::ValidEmbedded {
                    property,
                    model: target,
                },
            )?;
        }
        Ok(def)
    }

    /// Declare a referencesMany relation: the source holds an ordered list
    /// of target identifiers. Registers a uniqueness validator over the
    /// identifier list.
    pub fn references_many(
        &self,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let target = config.target.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "referencesMany relation '{}' requires a target model",
                name
            ))
        })?;
        self.require_model(&target)?;
        let property = config
            .property
            .clone()
            .unwrap_or_else(|| format!("{}_ids", snake_case(&target)));

        let mut def = RelationDefinition::new(RelationKind::ReferencesMany, name, source);
        def.key_from = property.clone();
        def.key_to = self.id_field(&target)?;
        def.target_model = Some(target);
        let def = self.finish(def, config)?;

        self.add_validator(source, Validator::UniqueReferenceIds { property })?;
        Ok(def)
    }

    fn declare_has(
        &self,
        kind: RelationKind,
        source: &str,
        name: &str,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        self.require_model(source)?;
        let target = config.target.clone().ok_or_else(|| {
            RelationError::Configuration(format!(
                "{} relation '{}' requires a target model",
                kind.as_str(),
                name
            ))
        })?;
        self.require_model(&target)?;

        let mut def = RelationDefinition::new(kind, name, source);
        def.key_from = self.id_field(source)?;
        def.target_model = Some(target);
        if let Some(as_name) = &config.polymorphic_as {
            let poly = PolymorphicConfig::from_as(as_name);
            def.key_to = config
                .foreign_key
                .clone()
                .unwrap_or_else(|| poly.foreign_key.clone());
            def.polymorphic = Some(poly);
        } else {
            def.key_to = config
                .foreign_key
                .clone()
                .unwrap_or_else(|| format!("{}_id", snake_case(source)));
        }
        self.finish(def, config)
    }

    fn finish(
        &self,
        mut def: RelationDefinition,
        config: RelationConfig,
    ) -> RelationResult<Arc<RelationDefinition>> {
        def.scope = config.scope;
        def.mapper = config.mapper;
        def.options = config.options;
        debug!(
            source = %def.source_model,
            relation = %def.name,
            kind = def.kind.as_str(),
            "registering relation"
        );
        self.relations.register(def)
    }

    fn require_model(&self, model: &str) -> RelationResult<()> {
        if self.has_model(model) {
            Ok(())
        } else {
            Err(RelationError::Configuration(format!(
                "model '{}' is not defined",
                model
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with(models: &[&str]) -> Schema {
        let schema = Schema::new();
        for model in models {
            schema.define_model(model);
        }
        schema
    }

    #[test]
    fn test_model_definition_and_id_field() {
        let schema = Schema::new();
        schema.define_model("User");
        schema.define_model_with_id("Session", "token");

        assert_eq!(schema.id_field("User").unwrap(), "id");
        assert_eq!(schema.id_field("Session").unwrap(), "token");
        assert!(schema.id_field("Missing").is_err());
    }

    #[test]
    fn test_resolve_model_case_insensitive() {
        let schema = schema_with(&["BlogPost"]);
        assert_eq!(schema.resolve_model("blogpost"), Some("BlogPost".to_string()));
        assert_eq!(schema.resolve_model("BlogPost"), Some("BlogPost".to_string()));
        assert!(schema.resolve_model("Widget").is_none());
    }

    #[test]
    fn test_belongs_to_defaults() {
        let schema = schema_with(&["User", "Post"]);
        let def = schema
            .belongs_to("Post", "author", RelationConfig::new().target("User"))
            .unwrap();
        assert_eq!(def.key_from, "author_id");
        assert_eq!(def.key_to, "id");
        assert_eq!(def.target_model.as_deref(), Some("User"));
    }

    #[test]
    fn test_polymorphic_belongs_to_has_no_target() {
        let schema = schema_with(&["Picture"]);
        let def = schema
            .belongs_to(
                "Picture",
                "imageable",
                RelationConfig::new().polymorphic_as("imageable"),
            )
            .unwrap();
        assert!(def.target_model.is_none());
        assert_eq!(def.key_from, "imageable_id");
        let poly = def.polymorphic.as_ref().unwrap();
        assert_eq!(poly.discriminator_field, "imageable_type");
    }

    #[test]
    fn test_has_many_derives_foreign_key_from_source() {
        let schema = schema_with(&["BlogPost", "Comment"]);
        let def = schema
            .has_many("BlogPost", "comments", RelationConfig::new().target("Comment"))
            .unwrap();
        assert_eq!(def.key_from, "id");
        assert_eq!(def.key_to, "blog_post_id");
    }

    #[test]
    fn test_has_many_with_through_routes_to_through_kind() {
        let schema = schema_with(&["Physician", "Patient", "Appointment"]);
        schema
            .belongs_to(
                "Appointment",
                "physician",
                RelationConfig::new().target("Physician"),
            )
            .unwrap();
        schema
            .belongs_to(
                "Appointment",
                "patient",
                RelationConfig::new().target("Patient"),
            )
            .unwrap();
        let def = schema
            .has_many(
                "Physician",
                "patients",
                RelationConfig::new().target("Patient").through("Appointment"),
            )
            .unwrap();
        assert_eq!(def.kind, RelationKind::HasManyThrough);
        assert_eq!(def.through_model.as_deref(), Some("Appointment"));
    }

    #[test]
    fn test_habtm_declares_join_model_and_sides() {
        let schema = schema_with(&["User", "Group"]);
        let def = schema
            .has_and_belongs_to_many("User", "groups", RelationConfig::new().target("Group"))
            .unwrap();

        assert_eq!(def.through_model.as_deref(), Some("GroupUser"));
        assert!(schema.has_model("GroupUser"));
        let user_side = schema.relations().find_belongs_to("GroupUser", "User").unwrap();
        assert_eq!(user_side.key_from, "user_id");
        let group_side = schema.relations().find_belongs_to("GroupUser", "Group").unwrap();
        assert_eq!(group_side.key_from, "group_id");
    }

    #[test]
    fn test_embeds_many_registers_validators() {
        let schema = schema_with(&["Person", "EmailAddress"]);
        schema
            .embeds_many(
                "Person",
                "emails",
                RelationConfig::new().target("EmailAddress").auto_id(false),
            )
            .unwrap();

        let person_validators = schema.validators("Person");
        assert!(person_validators
            .iter()
            .any(|v| matches!(v, Validator::UniqueEmbeddedIds { .. })));
        let email_validators = schema.validators("EmailAddress");
        assert!(email_validators
            .iter()
            .any(|v| matches!(v, Validator::PresenceOf { field } if field == "id")));
    }

    #[test]
    fn test_references_many_default_property() {
        let schema = schema_with(&["Post", "Tag"]);
        let def = schema
            .references_many("Post", "tags", RelationConfig::new().target("Tag"))
            .unwrap();
        assert_eq!(def.key_from, "tag_ids");
        assert!(schema
            .validators("Post")
            .iter()
            .any(|v| matches!(v, Validator::UniqueReferenceIds { .. })));
    }

    #[test]
    fn test_relation_requires_defined_models() {
        let schema = schema_with(&["Post"]);
        let err = schema
            .belongs_to("Post", "author", RelationConfig::new().target("User"))
            .unwrap_err();
        assert!(matches!(err, RelationError::Configuration(_)));
    }
}
