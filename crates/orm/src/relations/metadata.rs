//! Relation metadata - definitions describing one declared association

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RelationError, RelationResult};
use crate::record::Record;
use crate::value::Document;

use super::polymorphic::PolymorphicConfig;
use super::scope::ScopeSpec;

/// The kind of association between two record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// Many-to-one: the foreign key lives on the source
    BelongsTo,
    /// One-to-one: the foreign key lives on the target
    HasOne,
    /// One-to-many: the foreign key lives on the target
    HasMany,
    /// Many-to-many through an explicit join model
    HasManyThrough,
    /// Many-to-many through an auto-declared join model
    HasAndBelongsToMany,
    /// Target records live inside a list property of the source
    EmbedsMany,
    /// The source holds a list of target identifiers
    ReferencesMany,
}

impl RelationKind {
    /// True when the relation resolves to a sequence of records.
    /// Derived from the kind and never stored separately.
    pub fn is_multiple(self) -> bool {
        !matches!(self, Self::BelongsTo | Self::HasOne)
    }

    /// True when the relation is resolved via join rows in a through model.
    pub fn uses_through(self) -> bool {
        matches!(self, Self::HasManyThrough | Self::HasAndBelongsToMany)
    }

    /// True when the through model must be named explicitly at declaration.
    pub fn requires_through(self) -> bool {
        matches!(self, Self::HasManyThrough)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BelongsTo => "belongsTo",
            Self::HasOne => "hasOne",
            Self::HasMany => "hasMany",
            Self::HasManyThrough => "hasManyThrough",
            Self::HasAndBelongsToMany => "hasAndBelongsToMany",
            Self::EmbedsMany => "embedsMany",
            Self::ReferencesMany => "referencesMany",
        }
    }
}

/// Copies fields onto a target document at creation/link time
#[derive(Clone)]
pub enum PropertyMapper {
    /// Static source-field to target-field rename map
    Rename(HashMap<String, String>),
    /// Computed fields derived from the originating record
    Compute(Arc<dyn Fn(&Record) -> Document + Send + Sync>),
}

impl PropertyMapper {
    pub fn rename(pairs: &[(&str, &str)]) -> Self {
        Self::Rename(
            pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        )
    }

    pub fn compute<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Document + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(f))
    }

    /// Stamp mapped fields from `from` onto `data`. Mapped fields win over
    /// caller-supplied values, the same way foreign keys are stamped.
    pub fn apply(&self, from: &Record, data: &mut Document) {
        match self {
            Self::Rename(map) => {
                for (source_field, target_field) in map {
                    if let Some(value) = from.get(source_field) {
                        data.insert(target_field.clone(), value.clone());
                    }
                }
            }
            Self::Compute(f) => {
                for (field, value) in f(from) {
                    data.insert(field, value);
                }
            }
        }
    }
}

impl fmt::Debug for PropertyMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rename(map) => f.debug_tuple("Rename").field(map).finish(),
            Self::Compute(_) => f.debug_tuple("Compute").field(&"<fn>").finish(),
        }
    }
}

/// Recognized per-relation options
#[derive(Debug, Clone, PartialEq)]
pub struct RelationOptions {
    /// Auto-assign identifiers to embedded elements (running max + 1)
    pub auto_id: bool,
    /// Insert new elements/identifiers at the front instead of the back
    pub prepend: bool,
    /// Recursively validate embedded elements on source validation
    pub validate: bool,
    /// Back-reference belongsTo relation name on the embedded model,
    /// enabling the embedsMany link/unlink pattern
    pub belongs_to: Option<String>,
    /// Put the polymorphic discriminator keys on the target side of a
    /// through join row instead of the source side
    pub invert: bool,
}

impl Default for RelationOptions {
    fn default() -> Self {
        Self {
            auto_id: true,
            prepend: false,
            validate: false,
            belongs_to: None,
            invert: false,
        }
    }
}

/// Declaration-time configuration for one relation
#[derive(Debug, Clone, Default)]
pub struct RelationConfig {
    pub target: Option<String>,
    pub through: Option<String>,
    pub foreign_key: Option<String>,
    /// Storage property for embedded/reference lists
    pub property: Option<String>,
    /// Polymorphic "as" name; derives `<as>_id` / `<as>_type`
    pub polymorphic_as: Option<String>,
    pub scope: Option<ScopeSpec>,
    pub mapper: Option<PropertyMapper>,
    pub options: RelationOptions,
}

impl RelationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, model: &str) -> Self {
        self.target = Some(model.to_string());
        self
    }

    pub fn through(mut self, model: &str) -> Self {
        self.through = Some(model.to_string());
        self
    }

    pub fn foreign_key(mut self, key: &str) -> Self {
        self.foreign_key = Some(key.to_string());
        self
    }

    pub fn property(mut self, name: &str) -> Self {
        self.property = Some(name.to_string());
        self
    }

    pub fn polymorphic_as(mut self, name: &str) -> Self {
        self.polymorphic_as = Some(name.to_string());
        self
    }

    pub fn scope(mut self, scope: ScopeSpec) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn mapper(mut self, mapper: PropertyMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn auto_id(mut self, auto_id: bool) -> Self {
        self.options.auto_id = auto_id;
        self
    }

    pub fn prepend(mut self, prepend: bool) -> Self {
        self.options.prepend = prepend;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.options.validate = validate;
        self
    }

    pub fn belongs_to_link(mut self, relation: &str) -> Self {
        self.options.belongs_to = Some(relation.to_string());
        self
    }

    pub fn invert(mut self, invert: bool) -> Self {
        self.options.invert = invert;
        self
    }
}

/// Immutable description of one declared association.
///
/// Created at declaration time, registered in the source model's relation
/// registry, and shared (`Arc`) with every binding. Never mutated after
/// registration.
#[derive(Debug, Clone)]
pub struct RelationDefinition {
    /// Relation name, unique per source model
    pub name: String,
    /// Accessor name exposed to callers; defaults to the relation name
    pub accessor_name: String,
    pub kind: RelationKind,
    pub source_model: String,
    /// Concrete target model; `None` for polymorphic belongsTo, where the
    /// discriminator resolves it at call time
    pub target_model: Option<String>,
    pub through_model: Option<String>,
    /// Key on the source side (foreign key for belongsTo, source id for
    /// has-relations, storage property for embedded/reference lists)
    pub key_from: String,
    /// Key on the target side; empty when discovered at bind time
    pub key_to: String,
    /// Key into the through model, when not discovered by scanning
    pub key_through: Option<String>,
    pub polymorphic: Option<PolymorphicConfig>,
    pub scope: Option<ScopeSpec>,
    pub mapper: Option<PropertyMapper>,
    pub options: RelationOptions,
}

impl RelationDefinition {
    pub fn new(kind: RelationKind, name: &str, source_model: &str) -> Self {
        Self {
            name: name.to_string(),
            accessor_name: name.to_string(),
            kind,
            source_model: source_model.to_string(),
            target_model: None,
            through_model: None,
            key_from: String::new(),
            key_to: String::new(),
            key_through: None,
            polymorphic: None,
            scope: None,
            mapper: None,
            options: RelationOptions::default(),
        }
    }

    /// True when the relation resolves to a sequence of records.
    pub fn is_multiple(&self) -> bool {
        self.kind.is_multiple()
    }

    /// Check declaration invariants.
    pub fn validate(&self) -> RelationResult<()> {
        if self.name.is_empty() || self.source_model.is_empty() {
            return Err(RelationError::Configuration(
                "relation requires a name and a source model".to_string(),
            ));
        }
        if self.kind.requires_through() && self.through_model.is_none() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' of kind {} requires a through model",
                self.name,
                self.kind.as_str()
            )));
        }
        if !self.kind.uses_through() && self.through_model.is_some() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' of kind {} does not take a through model",
                self.name,
                self.kind.as_str()
            )));
        }
        match self.kind {
            RelationKind::BelongsTo => {
                // the discriminator and an explicit target are mutually
                // exclusive; one resolves the other at call time
                if self.polymorphic.is_some() && self.target_model.is_some() {
                    return Err(RelationError::Configuration(format!(
                        "belongsTo relation '{}' cannot name both a target model and a discriminator",
                        self.name
                    )));
                }
                if self.polymorphic.is_none() && self.target_model.is_none() {
                    return Err(RelationError::Configuration(format!(
                        "belongsTo relation '{}' requires a target model or a discriminator",
                        self.name
                    )));
                }
            }
            _ => {
                if self.target_model.is_none() {
                    return Err(RelationError::Configuration(format!(
                        "relation '{}' of kind {} requires a target model",
                        self.name,
                        self.kind.as_str()
                    )));
                }
            }
        }
        if self.key_from.is_empty() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' has no source-side key",
                self.name
            )));
        }
        if self.key_to.is_empty() && !self.kind.uses_through() && self.polymorphic.is_none() {
            return Err(RelationError::Configuration(format!(
                "relation '{}' has no target-side key",
                self.name
            )));
        }
        Ok(())
    }
}

/// snake_case form of a model name, used for derived key and relation names
pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_predicates() {
        assert!(!RelationKind::BelongsTo.is_multiple());
        assert!(!RelationKind::HasOne.is_multiple());
        assert!(RelationKind::HasMany.is_multiple());
        assert!(RelationKind::EmbedsMany.is_multiple());
        assert!(RelationKind::HasManyThrough.requires_through());
        assert!(!RelationKind::HasAndBelongsToMany.requires_through());
        assert!(RelationKind::HasAndBelongsToMany.uses_through());
    }

    #[test]
    fn test_through_invariant() {
        let mut def = RelationDefinition::new(RelationKind::HasManyThrough, "patients", "Physician");
        def.target_model = Some("Patient".to_string());
        def.key_from = "id".to_string();
        assert!(def.validate().is_err());

        def.through_model = Some("Appointment".to_string());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_polymorphic_target_exclusivity() {
        let mut def = RelationDefinition::new(RelationKind::BelongsTo, "imageable", "Picture");
        def.key_from = "imageable_id".to_string();
        def.polymorphic = Some(PolymorphicConfig::from_as("imageable"));
        assert!(def.validate().is_ok());

        def.target_model = Some("Author".to_string());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_property_mapper_rename() {
        let mapper = PropertyMapper::rename(&[("name", "owner_name")]);
        let source = Record::new(
            "User",
            json!({"name": "ada"}).as_object().cloned().unwrap(),
        );
        let mut data = Document::new();
        data.insert("title".to_string(), json!("post"));
        mapper.apply(&source, &mut data);
        assert_eq!(data.get("owner_name"), Some(&json!("ada")));
        assert_eq!(data.get("title"), Some(&json!("post")));
    }

    #[test]
    fn test_property_mapper_compute() {
        let mapper = PropertyMapper::compute(|record| {
            let mut extra = Document::new();
            extra.insert("source_model".to_string(), json!(record.model()));
            extra
        });
        let source = Record::empty("User");
        let mut data = Document::new();
        mapper.apply(&source, &mut data);
        assert_eq!(data.get("source_model"), Some(&json!("User")));
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("User"), "user");
        assert_eq!(snake_case("BlogPost"), "blog_post");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }
}
