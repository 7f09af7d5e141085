//! Polymorphic discriminator configuration and runtime type resolution
//!
//! A polymorphic association stores, next to the foreign key, a
//! discriminator field naming the model the key points at. The naming
//! convention is deterministic: an "as" name of `imageable` yields the
//! columns `imageable_id` and `imageable_type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelationError, RelationResult};
use crate::schema::Schema;

/// Discriminator configuration for one polymorphic association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicConfig {
    /// The association's "as" name
    pub as_name: String,
    /// Field holding the target identifier (`<as>_id`)
    pub foreign_key: String,
    /// Field holding the target model name (`<as>_type`)
    pub discriminator_field: String,
}

impl PolymorphicConfig {
    /// Derive both field names from the "as" name.
    pub fn from_as(as_name: &str) -> Self {
        Self {
            as_name: as_name.to_string(),
            foreign_key: format!("{}_id", as_name),
            discriminator_field: format!("{}_type", as_name),
        }
    }

    /// Explicit field names, for schemas that predate the convention.
    pub fn explicit(as_name: &str, foreign_key: &str, discriminator_field: &str) -> Self {
        Self {
            as_name: as_name.to_string(),
            foreign_key: foreign_key.to_string(),
            discriminator_field: discriminator_field.to_string(),
        }
    }
}

/// Resolve a discriminator value to the canonical name of a registered
/// model. Lookup is case-insensitive; an absent, empty, or unmapped value
/// is a configuration error surfaced before any storage call.
pub fn resolve_target(schema: &Schema, discriminator: Option<&Value>) -> RelationResult<String> {
    let name = discriminator
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            RelationError::UnresolvedPolymorphicType("<missing discriminator>".to_string())
        })?;
    schema
        .resolve_model(name)
        .ok_or_else(|| RelationError::UnresolvedPolymorphicType(name.to_string()))
}
