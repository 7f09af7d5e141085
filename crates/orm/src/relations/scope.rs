//! Scope filter merging
//!
//! A relation may declare a scope: extra query conditions, ordering, or
//! field selection applied automatically whenever the relation is
//! resolved. Scopes are merged into the caller's filter without clobbering
//! what the caller supplied; conflicting where keys are and-combined and
//! caller ordering/paging wins.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::filter::Filter;
use crate::record::Record;

use super::metadata::{RelationDefinition, RelationKind};

/// Static or computed extra filter conditions for a relation
#[derive(Clone)]
pub enum ScopeSpec {
    /// Fixed partial filter merged on every resolution
    Static(Filter),
    /// Computed from the source instance and the filter built so far.
    /// Returning `None` means "no additional constraint".
    Dynamic(Arc<dyn Fn(&Record, &Filter) -> Option<Filter> + Send + Sync>),
}

impl ScopeSpec {
    pub fn fixed(filter: Filter) -> Self {
        Self::Static(filter)
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Record, &Filter) -> Option<Filter> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }
}

impl fmt::Debug for ScopeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(filter) => f.debug_tuple("Static").field(filter).finish(),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").field(&"<fn>").finish(),
        }
    }
}

/// Augment a filter with the relation's implicit conditions: the
/// polymorphic discriminator equality (when the discriminator lives on the
/// target side) and the declared scope.
pub fn apply_scope(def: &RelationDefinition, source: &Record, filter: &mut Filter) {
    if let Some(poly) = &def.polymorphic {
        if matches!(def.kind, RelationKind::HasOne | RelationKind::HasMany) {
            filter.where_clause.and_eq(
                &poly.discriminator_field,
                Value::String(source.model().to_string()),
            );
        }
    }
    match &def.scope {
        Some(ScopeSpec::Static(scope)) => filter.merge(scope),
        Some(ScopeSpec::Dynamic(f)) => {
            if let Some(scope) = f(source, filter) {
                filter.merge(&scope);
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::polymorphic::PolymorphicConfig;
    use serde_json::json;

    fn has_many_def(name: &str) -> RelationDefinition {
        let mut def = RelationDefinition::new(RelationKind::HasMany, name, "User");
        def.target_model = Some("Post".to_string());
        def.key_from = "id".to_string();
        def.key_to = "user_id".to_string();
        def
    }

    #[test]
    fn test_static_scope_merges_conditions() {
        let mut def = has_many_def("published_posts");
        def.scope = Some(ScopeSpec::fixed(Filter::where_eq(
            "status",
            json!("published"),
        )));

        let source = Record::empty("User");
        let mut filter = Filter::new();
        apply_scope(&def, &source, &mut filter);
        assert_eq!(filter.where_clause.get("status"), Some(&json!("published")));
    }

    #[test]
    fn test_dynamic_scope_can_decline() {
        let mut def = has_many_def("posts");
        def.scope = Some(ScopeSpec::computed(|_, _| None));

        let source = Record::empty("User");
        let mut filter = Filter::new();
        apply_scope(&def, &source, &mut filter);
        assert!(filter.where_clause.is_empty());
    }

    #[test]
    fn test_dynamic_scope_sees_source_instance() {
        let mut def = has_many_def("posts");
        def.scope = Some(ScopeSpec::computed(|source, _| {
            Some(Filter::where_eq(
                "tenant",
                source.get("tenant").cloned().unwrap_or(Value::Null),
            ))
        }));

        let mut source = Record::empty("User");
        source.set("tenant", json!("acme"));
        let mut filter = Filter::new();
        apply_scope(&def, &source, &mut filter);
        assert_eq!(filter.where_clause.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn test_discriminator_injection_for_has_side() {
        let mut def = has_many_def("pictures");
        def.polymorphic = Some(PolymorphicConfig::from_as("imageable"));
        def.key_to = "imageable_id".to_string();

        let source = Record::empty("Product");
        let mut filter = Filter::new();
        apply_scope(&def, &source, &mut filter);
        assert_eq!(
            filter.where_clause.get("imageable_type"),
            Some(&json!("Product"))
        );
    }

    #[test]
    fn test_no_discriminator_injection_for_belongs_to() {
        let mut def = RelationDefinition::new(RelationKind::BelongsTo, "imageable", "Picture");
        def.key_from = "imageable_id".to_string();
        def.polymorphic = Some(PolymorphicConfig::from_as("imageable"));

        let source = Record::empty("Picture");
        let mut filter = Filter::new();
        apply_scope(&def, &source, &mut filter);
        assert!(filter.where_clause.is_empty());
    }

    #[test]
    fn test_scope_respects_caller_order() {
        let mut scope_filter = Filter::new();
        scope_filter.order = vec!["created_at DESC".to_string()];
        let mut def = has_many_def("posts");
        def.scope = Some(ScopeSpec::fixed(scope_filter));

        let source = Record::empty("User");
        let mut filter = Filter::new();
        filter.order = vec!["title ASC".to_string()];
        apply_scope(&def, &source, &mut filter);
        assert_eq!(filter.order, vec!["title ASC".to_string()]);
    }
}
