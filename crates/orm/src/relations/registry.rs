//! Relation registry - per-schema metadata storage and accessor records
//!
//! Definitions are registered at declaration time and consulted by name at
//! bind time. The registry also answers reverse lookups (finding the
//! belongsTo relation a through model declares toward a given side) and
//! produces the accessor records a remoting layer needs to expose relation
//! operations.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{RelationError, RelationResult};

use super::metadata::{RelationDefinition, RelationKind};

/// Per-schema mapping from (source model, relation name) to definition
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: DashMap<String, HashMap<String, Arc<RelationDefinition>>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self {
            relations: DashMap::new(),
        }
    }

    /// Validate and register a definition. Relation names are unique per
    /// source model; re-declaring one is a configuration error.
    pub fn register(&self, def: RelationDefinition) -> RelationResult<Arc<RelationDefinition>> {
        def.validate()?;
        let mut model_relations = self
            .relations
            .entry(def.source_model.clone())
            .or_default();
        if model_relations.contains_key(&def.name) {
            return Err(RelationError::Configuration(format!(
                "relation '{}' is already declared on model '{}'",
                def.name, def.source_model
            )));
        }
        let def = Arc::new(def);
        model_relations.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// Definition by source model and relation name.
    pub fn get(&self, model: &str, relation: &str) -> Option<Arc<RelationDefinition>> {
        self.relations.get(model)?.get(relation).cloned()
    }

    pub fn has_relation(&self, model: &str, relation: &str) -> bool {
        self.relations
            .get(model)
            .map(|relations| relations.contains_key(relation))
            .unwrap_or(false)
    }

    /// All relation names declared on a model.
    pub fn names(&self, model: &str) -> Vec<String> {
        self.relations
            .get(model)
            .map(|relations| relations.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All definitions declared on a model.
    pub fn all_for_model(&self, model: &str) -> Vec<Arc<RelationDefinition>> {
        self.relations
            .get(model)
            .map(|relations| relations.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Find the belongsTo relation a through model declares toward the
    /// given side. Used to discover join-side foreign keys for
    /// through-relations; the target comparison is case-insensitive.
    pub fn find_belongs_to(
        &self,
        through_model: &str,
        side_model: &str,
    ) -> Option<Arc<RelationDefinition>> {
        self.all_for_model(through_model)
            .into_iter()
            .find(|def| {
                def.kind == RelationKind::BelongsTo
                    && def
                        .target_model
                        .as_deref()
                        .map(|t| t.eq_ignore_ascii_case(side_model))
                        .unwrap_or(false)
            })
    }

    /// Accessor records for every relation declared on a model.
    pub fn accessor_specs(&self, model: &str) -> Vec<AccessorSpec> {
        let mut specs: Vec<AccessorSpec> = self
            .all_for_model(model)
            .iter()
            .flat_map(|def| specs_for(def))
            .collect();
        specs.sort_by(|a, b| a.method.cmp(&b.method));
        specs
    }
}

/// Operations a relation accessor exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOperation {
    Get,
    Create,
    FindById,
    UpdateById,
    DestroyById,
    Exists,
    Link,
    Unlink,
}

/// One accepted parameter of an accessor method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub type_name: &'static str,
    pub required: bool,
    /// Transport binding hint: where the value comes from
    pub source: &'static str,
}

/// Return shape of an accessor method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnSpec {
    pub type_name: String,
    pub is_list: bool,
}

/// Declaration-produced accessor record: one named operation bound to one
/// relation, with the metadata a remoting layer needs to expose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorSpec {
    /// Method name in the `__op__relation` convention
    pub method: String,
    pub relation: String,
    pub operation: RelationOperation,
    pub http_verb: &'static str,
    pub http_path: String,
    pub accepts: Vec<ParameterSpec>,
    pub returns: ReturnSpec,
    pub description: String,
    /// Whether the method is meant for remote exposure
    pub shared: bool,
}

fn target_name(def: &RelationDefinition) -> String {
    def.target_model
        .clone()
        .unwrap_or_else(|| "<polymorphic>".to_string())
}

fn fk_param() -> ParameterSpec {
    ParameterSpec {
        name: "fk",
        type_name: "any",
        required: true,
        source: "path",
    }
}

fn data_param() -> ParameterSpec {
    ParameterSpec {
        name: "data",
        type_name: "object",
        required: false,
        source: "body",
    }
}

fn specs_for(def: &RelationDefinition) -> Vec<AccessorSpec> {
    let name = &def.accessor_name;
    let target = target_name(def);
    let mut specs = vec![
        AccessorSpec {
            method: format!("__get__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::Get,
            http_verb: "GET",
            http_path: format!("/{}", name),
            accepts: vec![ParameterSpec {
                name: "filter",
                type_name: "object",
                required: false,
                source: "query",
            }],
            returns: ReturnSpec {
                type_name: target.clone(),
                is_list: def.is_multiple(),
            },
            description: format!("Queries {} of this record.", name),
            shared: true,
        },
        AccessorSpec {
            method: format!("__create__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::Create,
            http_verb: "POST",
            http_path: format!("/{}", name),
            accepts: vec![data_param()],
            returns: ReturnSpec {
                type_name: target.clone(),
                is_list: false,
            },
            description: format!("Creates a new instance in {} of this record.", name),
            shared: true,
        },
    ];

    if def.is_multiple() {
        specs.push(AccessorSpec {
            method: format!("__findById__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::FindById,
            http_verb: "GET",
            http_path: format!("/{}/:fk", name),
            accepts: vec![fk_param()],
            returns: ReturnSpec {
                type_name: target.clone(),
                is_list: false,
            },
            description: format!("Finds an instance of {} by id.", name),
            shared: true,
        });
        specs.push(AccessorSpec {
            method: format!("__updateById__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::UpdateById,
            http_verb: "PUT",
            http_path: format!("/{}/:fk", name),
            accepts: vec![fk_param(), data_param()],
            returns: ReturnSpec {
                type_name: target.clone(),
                is_list: false,
            },
            description: format!("Updates an instance of {} by id.", name),
            shared: true,
        });
        specs.push(AccessorSpec {
            method: format!("__destroyById__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::DestroyById,
            http_verb: "DELETE",
            http_path: format!("/{}/:fk", name),
            accepts: vec![fk_param()],
            returns: ReturnSpec {
                type_name: "void".to_string(),
                is_list: false,
            },
            description: format!("Deletes an instance of {} by id.", name),
            shared: true,
        });
        specs.push(AccessorSpec {
            method: format!("__exists__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::Exists,
            http_verb: "HEAD",
            http_path: format!("/{}/rel/:fk", name),
            accepts: vec![fk_param()],
            returns: ReturnSpec {
                type_name: "boolean".to_string(),
                is_list: false,
            },
            description: format!("Checks existence of an instance in {}.", name),
            shared: true,
        });
    }

    let linkable = def.kind.uses_through()
        || def.kind == RelationKind::ReferencesMany
        || (def.kind == RelationKind::EmbedsMany && def.options.belongs_to.is_some());
    if linkable {
        specs.push(AccessorSpec {
            method: format!("__link__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::Link,
            http_verb: "PUT",
            http_path: format!("/{}/rel/:fk", name),
            accepts: vec![fk_param(), data_param()],
            returns: ReturnSpec {
                type_name: target.clone(),
                is_list: false,
            },
            description: format!("Adds an existing instance to {}.", name),
            shared: true,
        });
        specs.push(AccessorSpec {
            method: format!("__unlink__{}", name),
            relation: def.name.clone(),
            operation: RelationOperation::Unlink,
            http_verb: "DELETE",
            http_path: format!("/{}/rel/:fk", name),
            accepts: vec![fk_param()],
            returns: ReturnSpec {
                type_name: "void".to_string(),
                is_list: false,
            },
            description: format!("Removes an instance from {}.", name),
            shared: true,
        });
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_many_def(source: &str, name: &str, target: &str) -> RelationDefinition {
        let mut def = RelationDefinition::new(RelationKind::HasMany, name, source);
        def.target_model = Some(target.to_string());
        def.key_from = "id".to_string();
        def.key_to = format!("{}_id", super::super::metadata::snake_case(source));
        def
    }

    fn belongs_to_def(source: &str, name: &str, target: &str) -> RelationDefinition {
        let mut def = RelationDefinition::new(RelationKind::BelongsTo, name, source);
        def.target_model = Some(target.to_string());
        def.key_from = format!("{}_id", name);
        def.key_to = "id".to_string();
        def
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = RelationRegistry::new();
        registry.register(has_many_def("User", "posts", "Post")).unwrap();

        assert!(registry.has_relation("User", "posts"));
        assert!(registry.get("User", "posts").is_some());
        assert!(registry.get("User", "comments").is_none());
        assert_eq!(registry.names("User"), vec!["posts".to_string()]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = RelationRegistry::new();
        registry.register(has_many_def("User", "posts", "Post")).unwrap();
        let err = registry
            .register(has_many_def("User", "posts", "Post"))
            .unwrap_err();
        assert!(matches!(err, RelationError::Configuration(_)));
    }

    #[test]
    fn test_find_belongs_to_scan() {
        let registry = RelationRegistry::new();
        registry
            .register(belongs_to_def("Appointment", "physician", "Physician"))
            .unwrap();
        registry
            .register(belongs_to_def("Appointment", "patient", "Patient"))
            .unwrap();

        let found = registry.find_belongs_to("Appointment", "physician").unwrap();
        assert_eq!(found.key_from, "physician_id");
        assert!(registry.find_belongs_to("Appointment", "Clinic").is_none());
    }

    #[test]
    fn test_accessor_specs_for_plural_relation() {
        let registry = RelationRegistry::new();
        registry.register(has_many_def("User", "posts", "Post")).unwrap();

        let specs = registry.accessor_specs("User");
        let methods: Vec<&str> = specs.iter().map(|s| s.method.as_str()).collect();
        assert!(methods.contains(&"__get__posts"));
        assert!(methods.contains(&"__create__posts"));
        assert!(methods.contains(&"__findById__posts"));
        assert!(methods.contains(&"__destroyById__posts"));
        assert!(methods.contains(&"__exists__posts"));
        // plain hasMany has no link/unlink accessors
        assert!(!methods.contains(&"__link__posts"));
        assert!(specs.iter().all(|s| s.shared));
    }

    #[test]
    fn test_accessor_specs_for_singular_relation() {
        let registry = RelationRegistry::new();
        registry
            .register(belongs_to_def("Post", "author", "User"))
            .unwrap();

        let specs = registry.accessor_specs("Post");
        let methods: Vec<&str> = specs.iter().map(|s| s.method.as_str()).collect();
        assert_eq!(methods, vec!["__create__author", "__get__author"]);
        assert!(!specs[1].returns.is_list);
    }
}
