//! Relation resolution subsystem
//!
//! Declaration produces immutable `RelationDefinition`s held by the
//! registry; at call time the engine pairs a definition with one source
//! record as a short-lived binding exposing the kind-specific operations.

pub mod belongs_to;
pub mod binding;
pub mod embeds_many;
pub mod has_many;
pub mod has_many_through;
pub mod has_one;
pub mod metadata;
pub mod polymorphic;
pub mod references_many;
pub mod registry;
pub mod scope;

pub use belongs_to::BelongsToBinding;
pub use binding::{Binding, RelationEngine, TargetRef};
pub use embeds_many::EmbedsManyBinding;
pub use has_many::HasManyBinding;
pub use has_many_through::HasManyThroughBinding;
pub use has_one::HasOneBinding;
pub use metadata::{
    PropertyMapper, RelationConfig, RelationDefinition, RelationKind, RelationOptions,
};
pub use polymorphic::PolymorphicConfig;
pub use references_many::ReferencesManyBinding;
pub use registry::{
    AccessorSpec, ParameterSpec, RelationOperation, RelationRegistry, ReturnSpec,
};
pub use scope::{apply_scope, ScopeSpec};
