//! # tether-orm: Relation Resolution Layer
//!
//! Relation-resolution engine for a dynamic record mapping layer: relation
//! metadata and registry, scope/filter merging, polymorphic discriminator
//! resolution, per-instance relation caches, and CRUD-style operation
//! contracts across seven relation kinds (belongsTo, hasOne, hasMany,
//! hasManyThrough, hasAndBelongsToMany, embedsMany, referencesMany).
//!
//! Storage is an external collaborator behind the `Store` trait; the crate
//! ships an in-memory implementation used as the reference backend.

pub mod error;
pub mod filter;
pub mod record;
pub mod relations;
pub mod schema;
pub mod store;
pub mod validation;
pub mod value;


// Re-export core types
pub use error::*;
pub use filter::*;
pub use record::*;
pub use relations::*;
pub use schema::*;
pub use store::*;
pub use validation::*;
pub use value::*;
