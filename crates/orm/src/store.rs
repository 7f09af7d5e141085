//! Storage seam - the async backend trait and an in-memory implementation
//!
//! Relation resolution never talks to a concrete backend. Everything goes
//! through `Store`, which deals in raw documents; records are assembled on
//! the way out. `MemoryStore` is the reference backend used by the test
//! suite and by embedded callers that need no persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RelationError, RelationResult};
use crate::filter::{Filter, Where};
use crate::value::{ids_equal, is_missing, Document};

/// Backend contract for document storage.
///
/// Implementations report infrastructure failures as `RelationError::Store`;
/// absence is modeled in the return types, not as an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Find documents matching a filter, honoring its order, skip, limit,
    /// and fields directives.
    async fn find(&self, model: &str, filter: &Filter) -> RelationResult<Vec<Document>>;

    /// Find at most one document matching a filter.
    async fn find_one(&self, model: &str, filter: &Filter) -> RelationResult<Option<Document>> {
        let mut limited = filter.clone();
        limited.limit = Some(1);
        Ok(self.find(model, &limited).await?.into_iter().next())
    }

    /// Find a document matching a filter, inserting `data` when none
    /// matches. Returns the document and whether it was created. Not
    /// atomic; concurrent callers can both insert.
    async fn find_or_create(
        &self,
        model: &str,
        id_field: &str,
        filter: &Filter,
        data: Document,
    ) -> RelationResult<(Document, bool)> {
        if let Some(existing) = self.find_one(model, filter).await? {
            return Ok((existing, false));
        }
        let created = self.insert(model, id_field, data).await?;
        Ok((created, true))
    }

    /// Find one document by identifier.
    async fn find_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
    ) -> RelationResult<Option<Document>>;

    /// Insert a document, assigning an identifier when the document
    /// carries none. Returns the stored document.
    async fn insert(
        &self,
        model: &str,
        id_field: &str,
        doc: Document,
    ) -> RelationResult<Document>;

    /// Apply field changes to one document by identifier. Returns the
    /// updated document, or `None` when no document has that identifier.
    async fn update_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
        changes: Document,
    ) -> RelationResult<Option<Document>>;

    /// Delete one document by identifier. Returns whether one was deleted.
    async fn delete_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
    ) -> RelationResult<bool>;

    /// Delete every document matching a condition. Returns the count.
    async fn delete_where(&self, model: &str, condition: &Where) -> RelationResult<usize>;

    /// Count documents matching a condition.
    async fn count(&self, model: &str, condition: &Where) -> RelationResult<usize>;
}

/// In-memory document store keyed by model name.
///
/// Identifiers are assigned from a single monotonically increasing counter
/// shared across models, so ids are unique process-wide.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<Document>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored documents for a model, matching nothing filtered.
    pub fn len(&self, model: &str) -> usize {
        self.collections.get(model).map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, model: &str) -> bool {
        self.len(model) == 0
    }

    fn allocate_id(&self) -> Value {
        Value::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, model: &str, filter: &Filter) -> RelationResult<Vec<Document>> {
        let docs = self
            .collections
            .get(model)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        Ok(filter.apply_in_memory(docs))
    }

    async fn find_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
    ) -> RelationResult<Option<Document>> {
        let found = self.collections.get(model).and_then(|docs| {
            docs.iter()
                .find(|doc| {
                    doc.get(id_field)
                        .map(|stored| ids_equal(stored, id))
                        .unwrap_or(false)
                })
                .cloned()
        });
        Ok(found)
    }

    async fn insert(
        &self,
        model: &str,
        id_field: &str,
        mut doc: Document,
    ) -> RelationResult<Document> {
        if is_missing(doc.get(id_field)) {
            doc.insert(id_field.to_string(), self.allocate_id());
        } else {
            let id = doc.get(id_field).cloned().unwrap_or(Value::Null);
            if self.find_by_id(model, id_field, &id).await?.is_some() {
                return Err(RelationError::Store(format!(
                    "duplicate {} identifier {}",
                    model, id
                )));
            }
        }
        self.collections
            .entry(model.to_string())
            .or_default()
            .push(doc.clone());
        Ok(doc)
    }

    async fn update_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
        changes: Document,
    ) -> RelationResult<Option<Document>> {
        let mut entry = match self.collections.get_mut(model) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        for doc in entry.iter_mut() {
            let matches = doc
                .get(id_field)
                .map(|stored| ids_equal(stored, id))
                .unwrap_or(false);
            if matches {
                for (field, value) in changes {
                    if value.is_null() {
                        doc.remove(&field);
                    } else {
                        doc.insert(field, value);
                    }
                }
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }

    async fn delete_by_id(
        &self,
        model: &str,
        id_field: &str,
        id: &Value,
    ) -> RelationResult<bool> {
        let mut entry = match self.collections.get_mut(model) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let before = entry.len();
        entry.retain(|doc| {
            !doc.get(id_field)
                .map(|stored| ids_equal(stored, id))
                .unwrap_or(false)
        });
        Ok(entry.len() < before)
    }

    async fn delete_where(&self, model: &str, condition: &Where) -> RelationResult<usize> {
        let mut entry = match self.collections.get_mut(model) {
            Some(entry) => entry,
            None => return Ok(0),
        };
        let before = entry.len();
        entry.retain(|doc| !condition.matches(doc));
        Ok(before - entry.len())
    }

    async fn count(&self, model: &str, condition: &Where) -> RelationResult<usize> {
        let count = self
            .collections
            .get(model)
            .map(|docs| docs.iter().filter(|doc| condition.matches(doc)).count())
            .unwrap_or(0);
        Ok(count)
    }
}
