//! Query filters and in-memory predicate evaluation
//!
//! A `Filter` is the storage-facing query shape: a `where` condition map
//! plus ordering, paging, field selection, and include directives. The same
//! condition grammar is evaluated in-memory against embedded lists and by
//! the in-memory store, so the predicate compiler lives here as well.
//!
//! Condition grammar per field: a literal value means equality; an object
//! of operators (`eq`, `neq`, `gt`, `gte`, `lt`, `lte`, `inq`, `nin`,
//! `between`, `like`, `nlike`, `exists`) constrains the field; the special
//! keys `and` / `or` hold arrays of nested condition maps.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value::{ids_equal, Document};

const OPERATORS: &[&str] = &[
    "eq", "neq", "gt", "gte", "lt", "lte", "inq", "nin", "between", "like", "nlike", "exists",
];

/// Condition map applied to record fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Where(Map<String, Value>);

impl Where {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn conditions(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Add an equality condition, and-combining with any existing condition
    /// on the same field.
    pub fn and_eq(&mut self, field: &str, value: Value) -> &mut Self {
        self.and_condition(field, value);
        self
    }

    /// Add an `inq` (one of) condition on a field.
    pub fn and_inq(&mut self, field: &str, values: Vec<Value>) -> &mut Self {
        self.and_condition(field, serde_json::json!({ "inq": values }));
        self
    }

    /// Add an arbitrary condition on a field. When the field already has a
    /// condition, both are preserved under an `and` list instead of the new
    /// one overwriting the old.
    pub fn and_condition(&mut self, field: &str, condition: Value) {
        match self.0.remove(field) {
            None => {
                self.0.insert(field.to_string(), condition);
            }
            Some(existing) => {
                let mut left = Map::new();
                left.insert(field.to_string(), existing);
                let mut right = Map::new();
                right.insert(field.to_string(), condition);
                let and = self.0.remove("and");
                let mut clauses = match and {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                clauses.push(Value::Object(left));
                clauses.push(Value::Object(right));
                self.0.insert("and".to_string(), Value::Array(clauses));
            }
        }
    }

    /// Merge another condition map into this one, and-combining conflicts.
    pub fn merge(&mut self, other: &Where) {
        for (field, condition) in other.0.iter() {
            if field == "and" || field == "or" {
                // nested clause lists are appended under "and"
                let mut nested = Map::new();
                nested.insert(field.clone(), condition.clone());
                let mut clauses = match self.0.remove("and") {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                clauses.push(Value::Object(nested));
                if clauses.len() == 1 {
                    if let Some(Value::Object(single)) = clauses.pop() {
                        for (k, v) in single {
                            self.and_condition(&k, v);
                        }
                    }
                } else {
                    self.0.insert("and".to_string(), Value::Array(clauses));
                }
            } else {
                self.and_condition(field, condition.clone());
            }
        }
    }

    /// Evaluate the condition map against a record's fields.
    pub fn matches(&self, doc: &Document) -> bool {
        self.0.iter().all(|(key, condition)| match key.as_str() {
            "and" => match condition {
                Value::Array(clauses) => clauses.iter().all(|c| clause_matches(c, doc)),
                _ => false,
            },
            "or" => match condition {
                Value::Array(clauses) => clauses.iter().any(|c| clause_matches(c, doc)),
                _ => false,
            },
            field => field_matches(doc.get(field), condition),
        })
    }
}

impl From<Map<String, Value>> for Where {
    fn from(conditions: Map<String, Value>) -> Self {
        Self(conditions)
    }
}

fn clause_matches(clause: &Value, doc: &Document) -> bool {
    match clause {
        Value::Object(map) => Where(map.clone()).matches(doc),
        _ => false,
    }
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if ops.keys().all(|k| OPERATORS.contains(&k.as_str())) => ops
            .iter()
            .all(|(op, operand)| operator_matches(actual, op, operand)),
        literal => match actual {
            Some(value) => ids_equal(value, literal) || value == literal,
            None => literal.is_null(),
        },
    }
}

fn operator_matches(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "eq" => field_matches(actual, operand),
        "neq" => !field_matches(actual, operand),
        "exists" => operand.as_bool().unwrap_or(true) == actual.map(|v| !v.is_null()).unwrap_or(false),
        "inq" => match (actual, operand) {
            (Some(value), Value::Array(candidates)) => {
                candidates.iter().any(|c| ids_equal(value, c) || value == c)
            }
            _ => false,
        },
        "nin" => match (actual, operand) {
            (Some(value), Value::Array(candidates)) => {
                !candidates.iter().any(|c| ids_equal(value, c) || value == c)
            }
            (None, Value::Array(_)) => true,
            _ => false,
        },
        "gt" | "gte" | "lt" | "lte" => {
            let Some(value) = actual else { return false };
            let Some(ordering) = compare_values(value, operand) else {
                return false;
            };
            match op {
                "gt" => ordering == Ordering::Greater,
                "gte" => ordering != Ordering::Less,
                "lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            }
        }
        "between" => match (actual, operand) {
            (Some(value), Value::Array(bounds)) if bounds.len() == 2 => {
                compare_values(value, &bounds[0]).map(|o| o != Ordering::Less) == Some(true)
                    && compare_values(value, &bounds[1]).map(|o| o != Ordering::Greater)
                        == Some(true)
            }
            _ => false,
        },
        "like" => like_matches(actual, operand),
        "nlike" => !like_matches(actual, operand),
        _ => false,
    }
}

fn like_matches(actual: Option<&Value>, pattern: &Value) -> bool {
    let (Some(Value::String(value)), Value::String(pattern)) = (actual, pattern) else {
        return false;
    };
    // `%` is the only wildcard; segments between wildcards must appear in order
    let anchored_start = !pattern.starts_with('%');
    let anchored_end = !pattern.ends_with('%');
    let segments: Vec<&str> = pattern.split('%').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return true;
    }
    let mut rest = value.as_str();
    for (i, segment) in segments.iter().enumerate() {
        let position = match rest.find(segment) {
            Some(p) => p,
            None => return false,
        };
        if i == 0 && anchored_start && position != 0 {
            return false;
        }
        rest = &rest[position + segment.len()..];
    }
    if anchored_end && !rest.is_empty() {
        return false;
    }
    true
}

/// Total-ish ordering over JSON values: numbers numerically, strings
/// lexicographically, booleans false < true. Mixed types do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Storage-facing query shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Condition map applied to record fields
    #[serde(rename = "where", default, skip_serializing_if = "Where::is_empty")]
    pub where_clause: Where,
    /// Ordering directives, `"field ASC"` or `"field DESC"`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Field projection; empty means all fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Relation names to expand on the results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching a single field value.
    pub fn where_eq(field: &str, value: Value) -> Self {
        let mut filter = Self::default();
        filter.where_clause.and_eq(field, value);
        filter
    }

    /// Merge another filter into this one. Where conditions are
    /// and-combined; `order`, `limit`, `skip`, and `fields` are protected —
    /// the other filter supplies them only when absent here. Includes are
    /// appended without duplicates.
    pub fn merge(&mut self, other: &Filter) {
        self.where_clause.merge(&other.where_clause);
        if self.order.is_empty() {
            self.order = other.order.clone();
        }
        if self.limit.is_none() {
            self.limit = other.limit;
        }
        if self.skip.is_none() {
            self.skip = other.skip;
        }
        if self.fields.is_empty() {
            self.fields = other.fields.clone();
        }
        for include in &other.include {
            if !self.include.contains(include) {
                self.include.push(include.clone());
            }
        }
    }

    /// Apply the full filter (where, order, skip, limit, fields) to an
    /// in-memory row set. Used against embedded lists and by `MemoryStore`.
    pub fn apply_in_memory(&self, rows: Vec<Document>) -> Vec<Document> {
        let mut rows: Vec<Document> = rows
            .into_iter()
            .filter(|row| self.where_clause.matches(row))
            .collect();

        if !self.order.is_empty() {
            let directives: Vec<(String, bool)> = self
                .order
                .iter()
                .map(|d| {
                    let mut parts = d.split_whitespace();
                    let field = parts.next().unwrap_or("").to_string();
                    let descending = parts
                        .next()
                        .map(|dir| dir.eq_ignore_ascii_case("DESC"))
                        .unwrap_or(false);
                    (field, descending)
                })
                .collect();
            rows.sort_by(|a, b| {
                for (field, descending) in &directives {
                    let left = a.get(field).unwrap_or(&Value::Null);
                    let right = b.get(field).unwrap_or(&Value::Null);
                    let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
                    let ordering = if *descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0);
        let mut rows: Vec<Document> = rows.into_iter().skip(skip).collect();
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        if !self.fields.is_empty() {
            rows = rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .filter(|(key, _)| self.fields.iter().any(|f| f == key))
                        .collect()
                })
                .collect();
        }
        rows
    }
}
