//! Shared value types for the reconciliation domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! structure: payloads are typed scalar maps, filters are composable predicate
//! trees, and responses carry the remote service's error lists as data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::EntityKind;
use crate::EntityRef;

/// Page size and limit used for natural-key lookups.
///
/// Only the first result of a lookup is used, so there is no reason to pull
/// more than a handful of rows.
pub const LOOKUP_PAGE_SIZE: u32 = 5;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A tagged scalar field value submitted in a create or update payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Free text, enum-like strings, and refs.
    String(String),
    /// Numeric values (Rally numbers are decimals).
    Number(f64),
    /// Boolean flags.
    Boolean(bool),
}

impl FieldValue {
    /// Returns the string content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to JSON.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Boolean(b) => Value::Bool(*b),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{s}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::String(value.clone())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&EntityRef> for FieldValue {
    fn from(value: &EntityRef) -> Self {
        FieldValue::String(value.as_str().to_string())
    }
}

/// The scalar kind a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Text or enum-like string.
    String,
    /// Decimal number.
    Number,
    /// Boolean flag.
    Boolean,
    /// A ref to another entity, carried as a string.
    Reference,
}

impl ValueKind {
    /// Returns `true` if `value` is acceptable for a field of this kind.
    pub fn accepts(self, value: &FieldValue) -> bool {
        match (self, value) {
            (ValueKind::String, FieldValue::String(_)) => true,
            (ValueKind::Number, FieldValue::Number(n)) => n.is_finite(),
            (ValueKind::Boolean, FieldValue::Boolean(_)) => true,
            (ValueKind::Reference, FieldValue::String(s)) => EntityRef::new(s.as_str()).is_some(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Reference => "reference",
        };
        f.write_str(s)
    }
}

/// Desired attributes for a create or update call.
///
/// Field order is stable (sorted by name) so that request bodies and log
/// output are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityPayload(BTreeMap<String, FieldValue>);

impl EntityPayload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    /// Sets `field` to `value`, replacing any previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(field.into(), value.into());
    }

    /// Returns the value for `field`, if set.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Iterates over `(field, value)` pairs in field-name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no fields are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts the payload into a JSON object.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A record as returned by the remote catalog.
///
/// Rally returns loosely-shaped JSON objects whose field set depends on the
/// `fetch` list, so this stays a JSON object with typed accessors rather than
/// one struct per entity kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    /// Wraps a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wraps a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// The entity's own ref (`_ref`).
    pub fn reference(&self) -> Option<EntityRef> {
        self.get_str("_ref").and_then(EntityRef::new)
    }

    /// The `Name` field, falling back to `_refObjectName`.
    pub fn name(&self) -> Option<&str> {
        self.get_str("Name").or_else(|| self.get_str("_refObjectName"))
    }

    /// Raw JSON access.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// String field access.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Reads a field holding a ref to another entity.
    ///
    /// Accepts both a plain ref string and a nested `{ "_ref": ... }` object,
    /// which is how the service expands reference fields in responses.
    pub fn reference_field(&self, field: &str) -> Option<EntityRef> {
        match self.0.get(field)? {
            Value::String(s) => EntityRef::new(s.as_str()),
            Value::Object(obj) => obj
                .get("_ref")
                .and_then(Value::as_str)
                .and_then(EntityRef::new),
            _ => None,
        }
    }

    /// Mutable access to the underlying JSON object.
    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Read-only access to the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Comparison operator in a [`QueryFilter`] condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `contains`
    Contains,
    /// `!contains`
    NotContains,
}

impl Operator {
    /// Returns the operator as written in a query string.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Contains => "contains",
            Operator::NotContains => "!contains",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A predicate over entity fields, composable via AND.
///
/// Renders to the service's query syntax: `(Name = "Private Banking")` for a
/// single condition and `((a) AND (b))` for a conjunction. Refs and single
/// words are left unquoted: `(Project = /project/1234)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryFilter {
    /// A single `field operator value` triple.
    Condition {
        /// Field name (e.g. `Name`, `FormattedID`, `Project`).
        field: String,
        /// Comparison operator.
        operator: Operator,
        /// Right-hand value; quoted on render only when needed.
        value: String,
    },
    /// Both sides must hold.
    And(Box<QueryFilter>, Box<QueryFilter>),
}

impl QueryFilter {
    /// Creates a condition with an explicit operator.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        QueryFilter::Condition {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Creates an equality condition.
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    /// Combines two filters with AND.
    #[must_use]
    pub fn and(self, other: QueryFilter) -> Self {
        QueryFilter::And(Box::new(self), Box::new(other))
    }

    /// Visits every condition in the tree, left to right.
    pub fn conditions(&self) -> Vec<(&str, Operator, &str)> {
        match self {
            QueryFilter::Condition {
                field,
                operator,
                value,
            } => vec![(field.as_str(), *operator, value.as_str())],
            QueryFilter::And(l, r) => {
                let mut out = l.conditions();
                out.extend(r.conditions());
                out
            }
        }
    }
}

impl std::fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryFilter::Condition {
                field,
                operator,
                value,
            } => write!(f, "({field} {operator} {})", quote_value(value)),
            QueryFilter::And(l, r) => write!(f, "({l} AND {r})"),
        }
    }
}

/// Quotes a condition value when it contains whitespace, parentheses, or
/// quotes; refs and single words stay bare.
fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\\'));
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Ordered, de-duplicated list of fields to return from a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch(Vec<String>);

impl Fetch {
    /// Builds a fetch list, dropping blanks and duplicates.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for f in fields {
            let f = f.into();
            if !f.trim().is_empty() && !out.contains(&f) {
                out.push(f);
            }
        }
        Self(out)
    }

    /// Returns `true` if no fields were requested.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field names in request order.
    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for Fetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A query against one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Entity type to query.
    pub kind: EntityKind,
    /// Predicate narrowing the result set.
    pub filter: QueryFilter,
    /// Fields to include in each result.
    pub fetch: Fetch,
    /// Rows per page.
    pub page_size: u32,
    /// Maximum rows to return across all pages.
    pub limit: u32,
}

impl QueryRequest {
    /// Creates a request with lookup-sized paging.
    pub fn new(kind: EntityKind, filter: QueryFilter, fetch: Fetch) -> Self {
        Self {
            kind,
            filter,
            fetch,
            page_size: LOOKUP_PAGE_SIZE,
            limit: LOOKUP_PAGE_SIZE,
        }
    }
}

/// Result of a query call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    /// Total matches on the server, which may exceed `results.len()`.
    pub total_result_count: u64,
    /// Matching records in server order, capped at the request limit.
    pub results: Vec<Entity>,
    /// Errors reported by the service.
    pub errors: Vec<String>,
    /// Warnings reported by the service.
    pub warnings: Vec<String>,
}

impl QueryResponse {
    /// `true` when the service reported no errors.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a create call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateResponse {
    /// The created record, absent when the service rejected the payload.
    pub object: Option<Entity>,
    /// Validation errors reported by the service.
    pub errors: Vec<String>,
    /// Warnings reported by the service.
    pub warnings: Vec<String>,
}

impl CreateResponse {
    /// Ref of the created record.
    pub fn reference(&self) -> Option<EntityRef> {
        self.object.as_ref().and_then(Entity::reference)
    }
}

/// Result of an update call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResponse {
    /// The record after the update, when the service returns it.
    pub object: Option<Entity>,
    /// Validation errors reported by the service.
    pub errors: Vec<String>,
    /// Warnings reported by the service.
    pub warnings: Vec<String>,
}

/// Outcome of [`crate::Reconciler::apply_update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    /// `true` when the service reported no errors.
    pub success: bool,
    /// Errors reported by the service, in order.
    pub errors: Vec<String>,
    /// The record after the update, when returned.
    pub object: Option<Entity>,
}

impl From<UpdateResponse> for UpdateResult {
    fn from(resp: UpdateResponse) -> Self {
        Self {
            success: resp.errors.is_empty(),
            errors: resp.errors,
            object: resp.object,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly. Rendered as RFC 3339, which is what the service expects for date
/// fields such as a build's `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
