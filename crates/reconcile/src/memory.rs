//! In-process [`Catalog`] implementation.
//!
//! Behaves like the remote service closely enough to exercise the
//! [`crate::Reconciler`] without a network: filters are evaluated against
//! stored records, refs are assigned as `/<type>/<n>`, reference fields are
//! expanded into `{ "_ref": ... }` objects, updates merge into the stored
//! record, and query results are projected onto the fetch list.
//!
//! Tests can script failures ([`InMemoryCatalog::reject_next_query`],
//! [`InMemoryCatalog::reject_next_create`], [`InMemoryCatalog::fail_next_call`])
//! and make the query-then-create race
//! observable ([`InMemoryCatalog::with_query_yield`]).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::catalog::{Catalog, ReconcileContext};
use crate::entities::EntityKind;
use crate::errors::CatalogError;
use crate::types::{
    CreateResponse, Entity, EntityPayload, Operator, QueryRequest, QueryResponse, UpdateResponse,
    ValueKind,
};
use crate::EntityRef;

/// Number of catalog calls received, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub queries: usize,
    pub creates: usize,
    pub updates: usize,
}

#[derive(Debug)]
struct Record {
    kind: EntityKind,
    scope: Option<EntityRef>,
    key: String,
    entity: Entity,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    stories: u64,
    records: Vec<Record>,
    query_rejections: VecDeque<Vec<String>>,
    create_rejections: VecDeque<Vec<String>>,
    update_rejections: VecDeque<Vec<String>>,
    failures: VecDeque<CatalogError>,
    unreferenced_creates: usize,
    calls: CallCounts,
}

/// A [`Catalog`] backed by a local record list.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: Mutex<State>,
    yield_after_query: bool,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields to the scheduler after each query has taken its snapshot.
    ///
    /// Lets two concurrent resolutions both observe "not found" before either
    /// creates, reproducing the race the real service is exposed to.
    #[must_use]
    pub fn with_query_yield(mut self) -> Self {
        self.yield_after_query = true;
        self
    }

    /// Stores a record visible from every workspace, without counting a call.
    pub fn seed(&self, kind: EntityKind, payload: &EntityPayload) -> EntityRef {
        self.lock().insert(kind, None, payload)
    }

    /// Stores a record visible only from `workspace`.
    pub fn seed_in(
        &self,
        workspace: &EntityRef,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> EntityRef {
        self.lock().insert(kind, Some(workspace.clone()), payload)
    }

    /// Makes the next query report `errors` with no results.
    pub fn reject_next_query<I, S>(&self, errors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let errors = errors.into_iter().map(Into::into).collect();
        self.lock().query_rejections.push_back(errors);
    }

    /// Makes the next create store the record but return it without `_ref`.
    pub fn omit_next_created_ref(&self) {
        self.lock().unreferenced_creates += 1;
    }

    /// Makes the next create report `errors` instead of storing anything.
    pub fn reject_next_create<I, S>(&self, errors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let errors = errors.into_iter().map(Into::into).collect();
        self.lock().create_rejections.push_back(errors);
    }

    /// Makes the next update report `errors` instead of applying the patch.
    pub fn reject_next_update<I, S>(&self, errors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let errors = errors.into_iter().map(Into::into).collect();
        self.lock().update_rejections.push_back(errors);
    }

    /// Makes the next call of any kind fail with `error`.
    pub fn fail_next_call(&self, error: CatalogError) {
        self.lock().failures.push_back(error);
    }

    /// Calls received so far.
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Full stored record for `reference`, ignoring fetch lists.
    pub fn get(&self, reference: &EntityRef) -> Option<Entity> {
        let key = record_key(reference)?;
        self.lock()
            .records
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.entity.clone())
    }

    /// Every stored record of `kind`, in creation order.
    pub fn records(&self, kind: EntityKind) -> Vec<Entity> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.entity.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn insert(
        &mut self,
        kind: EntityKind,
        scope: Option<EntityRef>,
        payload: &EntityPayload,
    ) -> EntityRef {
        self.next_id += 1;
        let id = self.next_id;
        let reference = EntityRef::from_path(kind.type_name(), id);
        let key = reference.to_string();

        let mut map = Map::new();
        map.insert("_ref".into(), Value::String(key.clone()));
        map.insert("_type".into(), Value::String(kind.type_name().into()));
        map.insert("ObjectID".into(), json!(id));
        if kind == EntityKind::HierarchicalRequirement {
            self.stories += 1;
            map.insert("FormattedID".into(), Value::String(format!("US{}", self.stories)));
        }
        merge(kind, &mut map, payload);
        if let Some(name) = map.get("Name").cloned() {
            map.insert("_refObjectName".into(), name);
        }

        self.records.push(Record {
            kind,
            scope,
            key,
            entity: Entity::from_map(map),
        });
        reference
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn query(
        &self,
        ctx: &ReconcileContext,
        request: &QueryRequest,
    ) -> Result<QueryResponse, CatalogError> {
        let response = {
            let mut state = self.lock();
            state.calls.queries += 1;
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            if let Some(errors) = state.query_rejections.pop_front() {
                return Ok(QueryResponse {
                    total_result_count: 0,
                    results: Vec::new(),
                    errors,
                    warnings: Vec::new(),
                });
            }

            let conditions = request.filter.conditions();
            let hits: Vec<&Record> = state
                .records
                .iter()
                .filter(|r| r.kind == request.kind)
                .filter(|r| match (&ctx.workspace, &r.scope) {
                    (Some(ws), Some(scope)) => ws == scope,
                    _ => true,
                })
                .filter(|r| {
                    conditions
                        .iter()
                        .all(|(field, op, value)| matches(&r.entity, field, *op, value))
                })
                .collect();

            QueryResponse {
                total_result_count: hits.len() as u64,
                results: hits
                    .iter()
                    .take(request.limit as usize)
                    .map(|r| project(&r.entity, request.fetch.fields()))
                    .collect(),
                errors: Vec::new(),
                warnings: Vec::new(),
            }
        };

        if self.yield_after_query {
            tokio::task::yield_now().await;
        }
        Ok(response)
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> Result<CreateResponse, CatalogError> {
        let mut state = self.lock();
        state.calls.creates += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(errors) = state.create_rejections.pop_front() {
            return Ok(CreateResponse {
                object: None,
                errors,
                warnings: Vec::new(),
            });
        }

        let reference = state.insert(kind, ctx.workspace.clone(), payload);
        let mut object = state
            .records
            .iter()
            .find(|r| r.key == reference.as_str())
            .map(|r| r.entity.clone());
        if state.unreferenced_creates > 0 {
            state.unreferenced_creates -= 1;
            if let Some(entity) = object.as_mut() {
                entity.as_map_mut().remove("_ref");
            }
        }
        Ok(CreateResponse {
            object,
            errors: Vec::new(),
            warnings: Vec::new(),
        })
    }

    async fn update(
        &self,
        _ctx: &ReconcileContext,
        reference: &EntityRef,
        payload: &EntityPayload,
    ) -> Result<UpdateResponse, CatalogError> {
        let mut state = self.lock();
        state.calls.updates += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(errors) = state.update_rejections.pop_front() {
            return Ok(UpdateResponse {
                object: None,
                errors,
                warnings: Vec::new(),
            });
        }

        let key = record_key(reference);
        let Some(record) = state
            .records
            .iter_mut()
            .find(|r| Some(r.key.as_str()) == key.as_deref())
        else {
            return Ok(UpdateResponse {
                object: None,
                errors: vec![format!("Cannot find object to update: {reference}")],
                warnings: Vec::new(),
            });
        };

        merge(record.kind, record.entity.as_map_mut(), payload);
        Ok(UpdateResponse {
            object: Some(record.entity.clone()),
            errors: Vec::new(),
            warnings: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalises absolute and relative refs to `/<type>/<id>`.
fn record_key(reference: &EntityRef) -> Option<String> {
    Some(format!(
        "/{}/{}",
        reference.type_segment()?,
        reference.object_id()?
    ))
}

fn merge(kind: EntityKind, map: &mut Map<String, Value>, payload: &EntityPayload) {
    for (field, value) in payload.fields() {
        let is_reference = kind
            .schema()
            .iter()
            .any(|f| f.name == field && f.value_kind == ValueKind::Reference);
        let json = match value.as_str() {
            Some(r) if is_reference => json!({ "_ref": r }),
            _ => value.to_json(),
        };
        map.insert(field.to_string(), json);
    }
}

fn project(entity: &Entity, fetch: &[String]) -> Entity {
    if fetch.is_empty() {
        return entity.clone();
    }
    let map = entity
        .as_map()
        .iter()
        .filter(|(k, _)| k.starts_with('_') || fetch.iter().any(|f| f == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Entity::from_map(map)
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(obj) => obj.get("_ref").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn matches(entity: &Entity, field: &str, op: Operator, expected: &str) -> bool {
    let Some(actual) = entity.get(field).and_then(field_text) else {
        return matches!(op, Operator::NotEq | Operator::NotContains);
    };
    match op {
        Operator::Eq => actual == expected,
        Operator::NotEq => actual != expected,
        Operator::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        Operator::NotContains => !actual.to_lowercase().contains(&expected.to_lowercase()),
        Operator::Lt | Operator::LtEq | Operator::Gt | Operator::GtEq => {
            let ordering = match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(actual.as_str().cmp(expected)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                Operator::Lt => ordering.is_lt(),
                Operator::LtEq => ordering.is_le(),
                Operator::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
    }
}
