//! The find-or-create reconciler.
//!
//! Each resolution walks `UNRESOLVED → QUERIED → {FOUND, CREATED}`:
//!
//! 1. query the catalog with the lookup's natural-key filter (page size 5);
//! 2. if a record comes back, the first one is the canonical match;
//! 3. otherwise submit the create payload exactly once.
//!
//! There is no retry and no rollback. Query-then-create is not transactional:
//! two callers resolving the same absent key at the same time can both
//! create. [`AdvisoryLocks`] serialises same-key resolutions inside one
//! process; nothing here guards against other processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, ReconcileContext};
use crate::entities::{EntityKind, PayloadError};
use crate::errors::{CatalogError, ReconcileError};
use crate::types::{Entity, EntityPayload, Fetch, QueryFilter, QueryRequest, UpdateResult};
use crate::EntityRef;

// ---------------------------------------------------------------------------
// Lookup descriptors
// ---------------------------------------------------------------------------

/// A natural-key lookup: which kind, which filter, which fields to return.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub kind: EntityKind,
    pub filter: QueryFilter,
    pub fetch: Fetch,
}

impl Lookup {
    /// Creates a lookup fetching only `Name`.
    pub fn new(kind: EntityKind, filter: QueryFilter) -> Self {
        Self {
            kind,
            filter,
            fetch: Fetch::new(["Name"]),
        }
    }

    /// Shorthand for `Name = name`.
    pub fn by_name(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::new(kind, QueryFilter::eq("Name", name))
    }

    /// Replaces the fetch list.
    #[must_use]
    pub fn fetch<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch = Fetch::new(fields);
        self
    }

    fn to_request(&self) -> QueryRequest {
        QueryRequest::new(self.kind, self.filter.clone(), self.fetch.clone())
    }
}

/// What to do when a natural-key lookup matches more than one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AmbiguityPolicy {
    /// Use the first match and log a warning.
    #[default]
    FirstMatch,
    /// Fail with [`ReconcileError::AmbiguousLookup`].
    Reject,
}

// ---------------------------------------------------------------------------
// Advisory locks
// ---------------------------------------------------------------------------

/// In-process locks keyed by workspace, entity kind, and lookup filter.
///
/// Cloning shares the lock table, so reconcilers built from clones serialise
/// against each other.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryLocks {
    table: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AdvisoryLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, ctx: &ReconcileContext, lookup: &Lookup) -> OwnedMutexGuard<()> {
        let key = format!(
            "{}|{}|{}",
            ctx.workspace.as_ref().map(EntityRef::as_str).unwrap_or(""),
            lookup.kind,
            lookup.filter
        );
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(table.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal state of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// An existing entity matched the lookup.
    Found,
    /// No entity matched; one was created.
    Created,
}

/// Result of [`Reconciler::resolve_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub reference: EntityRef,
    pub state: ResolutionState,
    /// The matched record, or the created record as the service returned it.
    pub entity: Entity,
}

/// Where an appended child points at its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Child field holding the parent ref (e.g. `BuildDefinition`).
    pub field: String,
    pub parent: EntityRef,
}

impl ParentLink {
    pub fn new(field: impl Into<String>, parent: EntityRef) -> Self {
        Self {
            field: field.into(),
            parent,
        }
    }
}

/// Result of [`Reconciler::record_append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendResult {
    /// The child record was created.
    Created {
        reference: EntityRef,
        entity: Entity,
    },
    /// The service rejected the child. Not a hard failure; the caller decides.
    Rejected {
        /// First error reported by the service.
        first_error: String,
        /// Every error reported by the service.
        errors: Vec<String>,
    },
}

impl AppendResult {
    /// Ref of the created child, `None` when rejected.
    pub fn reference(&self) -> Option<&EntityRef> {
        match self {
            AppendResult::Created { reference, .. } => Some(reference),
            AppendResult::Rejected { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Resolves entities by natural key against a [`Catalog`].
///
/// Holds no per-workspace state: scope arrives with each call in a
/// [`ReconcileContext`].
#[derive(Debug)]
pub struct Reconciler<C> {
    catalog: C,
    ambiguity: AmbiguityPolicy,
    locks: Option<AdvisoryLocks>,
}

impl<C: Catalog> Reconciler<C> {
    /// Creates a reconciler with first-match ambiguity handling and no locks.
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            ambiguity: AmbiguityPolicy::default(),
            locks: None,
        }
    }

    /// Sets the ambiguity policy for every lookup.
    #[must_use]
    pub fn with_ambiguity(mut self, policy: AmbiguityPolicy) -> Self {
        self.ambiguity = policy;
        self
    }

    /// Serialises same-key `resolve_or_create` calls through `locks`.
    #[must_use]
    pub fn with_advisory_locks(mut self, locks: AdvisoryLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// The wrapped catalog.
    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Queries for the entity matching `lookup`, returning the first match.
    ///
    /// Zero matches is `Ok(None)`, not an error.
    #[instrument(
        skip_all,
        fields(run_id = %ctx.run_id, kind = %lookup.kind, filter = %lookup.filter)
    )]
    pub async fn find(
        &self,
        ctx: &ReconcileContext,
        lookup: &Lookup,
    ) -> Result<Option<Entity>, ReconcileError> {
        let response = self.catalog.query(ctx, &lookup.to_request()).await?;
        if !response.success() {
            return Err(ReconcileError::QueryRejected {
                kind: lookup.kind,
                errors: response.errors,
            });
        }
        for warning in &response.warnings {
            warn!(%warning, "Query returned a warning");
        }

        let count = response.total_result_count.max(response.results.len() as u64);
        if count > 1 {
            match self.ambiguity {
                AmbiguityPolicy::FirstMatch => {
                    warn!(count, "Lookup matched more than one entity; using the first");
                }
                AmbiguityPolicy::Reject => {
                    return Err(ReconcileError::AmbiguousLookup {
                        kind: lookup.kind,
                        filter: lookup.filter.to_string(),
                        count,
                    });
                }
            }
        }

        let first = response.results.into_iter().next();
        debug!(found = first.is_some(), "Lookup queried");
        Ok(first)
    }

    /// Returns the entity matching `lookup`, creating it from `payload` if
    /// none exists.
    ///
    /// Issues at most one create. The payload is only validated when a create
    /// is needed, so an existing entity is returned even if `payload` would be
    /// rejected.
    #[instrument(
        skip_all,
        fields(run_id = %ctx.run_id, kind = %lookup.kind, filter = %lookup.filter)
    )]
    pub async fn resolve_or_create(
        &self,
        ctx: &ReconcileContext,
        lookup: &Lookup,
        payload: &EntityPayload,
    ) -> Result<Resolution, ReconcileError> {
        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(ctx, lookup).await),
            None => None,
        };

        if let Some(entity) = self.find(ctx, lookup).await? {
            let reference = entity.reference().ok_or_else(|| CatalogError::Decode {
                message: format!("{} query result has no _ref", lookup.kind),
            })?;
            info!(%reference, "Found existing entity");
            return Ok(Resolution {
                reference,
                state: ResolutionState::Found,
                entity,
            });
        }

        payload.validate_for_create(lookup.kind)?;
        let response = self.catalog.create(ctx, lookup.kind, payload).await?;
        if !response.errors.is_empty() {
            warn!(errors = ?response.errors, "Create rejected");
            return Err(ReconcileError::CreateRejected {
                kind: lookup.kind,
                errors: response.errors,
            });
        }
        let (reference, entity) = response
            .object
            .and_then(|e| e.reference().map(|r| (r, e)))
            .ok_or(ReconcileError::MissingReference { kind: lookup.kind })?;

        info!(%reference, "Created entity");
        Ok(Resolution {
            reference,
            state: ResolutionState::Created,
            entity,
        })
    }

    /// Applies `patch` as a partial update to `reference`.
    ///
    /// Remote validation errors are returned in the [`UpdateResult`].
    #[instrument(skip_all, fields(run_id = %ctx.run_id, reference = %reference))]
    pub async fn apply_update(
        &self,
        ctx: &ReconcileContext,
        reference: &EntityRef,
        patch: &EntityPayload,
    ) -> Result<UpdateResult, ReconcileError> {
        let kind = reference
            .type_segment()
            .and_then(|s| s.parse::<EntityKind>().ok())
            .ok_or_else(|| PayloadError::UntypedReference {
                reference: reference.to_string(),
            })?;
        patch.validate_for_update(kind)?;

        let result = UpdateResult::from(self.catalog.update(ctx, reference, patch).await?);
        if result.success {
            info!(fields = patch.len(), "Updated entity");
        } else {
            warn!(errors = ?result.errors, "Update rejected");
        }
        Ok(result)
    }

    /// Creates a child record of `kind` linked to its parent.
    ///
    /// Never queries first: append-only children are not de-duplicated.
    #[instrument(
        skip_all,
        fields(run_id = %ctx.run_id, kind = %kind, parent = %link.parent)
    )]
    pub async fn record_append(
        &self,
        ctx: &ReconcileContext,
        kind: EntityKind,
        link: &ParentLink,
        payload: EntityPayload,
    ) -> Result<AppendResult, ReconcileError> {
        let payload = payload.with(link.field.as_str(), &link.parent);
        payload.validate_for_create(kind)?;

        let response = self.catalog.create(ctx, kind, &payload).await?;
        if let Some(first_error) = response.errors.first().cloned() {
            warn!(%first_error, "Append rejected");
            return Ok(AppendResult::Rejected {
                first_error,
                errors: response.errors,
            });
        }

        let (reference, entity) = response
            .object
            .and_then(|e| e.reference().map(|r| (r, e)))
            .ok_or(ReconcileError::MissingReference { kind })?;
        info!(%reference, "Appended entity");
        Ok(AppendResult::Created { reference, entity })
    }
}
