//! The remote catalog port.
//!
//! [`Catalog`] is the only boundary the [`crate::Reconciler`] talks to.
//! Infrastructure crates implement it over a real transport; the
//! [`crate::memory`] module implements it in process for tests.
//!
//! Workspace scope travels in a [`ReconcileContext`] passed to every call, so
//! an implementation never holds per-workspace state and one instance can
//! serve any number of workspaces.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entities::EntityKind;
use crate::errors::CatalogError;
use crate::types::{CreateResponse, EntityPayload, QueryRequest, QueryResponse, UpdateResponse};
use crate::{EntityRef, RunId};

/// Per-call scope: which run issued the call and which workspace it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    /// Correlates every call made by one invocation.
    pub run_id: RunId,
    /// Workspace scope; `None` for calls that locate the workspace itself.
    pub workspace: Option<EntityRef>,
}

impl ReconcileContext {
    /// A context with no workspace scope.
    pub fn unscoped(run_id: RunId) -> Self {
        Self {
            run_id,
            workspace: None,
        }
    }

    /// Returns a copy of this context scoped to `workspace`.
    #[must_use]
    pub fn in_workspace(&self, workspace: EntityRef) -> Self {
        Self {
            run_id: self.run_id,
            workspace: Some(workspace),
        }
    }
}

/// Query, create, and update access to a remote record store.
///
/// Implementations report calls that could not complete as [`CatalogError`].
/// Calls that completed but were rejected by the service return `Ok` with a
/// non-empty `errors` list.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Runs a filtered query, returning at most `request.limit` results.
    async fn query(
        &self,
        ctx: &ReconcileContext,
        request: &QueryRequest,
    ) -> Result<QueryResponse, CatalogError>;

    /// Creates one record of `kind` from `payload`.
    async fn create(
        &self,
        ctx: &ReconcileContext,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> Result<CreateResponse, CatalogError>;

    /// Applies `payload` as a partial update to the record at `reference`.
    async fn update(
        &self,
        ctx: &ReconcileContext,
        reference: &EntityRef,
        payload: &EntityPayload,
    ) -> Result<UpdateResponse, CatalogError>;
}

#[async_trait]
impl<C: Catalog + ?Sized> Catalog for Arc<C> {
    async fn query(
        &self,
        ctx: &ReconcileContext,
        request: &QueryRequest,
    ) -> Result<QueryResponse, CatalogError> {
        (**self).query(ctx, request).await
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> Result<CreateResponse, CatalogError> {
        (**self).create(ctx, kind, payload).await
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        reference: &EntityRef,
        payload: &EntityPayload,
    ) -> Result<UpdateResponse, CatalogError> {
        (**self).update(ctx, reference, payload).await
    }
}
