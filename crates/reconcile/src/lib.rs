//! Reconciliation domain for Rally build tracking.
//!
//! This crate owns the find-or-create workflow: look an entity up by its
//! natural key, create it if absent, otherwise act on the existing record.
//! Infrastructure crates implement the [`Catalog`] port defined here; they
//! never add reconciliation rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`EntityRef`, `RunId`) |
//! | [`types`] | Payloads, filters, fetch lists, request/response values |
//! | [`entities`] | Entity kinds, field schemas, typed payload builders |
//! | [`catalog`] | The `Catalog` port and per-call `ReconcileContext` |
//! | [`reconciler`] | `Reconciler`: find, resolve-or-create, update, append |
//! | [`memory`] | `InMemoryCatalog`, an in-process `Catalog` |
//! | [`errors`] | `CatalogError` and `ReconcileError` |

pub mod catalog;
pub mod entities;
pub mod errors;
pub mod identifiers;
pub mod memory;
pub mod reconciler;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use catalog::{Catalog, ReconcileContext};
pub use entities::{
    BuildDefinitionSpec, BuildSpec, BuildStatus, EntityKind, FieldSchema, PayloadError,
    UnknownEntityKind,
};
pub use errors::{CatalogError, ReconcileError};
pub use identifiers::{EntityRef, RunId};
pub use memory::{CallCounts, InMemoryCatalog};
pub use reconciler::{
    AdvisoryLocks, AmbiguityPolicy, AppendResult, Lookup, ParentLink, Reconciler, Resolution,
    ResolutionState,
};
pub use types::{
    CreateResponse, Entity, EntityPayload, Fetch, FieldValue, Operator, QueryFilter, QueryRequest,
    QueryResponse, Timestamp, UpdateResponse, UpdateResult, ValueKind, LOOKUP_PAGE_SIZE,
};
