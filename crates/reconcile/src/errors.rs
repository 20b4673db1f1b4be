//! Error types for the reconciliation domain.
//!
//! [`CatalogError`] is what a [`crate::Catalog`] implementation reports when a
//! call could not be completed at all (network, authentication, malformed
//! responses). It is always a hard failure and is never retried here.
//!
//! [`ReconcileError`] is what the [`crate::Reconciler`] reports. Remote
//! validation errors on updates and appended children are *not* errors: they
//! come back as data in [`crate::UpdateResult`] and [`crate::AppendResult`].

use thiserror::Error;

use crate::entities::{EntityKind, PayloadError};

// ---------------------------------------------------------------------------
// Transport failures
// ---------------------------------------------------------------------------

/// A catalog call that failed to complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The request never produced an HTTP response (DNS, connect, timeout).
    #[error("Transport failure: {message}")]
    Transport {
        /// Description of the underlying failure.
        message: String,
    },

    /// The service rejected the credentials.
    #[error("Authentication rejected by the service (HTTP {status})")]
    Unauthorized {
        /// HTTP status code (401 or 403).
        status: u16,
    },

    /// The service answered with an unexpected non-success status.
    #[error("Unexpected HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Malformed response: {message}")]
    Decode {
        /// Description of the decoding problem.
        message: String,
    },

    /// The request could not be formed (e.g. a ref that is not a valid URL).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Reconciler failures
// ---------------------------------------------------------------------------

/// Errors surfaced by [`crate::Reconciler`] operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The underlying catalog call failed; no retry was attempted.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The payload failed local schema validation; nothing was sent.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// The service answered a query with errors.
    #[error("Query for {kind} failed: {}", .errors.join("; "))]
    QueryRejected {
        /// Entity kind queried.
        kind: EntityKind,
        /// Errors reported by the service.
        errors: Vec<String>,
    },

    /// A natural-key lookup matched more than one entity under
    /// [`crate::AmbiguityPolicy::Reject`].
    #[error("Lookup {filter} on {kind} matched {count} entities")]
    AmbiguousLookup {
        /// Entity kind queried.
        kind: EntityKind,
        /// Rendered filter.
        filter: String,
        /// Total matches reported by the service.
        count: u64,
    },

    /// `resolve_or_create` needed to create the entity and the service
    /// rejected the payload.
    #[error("Create {kind} rejected: {}", .errors.join("; "))]
    CreateRejected {
        /// Entity kind being created.
        kind: EntityKind,
        /// Errors reported by the service.
        errors: Vec<String>,
    },

    /// A create reported no errors but returned no ref.
    #[error("Create {kind} returned no reference")]
    MissingReference {
        /// Entity kind being created.
        kind: EntityKind,
    },
}
