//! Rally infrastructure adapter.
//!
//! Implements the [`reconcile::Catalog`] port over the Rally Web Services API
//! (WSAPI v2.0) using [`reqwest`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain reconciliation rules.
//! All service details (URL layout, response envelopes, paging, API-key and
//! basic authentication, security tokens) are handled here; the
//! [`reconcile`] crate never sees them.
//!
//! ## Error Mapping
//!
//! | Condition | [`reconcile::CatalogError`] |
//! |-----------|-----------------------------|
//! | Connection refused, timeout, TLS failure | `Transport` |
//! | HTTP 401 / 403, or no security token issued | `Unauthorized` |
//! | Any other non-2xx status | `Status` |
//! | Body that is not the expected envelope | `Decode` |
//!
//! `Errors` reported *inside* a well-formed envelope are not failures at this
//! layer; they are returned as data on the response.

pub mod client;
pub mod config;
mod wire;

pub use client::RallyClient;
pub use config::{
    ConfigError, Credentials, IntegrationInfo, RallyConfig, DEFAULT_API_VERSION, DEFAULT_SERVER,
    DEFAULT_TIMEOUT,
};
