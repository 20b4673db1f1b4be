//! Connection settings for [`crate::RallyClient`].
//!
//! Session parameters (server, credentials, integration identity) are fixed at
//! construction time. Workspace scope is *not* part of this configuration; it
//! travels with each call in a [`reconcile::ReconcileContext`].

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

/// Default public Rally server.
pub const DEFAULT_SERVER: &str = "https://rally1.rallydev.com";

/// Web Services API version used in every URL.
pub const DEFAULT_API_VERSION: &str = "v2.0";

/// Per-request timeout applied by the HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key sent as the `zsessionid` header. No security token needed.
    ApiKey { key: String },
    /// HTTP basic auth. Creates and updates additionally need a security
    /// token, fetched once per client.
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"***").finish(),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Identifies this integration to the service via `X-RallyIntegration*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

impl Default for IntegrationInfo {
    fn default() -> Self {
        Self {
            name: "BuildSamples".to_string(),
            vendor: "rally-builds".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Everything needed to open a session with the service.
#[derive(Debug, Clone, PartialEq)]
pub struct RallyConfig {
    /// Server root, e.g. `https://rally1.rallydev.com`.
    pub server: String,
    pub api_version: String,
    pub credentials: Credentials,
    pub integration: IntegrationInfo,
    pub timeout: Duration,
}

impl RallyConfig {
    /// Creates a configuration with default API version, integration
    /// identity, and timeout.
    pub fn new(server: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server: server.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            credentials,
            integration: IntegrationInfo::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_integration(mut self, integration: IntegrationInfo) -> Self {
        self.integration = integration;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks the configuration without opening a connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        match &self.credentials {
            Credentials::ApiKey { key } if key.trim().is_empty() => {
                Err(ConfigError::MissingCredentials)
            }
            Credentials::Basic { username, password }
                if username.trim().is_empty() || password.is_empty() =>
            {
                Err(ConfigError::MissingCredentials)
            }
            _ => Ok(()),
        }
    }

    /// Base URL of the Web Services API, always ending in `/`.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let version = self.api_version.trim_matches('/');
        if version.is_empty() || version.contains('/') {
            return Err(ConfigError::InvalidApiVersion(self.api_version.clone()));
        }

        let mut server = self.server.trim().to_string();
        if !server.ends_with('/') {
            server.push('/');
        }
        let base = Url::parse(&server).map_err(|e| ConfigError::InvalidServer {
            server: self.server.clone(),
            message: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidServer {
                server: self.server.clone(),
                message: format!("unsupported scheme '{}'", base.scheme()),
            });
        }
        base.join(&format!("slm/webservice/{version}/"))
            .map_err(|e| ConfigError::InvalidServer {
                server: self.server.clone(),
                message: e.to_string(),
            })
    }
}

/// A configuration that cannot produce a working client.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server URL '{server}': {message}")]
    InvalidServer { server: String, message: String },

    #[error("Invalid API version '{0}'")]
    InvalidApiVersion(String),

    #[error("No credentials configured: set an API key or a username and password")]
    MissingCredentials,

    #[error("Integration header '{name}' has an invalid value")]
    InvalidHeader { name: &'static str },

    #[error("Could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
