//! [`RallyClient`]: the [`Catalog`] port over the Rally Web Services API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use reconcile::{
    Catalog, CatalogError, CreateResponse, Entity, EntityKind, EntityPayload, EntityRef,
    QueryRequest, QueryResponse, ReconcileContext, UpdateResponse,
};

use crate::config::{ConfigError, Credentials, RallyConfig};
use crate::wire::{CreateEnvelope, OperationEnvelope, QueryEnvelope};

/// Largest page the service will return.
const MAX_PAGE_SIZE: u32 = 2000;

/// Longest response body kept in a [`CatalogError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for one Rally session.
///
/// Holds the session (server, credentials, integration headers, and the
/// cached security token) but no workspace state: workspace scope comes from
/// the [`ReconcileContext`] of each call. Calls are never retried.
pub struct RallyClient {
    http: reqwest::Client,
    endpoint: Url,
    credentials: Credentials,
    security_token: OnceCell<String>,
}

impl std::fmt::Debug for RallyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RallyClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("credentials", &self.credentials)
            .field(
                "security_token",
                &self.security_token.get().map(|_| "***"),
            )
            .finish_non_exhaustive()
    }
}

impl RallyClient {
    /// Builds a client from a validated configuration.
    pub fn new(config: RallyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-rallyintegrationname", config.integration.name.as_str()),
            ("x-rallyintegrationvendor", config.integration.vendor.as_str()),
            ("x-rallyintegrationversion", config.integration.version.as_str()),
            ("x-rallyintegrationlibrary", "rally-builds (reqwest)"),
        ] {
            let value =
                HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader { name })?;
            headers.insert(name, value);
        }
        if let Credentials::ApiKey { key } = &config.credentials {
            let mut value = HeaderValue::from_str(key)
                .map_err(|_| ConfigError::InvalidHeader { name: "zsessionid" })?;
            value.set_sensitive(true);
            headers.insert("zsessionid", value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            credentials: config.credentials,
            security_token: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, CatalogError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| CatalogError::InvalidRequest {
                message: format!("cannot build URL for '{path}': {e}"),
            })
    }

    fn ref_url(&self, reference: &EntityRef) -> Result<Url, CatalogError> {
        if reference.is_absolute() {
            Url::parse(reference.as_str()).map_err(|e| CatalogError::InvalidRequest {
                message: format!("invalid ref '{reference}': {e}"),
            })
        } else {
            self.url(reference.as_str())
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.credentials {
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
            Credentials::ApiKey { .. } => req,
        }
    }

    /// Security token required on writes under basic auth.
    async fn write_key(&self) -> Result<Option<&str>, CatalogError> {
        if matches!(self.credentials, Credentials::ApiKey { .. }) {
            return Ok(None);
        }
        let token = self
            .security_token
            .get_or_try_init(|| async {
                let url = self.url("security/authorize")?;
                let env: OperationEnvelope = self.send(self.request(Method::GET, url)).await?;
                let body = env.operation_result;
                match body.security_token {
                    Some(token) if body.errors.is_empty() => {
                        debug!("Obtained security token");
                        Ok(token)
                    }
                    _ => Err(CatalogError::Unauthorized { status: 401 }),
                }
            })
            .await?;
        Ok(Some(token.as_str()))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, CatalogError> {
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CatalogError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| CatalogError::Decode {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Catalog for RallyClient {
    #[instrument(
        skip_all,
        fields(run_id = %ctx.run_id, kind = %request.kind, filter = %request.filter)
    )]
    async fn query(
        &self,
        ctx: &ReconcileContext,
        request: &QueryRequest,
    ) -> Result<QueryResponse, CatalogError> {
        let url = self.url(request.kind.type_name())?;
        let page_size = request.page_size.clamp(1, MAX_PAGE_SIZE);
        let limit = request.limit.max(1) as usize;
        let mut out = QueryResponse::default();
        let mut start: u64 = 1;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("query", request.filter.to_string()),
                ("pagesize", page_size.to_string()),
                ("start", start.to_string()),
            ];
            if !request.fetch.is_empty() {
                params.push(("fetch", request.fetch.to_string()));
            }
            if let Some(workspace) = &ctx.workspace {
                params.push(("workspace", workspace.to_string()));
            }

            debug!(start, page_size, "Querying page");
            let env: QueryEnvelope = self
                .send(self.request(Method::GET, url.clone()).query(&params))
                .await?;
            let page = env.query_result;

            out.total_result_count = page.total_result_count;
            out.warnings.extend(page.warnings);
            if !page.errors.is_empty() {
                out.errors = page.errors;
                break;
            }

            let received = page.results.len() as u64;
            let room = limit.saturating_sub(out.results.len());
            out.results
                .extend(page.results.into_iter().filter_map(Entity::from_value).take(room));

            let next = start + received;
            if out.results.len() >= limit || received == 0 || next > page.total_result_count {
                break;
            }
            start = next;
        }

        debug!(
            total = out.total_result_count,
            returned = out.results.len(),
            "Query complete"
        );
        Ok(out)
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, kind = %kind))]
    async fn create(
        &self,
        ctx: &ReconcileContext,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> Result<CreateResponse, CatalogError> {
        let url = self.url(&format!("{}/create", kind.type_name()))?;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(key) = self.write_key().await? {
            params.push(("key", key.to_string()));
        }
        if let Some(workspace) = &ctx.workspace {
            params.push(("workspace", workspace.to_string()));
        }

        let body = envelope(kind.type_name(), payload);
        let env: CreateEnvelope = self
            .send(self.request(Method::POST, url).query(&params).json(&body))
            .await?;
        let (object, errors, warnings) = env.create_result.into_entity();
        for warning in &warnings {
            warn!(%warning, "Create returned a warning");
        }
        Ok(CreateResponse {
            object,
            errors,
            warnings,
        })
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, reference = %reference))]
    async fn update(
        &self,
        ctx: &ReconcileContext,
        reference: &EntityRef,
        payload: &EntityPayload,
    ) -> Result<UpdateResponse, CatalogError> {
        let segment = reference
            .type_segment()
            .ok_or_else(|| CatalogError::InvalidRequest {
                message: format!("cannot determine entity type of '{reference}'"),
            })?;
        // Absolute refs may use any case; send the canonical name when known.
        let type_name = segment
            .parse::<EntityKind>()
            .map(|kind| kind.type_name().to_string())
            .unwrap_or_else(|_| segment.to_string());
        let url = self.ref_url(reference)?;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(key) = self.write_key().await? {
            params.push(("key", key.to_string()));
        }

        let body = envelope(&type_name, payload);
        let env: OperationEnvelope = self
            .send(self.request(Method::POST, url).query(&params).json(&body))
            .await?;
        let (object, errors, warnings) = env.operation_result.into_entity();
        for warning in &warnings {
            warn!(%warning, "Update returned a warning");
        }
        Ok(UpdateResponse {
            object,
            errors,
            warnings,
        })
    }
}

fn transport_error(e: reqwest::Error) -> CatalogError {
    if e.is_decode() {
        return CatalogError::Decode {
            message: e.to_string(),
        };
    }
    CatalogError::Transport {
        message: e.to_string(),
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Wraps a payload as `{ "<type>": { ...fields } }`, the shape writes expect.
fn envelope(type_name: &str, payload: &EntityPayload) -> Value {
    let mut map = Map::new();
    map.insert(type_name.to_string(), payload.to_json());
    Value::Object(map)
}
