use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rally::{Credentials, RallyClient, RallyConfig};
use reconcile::{
    AppendResult, BuildSpec, BuildStatus, Catalog, CatalogError, EntityKind, EntityPayload,
    EntityRef, Fetch, Lookup, ParentLink, QueryFilter, QueryRequest, ReconcileContext, Reconciler,
    ResolutionState, RunId,
};

const BASE: &str = "/slm/webservice/v2.0";

fn api_key_client(server: &MockServer) -> RallyClient {
    RallyClient::new(
        RallyConfig::new(
            server.uri(),
            Credentials::ApiKey {
                key: "_secret".into(),
            },
        )
        .with_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

fn basic_client(server: &MockServer) -> RallyClient {
    RallyClient::new(RallyConfig::new(
        server.uri(),
        Credentials::Basic {
            username: "user".into(),
            password: "pass".into(),
        },
    ))
    .unwrap()
}

fn ctx() -> ReconcileContext {
    ReconcileContext::unscoped(RunId::new_random())
}

fn scoped() -> ReconcileContext {
    ctx().in_workspace(EntityRef::new("/workspace/1").unwrap())
}

fn project_row(id: u64, name: &str) -> serde_json::Value {
    json!({
        "_ref": format!("https://rally1.rallydev.com{BASE}/project/{id}"),
        "_refObjectName": name,
        "Name": name
    })
}

fn query_result(total: u64, rows: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "QueryResult": {
            "Errors": [],
            "Warnings": [],
            "TotalResultCount": total,
            "StartIndex": 1,
            "PageSize": 5,
            "Results": rows
        }
    })
}

fn created(reference: &str) -> serde_json::Value {
    json!({
        "CreateResult": {
            "Errors": [],
            "Warnings": [],
            "Object": { "_ref": reference, "_refObjectName": "Build 1" }
        }
    })
}

// ---------------------------------------------------------------------------
// query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_query_sends_filter_fetch_paging_and_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/project")))
        .and(query_param("query", "(Name = \"Private Banking\")"))
        .and(query_param("fetch", "Name"))
        .and(query_param("pagesize", "5"))
        .and(query_param("start", "1"))
        .and(query_param("workspace", "/workspace/1"))
        .and(header("zsessionid", "_secret"))
        .and(header("x-rallyintegrationname", "BuildSamples"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(query_result(1, vec![project_row(9, "Private Banking")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = api_key_client(&server);
    let request = QueryRequest::new(
        EntityKind::Project,
        QueryFilter::eq("Name", "Private Banking"),
        Fetch::new(["Name"]),
    );
    let response = client.query(&scoped(), &request).await.unwrap();

    assert!(response.success());
    assert_eq!(response.total_result_count, 1);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].name(), Some("Private Banking"));
    assert_eq!(
        response.results[0].reference().unwrap().object_id(),
        Some("9")
    );
}

#[tokio::test]
async fn test_query_follows_pages_until_total_is_reached() {
    let server = MockServer::start().await;
    let first: Vec<_> = (1..=5).map(|i| project_row(i, "P")).collect();
    let second: Vec<_> = (6..=7).map(|i| project_row(i, "P")).collect();
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/project")))
        .and(query_param("start", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_result(7, first)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/project")))
        .and(query_param("start", "6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_result(7, second)))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = QueryRequest::new(
        EntityKind::Project,
        QueryFilter::eq("Name", "P"),
        Fetch::new(["Name"]),
    );
    request.limit = 100;
    let response = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap();

    assert_eq!(response.total_result_count, 7);
    assert_eq!(response.results.len(), 7);
}

#[tokio::test]
async fn test_query_stops_at_the_limit() {
    let server = MockServer::start().await;
    let rows: Vec<_> = (1..=5).map(|i| project_row(i, "P")).collect();
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/project")))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_result(40, rows)))
        .expect(1)
        .mount(&server)
        .await;

    let request = QueryRequest::new(
        EntityKind::Project,
        QueryFilter::eq("Name", "P"),
        Fetch::new(["Name"]),
    );
    let response = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap();

    assert_eq!(response.total_result_count, 40);
    assert_eq!(response.results.len(), 5);
}

#[tokio::test]
async fn test_query_errors_are_returned_as_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/hierarchicalrequirement")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "QueryResult": {
                "Errors": ["Could not parse: Unknown operator"],
                "Warnings": [],
                "TotalResultCount": 0,
                "Results": []
            }
        })))
        .mount(&server)
        .await;

    let request = QueryRequest::new(
        EntityKind::HierarchicalRequirement,
        QueryFilter::eq("FormattedID", "US1"),
        Fetch::new(["Name"]),
    );
    let response = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap();

    assert!(!response.success());
    assert_eq!(response.errors, vec!["Could not parse: Unknown operator"]);
}

// ---------------------------------------------------------------------------
// create / update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_wraps_payload_in_type_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/builddefinition/create")))
        .and(query_param("workspace", "/workspace/1"))
        .and(body_json(json!({
            "builddefinition": { "Name": "Build 1", "Project": "/project/9" }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(created("/builddefinition/3")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let payload = EntityPayload::new()
        .with("Name", "Build 1")
        .with("Project", "/project/9");
    let response = api_key_client(&server)
        .create(&scoped(), EntityKind::BuildDefinition, &payload)
        .await
        .unwrap();

    assert!(response.errors.is_empty());
    assert_eq!(
        response.reference(),
        Some(EntityRef::new("/builddefinition/3").unwrap())
    );
}

#[tokio::test]
async fn test_create_rejection_is_returned_as_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/build/create")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "CreateResult": {
                "Errors": ["Validation error: Build.Status should not be null"],
                "Warnings": []
            }
        })))
        .mount(&server)
        .await;

    let payload = EntityPayload::new().with("Number", "99");
    let response = api_key_client(&server)
        .create(&ctx(), EntityKind::Build, &payload)
        .await
        .unwrap();

    assert!(response.object.is_none());
    assert_eq!(
        response.errors,
        vec!["Validation error: Build.Status should not be null"]
    );
}

#[tokio::test]
async fn test_update_posts_patch_to_the_ref() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/hierarchicalrequirement/5")))
        .and(body_json(json!({
            "hierarchicalrequirement": { "c_DeploymentKanban": "In Dev" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "OperationResult": {
                "Errors": [],
                "Warnings": [],
                "Object": {
                    "_ref": "/hierarchicalrequirement/5",
                    "c_DeploymentKanban": "In Dev"
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reference = EntityRef::new(format!("{}{BASE}/hierarchicalrequirement/5", server.uri()))
        .unwrap();
    let patch = EntityPayload::new().with("c_DeploymentKanban", "In Dev");
    let response = api_key_client(&server)
        .update(&ctx(), &reference, &patch)
        .await
        .unwrap();

    assert!(response.errors.is_empty());
    assert_eq!(
        response.object.unwrap().get_str("c_DeploymentKanban"),
        Some("In Dev")
    );
}

// ---------------------------------------------------------------------------
// basic auth and security tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_basic_auth_fetches_security_token_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/security/authorize")))
        // base64("user:pass")
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "OperationResult": { "Errors": [], "Warnings": [], "SecurityToken": "tok-1" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/build/create")))
        .and(query_param("key", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(created("/build/10")))
        .expect(2)
        .mount(&server)
        .await;

    let client = basic_client(&server);
    let payload = EntityPayload::new().with("Number", "1");
    for _ in 0..2 {
        let response = client
            .create(&ctx(), EntityKind::Build, &payload)
            .await
            .unwrap();
        assert!(response.errors.is_empty());
    }
}

#[tokio::test]
async fn test_missing_security_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/security/authorize")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "OperationResult": { "Errors": ["Not authorized"], "Warnings": [] }
        })))
        .mount(&server)
        .await;

    let err = basic_client(&server)
        .create(&ctx(), EntityKind::Build, &EntityPayload::new().with("Number", "1"))
        .await
        .unwrap_err();

    assert_eq!(err, CatalogError::Unauthorized { status: 401 });
}

// ---------------------------------------------------------------------------
// failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_http_401_maps_to_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let request = QueryRequest::new(
        EntityKind::Workspace,
        QueryFilter::eq("Name", "DBS"),
        Fetch::new(["Name"]),
    );
    let err = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap_err();

    assert_eq!(err, CatalogError::Unauthorized { status: 401 });
}

#[tokio::test]
async fn test_server_error_maps_to_status_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let request = QueryRequest::new(
        EntityKind::Workspace,
        QueryFilter::eq("Name", "DBS"),
        Fetch::new(["Name"]),
    );
    let err = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        CatalogError::Status {
            status: 503,
            body: "maintenance".into()
        }
    );
}

#[tokio::test]
async fn test_malformed_body_maps_to_decode() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let request = QueryRequest::new(
        EntityKind::Workspace,
        QueryFilter::eq("Name", "DBS"),
        Fetch::new(["Name"]),
    );
    let err = api_key_client(&server)
        .query(&ctx(), &request)
        .await
        .unwrap_err();

    assert!(matches!(err, CatalogError::Decode { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_connection_refused_maps_to_transport() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = RallyClient::new(
        RallyConfig::new(
            format!("http://127.0.0.1:{port}"),
            Credentials::ApiKey { key: "_k".into() },
        )
        .with_timeout(Duration::from_secs(5)),
    )
    .unwrap();

    let request = QueryRequest::new(
        EntityKind::Workspace,
        QueryFilter::eq("Name", "DBS"),
        Fetch::new(["Name"]),
    );
    let err = client.query(&ctx(), &request).await.unwrap_err();

    assert!(matches!(err, CatalogError::Transport { .. }), "got {err:?}");
}

// ---------------------------------------------------------------------------
// reconciler over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reconciler_creates_definition_then_appends_build() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/builddefinition")))
        .and(query_param("query", "((Name = \"Build 1\") AND (Project = /project/9))"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_result(0, vec![])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/builddefinition/create")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(created("/builddefinition/3")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{BASE}/build/create")))
        .and(body_json(json!({
            "build": {
                "BuildDefinition": "/builddefinition/3",
                "Duration": 1.0,
                "Message": "A failing build",
                "Number": "99",
                "Status": "FAILURE"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(created("/build/20")))
        .expect(1)
        .mount(&server)
        .await;

    let rec = Reconciler::new(api_key_client(&server));
    let ctx = scoped();
    let project = EntityRef::new("/project/9").unwrap();
    let lookup = Lookup::new(
        EntityKind::BuildDefinition,
        QueryFilter::eq("Name", "Build 1").and(QueryFilter::eq("Project", project.as_str())),
    );
    let payload = EntityPayload::new()
        .with("Name", "Build 1")
        .with("Project", &project);

    let definition = rec.resolve_or_create(&ctx, &lookup, &payload).await.unwrap();
    assert_eq!(definition.state, ResolutionState::Created);

    let build = BuildSpec {
        duration: 1.0,
        message: "A failing build".into(),
        number: "99".into(),
        status: BuildStatus::Failure,
        uri: None,
        start: None,
    };
    let appended = rec
        .record_append(
            &ctx,
            EntityKind::Build,
            &ParentLink::new("BuildDefinition", definition.reference),
            build.to_payload(),
        )
        .await
        .unwrap();

    assert!(matches!(appended, AppendResult::Created { .. }));
    assert_eq!(appended.reference().and_then(EntityRef::object_id), Some("20"));
}
