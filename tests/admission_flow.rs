//! End-to-end exchanges through the proxy against a stub orchestrator

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use jobgate::admission::{build_mutators, build_validators, JobHandler};
use jobgate::config::{MutatorConfig, RuleConfig, ValidatorConfig};
use jobgate::proxy::{proxy_router, ProxyState};

/// Canned responses plus a log of every job submission body the stub saw
#[derive(Clone)]
struct StubUpstream {
    register_response: Value,
    validate_response: Value,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl StubUpstream {
    fn new(register_response: Value, validate_response: Value) -> Self {
        Self {
            register_response,
            validate_response,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

async fn stub_register(State(state): State<StubUpstream>, Json(body): Json<Value>) -> Json<Value> {
    state.seen.lock().unwrap().push(body);
    Json(state.register_response.clone())
}

async fn stub_validate(State(state): State<StubUpstream>, Json(body): Json<Value>) -> Json<Value> {
    state.seen.lock().unwrap().push(body);
    Json(state.validate_response.clone())
}

async fn spawn_upstream(stub: StubUpstream) -> SocketAddr {
    let app = Router::new()
        .route("/v1/jobs", put(stub_register))
        .route("/v1/job/{name}", put(stub_register))
        .route("/v1/job/{name}/plan", put(stub_register))
        .route("/v1/validate/job", put(stub_validate))
        .route("/v1/status/leader", get(|| async { "\"127.0.0.1:4647\"" }))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn proxy_to(
    addr: SocketAddr,
    mutators: &[MutatorConfig],
    validators: &[ValidatorConfig],
) -> Router {
    let handler = JobHandler::new(
        build_mutators(mutators).unwrap(),
        build_validators(validators).unwrap(),
    );
    let state = Arc::new(ProxyState {
        upstream: reqwest::Url::parse(&format!("http://{addr}")).unwrap(),
        client: reqwest::Client::new(),
        handler,
    });
    proxy_router(state)
}

fn patch_mutator(name: &str) -> MutatorConfig {
    MutatorConfig {
        kind: "opa_json_patch".to_string(),
        name: name.to_string(),
        rules: vec![RuleConfig {
            module: "testdata/opa/mutators/hello_world_meta.rego".to_string(),
            query: "patch = data.hello_world_meta.patch".to_string(),
        }],
        webhook: None,
    }
}

fn warning_mutator(name: &str) -> MutatorConfig {
    MutatorConfig {
        kind: "opa_json_patch".to_string(),
        name: name.to_string(),
        rules: vec![RuleConfig {
            module: "testdata/opa/errors.rego".to_string(),
            query: "warnings = data.dummy.warnings".to_string(),
        }],
        webhook: None,
    }
}

fn error_mutator(name: &str) -> MutatorConfig {
    MutatorConfig {
        kind: "opa_json_patch".to_string(),
        name: name.to_string(),
        rules: vec![RuleConfig {
            module: "testdata/opa/errors.rego".to_string(),
            query: "errors = data.dummy.errors".to_string(),
        }],
        webhook: None,
    }
}

fn blocking_validator(name: &str) -> ValidatorConfig {
    ValidatorConfig {
        kind: "opa".to_string(),
        name: name.to_string(),
        rules: vec![RuleConfig {
            module: "testdata/opa/errors.rego".to_string(),
            query: "errors = data.dummy.errors".to_string(),
        }],
        webhook: None,
    }
}

fn put_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn register_without_rules_passes_through() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 7}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[], &[]);

    let response = proxy
        .oneshot(put_json("/v1/jobs", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!({"JobModifyIndex": 7}));

    // The upstream saw the job unchanged.
    assert_eq!(stub.seen(), vec![json!({"Job": {"ID": "demo"}})]);
}

#[tokio::test]
async fn register_applies_the_patch_before_forwarding() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 7}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[patch_mutator("hello-world")], &[]);

    let response = proxy
        .oneshot(put_json(
            "/v1/jobs",
            &json!({"Job": {"ID": "demo"}, "EnforceIndex": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        stub.seen(),
        vec![json!({
            "Job": {"ID": "demo", "Meta": {"hello": "world"}},
            "EnforceIndex": true
        })]
    );
}

#[tokio::test]
async fn register_surfaces_rule_warnings() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 7}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(
        addr,
        &[patch_mutator("hello-world"), warning_mutator("notices")],
        &[],
    );

    let response = proxy
        .oneshot(put_json("/v1/jobs", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["Warnings"], "This is a warning message (notices)");
    assert_eq!(
        stub.seen()[0]["Job"],
        json!({"ID": "demo", "Meta": {"hello": "world"}})
    );
}

#[tokio::test]
async fn register_merges_upstream_and_local_warnings() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 7, "Warnings": "x"}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[warning_mutator("r")], &[]);

    let response = proxy
        .oneshot(put_json("/v1/jobs", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    let body = response_json(response).await;
    assert_eq!(
        body["Warnings"],
        "2 warning(s):\n* x\n* This is a warning message (r)"
    );
}

#[tokio::test]
async fn register_rejects_on_rule_error_without_forwarding() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 7}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(
        addr,
        &[patch_mutator("hello-world"), error_mutator("lockdown")],
        &[],
    );

    let response = proxy
        .oneshot(put_json("/v1/jobs", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("forbidden (lockdown)"));

    assert!(stub.seen().is_empty(), "rejected job must not reach upstream");
}

#[tokio::test]
async fn update_and_plan_paths_are_intercepted() {
    let stub = StubUpstream::new(json!({"JobModifyIndex": 9}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;

    let proxy = proxy_to(addr, &[patch_mutator("hello-world")], &[]);
    let response = proxy
        .oneshot(put_json("/v1/job/demo", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let proxy = proxy_to(addr, &[warning_mutator("planner")], &[]);
    let response = proxy
        .oneshot(put_json(
            "/v1/job/demo/plan",
            &json!({"Job": {"ID": "demo"}, "Diff": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["Warnings"], "This is a warning message (planner)");

    let seen = stub.seen();
    assert_eq!(seen[0]["Job"]["Meta"], json!({"hello": "world"}));
    assert_eq!(seen[1]["Diff"], json!(true));
}

#[tokio::test]
async fn validate_carries_validation_errors_in_the_body() {
    let stub = StubUpstream::new(json!({}), json!({"DriverConfigValidated": true}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[], &[blocking_validator("lockdown")]);

    let response = proxy
        .oneshot(put_json("/v1/validate/job", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    // Validation failures are not HTTP failures on this endpoint.
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["ValidationErrors"], json!(["forbidden (lockdown)"]));
    assert_eq!(body["Error"], "forbidden (lockdown)");
    assert_eq!(body["DriverConfigValidated"], json!(true));

    // The job was still forwarded for the upstream's own validation.
    assert_eq!(stub.seen().len(), 1);
}

#[tokio::test]
async fn validate_reports_mutation_warnings_alongside_errors() {
    let stub = StubUpstream::new(json!({}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(
        addr,
        &[warning_mutator("notices")],
        &[blocking_validator("lockdown")],
    );

    let response = proxy
        .oneshot(put_json("/v1/validate/job", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["Warnings"], "This is a warning message (notices)");
    assert_eq!(body["ValidationErrors"], json!(["forbidden (lockdown)"]));
}

#[tokio::test]
async fn unrelated_requests_pass_through() {
    let stub = StubUpstream::new(json!({}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[error_mutator("lockdown")], &[]);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/status/leader")
        .body(Body::empty())
        .unwrap();
    let response = proxy.oneshot(request).await.unwrap();

    // Even with a rejecting mutator configured, unrelated paths are untouched.
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"\"127.0.0.1:4647\"");
    assert!(stub.seen().is_empty());
}

#[tokio::test]
async fn malformed_submission_is_rejected_with_500() {
    let stub = StubUpstream::new(json!({}), json!({}));
    let addr = spawn_upstream(stub.clone()).await;
    let proxy = proxy_to(addr, &[], &[]);

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/jobs")
        .header("content-type", "application/json")
        .body(Body::from("this is not json"))
        .unwrap();
    let response = proxy.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(stub.seen().is_empty());
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    // Nothing listens on this address.
    let proxy = proxy_to("127.0.0.1:1".parse().unwrap(), &[], &[]);

    let response = proxy
        .oneshot(put_json("/v1/jobs", &json!({"Job": {"ID": "demo"}})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
