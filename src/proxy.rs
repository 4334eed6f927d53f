//! HTTP interception and forwarding
//!
//! Classifies each request by method and path. Job submissions (register,
//! plan, validate) are decoded, run through the admission pipeline, rewritten
//! and forwarded; their responses come back through the matching rewrite that
//! folds admission warnings (and, for validate, validation errors) into the
//! upstream body. Every other request is relayed untouched.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, CONTENT_LENGTH, HOST};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::admission::{merge_warnings, AggregateError, JobHandler};
use crate::error::{Error, Result};

/// Shared state for the proxy handler
pub struct ProxyState {
    /// Base URL of the upstream orchestrator
    pub upstream: reqwest::Url,
    /// Shared upstream transport
    pub client: reqwest::Client,
    /// The admission pipeline
    pub handler: JobHandler,
}

/// The intercepted request kinds; anything else passes through untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    /// Job create (`PUT /v1/jobs`) or update (`PUT /v1/job/<name>`)
    Register,
    /// `PUT /v1/job/<name>/plan`
    Plan,
    /// `PUT /v1/validate/job`
    Validate,
}

/// Pipeline outputs produced before the upstream round-trip and consumed by
/// the response rewrite. Lives for one exchange only.
#[derive(Debug, Default)]
struct AdmissionOutputs {
    warnings: Vec<String>,
    validation_error: Option<AggregateError>,
}

impl AdmissionOutputs {
    fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.validation_error.is_none()
    }
}

/// Request envelope shared by the register, plan and validate endpoints: the
/// job plus whatever other fields the client sent, preserved verbatim.
#[derive(Debug, Serialize, Deserialize)]
struct JobEnvelope {
    #[serde(rename = "Job")]
    job: Value,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Response shape shared by the register and plan endpoints
#[derive(Debug, Serialize, Deserialize)]
struct JobRegisterResponse {
    #[serde(rename = "JobModifyIndex", default)]
    job_modify_index: u64,
    #[serde(rename = "Warnings", default, skip_serializing_if = "String::is_empty")]
    warnings: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Response shape of the validate endpoint
#[derive(Debug, Serialize, Deserialize)]
struct JobValidateResponse {
    #[serde(
        rename = "ValidationErrors",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    validation_errors: Vec<String>,
    #[serde(rename = "Error", default, skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(rename = "Warnings", default, skip_serializing_if = "String::is_empty")]
    warnings: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Build the proxy router: a single fallback handler owns every path
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    info!(%method, %path, "request received");

    match handle_exchange(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(%method, %path, error = %err, "request failed");
            err.into_response()
        }
    }
}

async fn handle_exchange(state: &ProxyState, request: Request) -> Result<Response> {
    let kind = classify(request.method(), request.uri().path());
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::Proxy(format!("failed to read request body: {e}")))?;

    let mut outputs = AdmissionOutputs::default();
    let body = match kind {
        Some(RequestKind::Register) | Some(RequestKind::Plan) => {
            admit_job_submission(state, &body, &mut outputs).await?
        }
        Some(RequestKind::Validate) => admit_job_validation(state, &body, &mut outputs).await?,
        None => body,
    };

    let upstream = forward(state, &parts, body).await?;
    rewrite_response(kind, &outputs, upstream).await
}

/// Register/plan interception: the full pipeline runs and any error rejects
/// the request before it reaches the upstream.
async fn admit_job_submission(
    state: &ProxyState,
    body: &[u8],
    outputs: &mut AdmissionOutputs,
) -> Result<Bytes> {
    let mut envelope: JobEnvelope = serde_json::from_slice(body)
        .map_err(|e| Error::Decode(format!("failed to decode job submission: {e}")))?;

    let (job, warnings) = state
        .handler
        .apply_admission_controllers(&envelope.job)
        .await?;
    envelope.job = job;
    outputs.warnings = warnings;

    debug!(warnings = outputs.warnings.len(), "job admitted");
    encode_envelope(&envelope)
}

/// Validate interception: mutator errors still fail the exchange, but
/// validator errors ride along in the response body the way the upstream
/// reports its own validation results.
async fn admit_job_validation(
    state: &ProxyState,
    body: &[u8],
    outputs: &mut AdmissionOutputs,
) -> Result<Bytes> {
    let mut envelope: JobEnvelope = serde_json::from_slice(body)
        .map_err(|e| Error::Decode(format!("failed to decode job submission: {e}")))?;

    let (job, mut warnings) = state.handler.admission_mutators(&envelope.job).await?;
    envelope.job = job;

    let (validator_warnings, validation_error) =
        state.handler.admission_validators(&envelope.job).await;
    warnings.extend(validator_warnings);
    outputs.warnings = warnings;
    outputs.validation_error = validation_error;

    encode_envelope(&envelope)
}

fn encode_envelope(envelope: &JobEnvelope) -> Result<Bytes> {
    let data = serde_json::to_vec(envelope)
        .map_err(|e| Error::Proxy(format!("failed to re-encode job submission: {e}")))?;
    Ok(Bytes::from(data))
}

/// Relay the (possibly rewritten) request to the upstream. The shared client
/// recomputes the content length; hop-by-hop headers stay on this hop.
async fn forward(state: &ProxyState, parts: &Parts, body: Bytes) -> Result<reqwest::Response> {
    let mut url = state.upstream.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut builder = state.client.request(parts.method.clone(), url);
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || *name == HOST || *name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(body)
        .send()
        .await
        .map_err(|e| Error::Proxy(format!("upstream request failed: {e}")))
}

/// Fold pipeline outputs into the upstream response where needed; stream the
/// body through untouched everywhere else.
async fn rewrite_response(
    kind: Option<RequestKind>,
    outputs: &AdmissionOutputs,
    upstream: reqwest::Response,
) -> Result<Response> {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    match kind {
        Some(RequestKind::Register) | Some(RequestKind::Plan)
            if !outputs.warnings.is_empty() =>
        {
            let body = read_upstream_body(upstream).await?;
            let body = rewrite_job_response(&body, &outputs.warnings)?;
            build_response(status, &headers, Body::from(body))
        }
        Some(RequestKind::Validate) if !outputs.is_empty() => {
            let body = read_upstream_body(upstream).await?;
            let body = rewrite_validate_response(&body, outputs)?;
            build_response(status, &headers, Body::from(body))
        }
        _ => build_response(status, &headers, Body::from_stream(upstream.bytes_stream())),
    }
}

async fn read_upstream_body(upstream: reqwest::Response) -> Result<Bytes> {
    upstream
        .bytes()
        .await
        .map_err(|e| Error::Proxy(format!("failed to read upstream response: {e}")))
}

fn rewrite_job_response(body: &[u8], warnings: &[String]) -> Result<Vec<u8>> {
    let mut response: JobRegisterResponse = serde_json::from_slice(body)
        .map_err(|e| Error::UpstreamDecode(format!("upstream job response: {e}")))?;

    debug!(
        job_modify_index = response.job_modify_index,
        "merging admission warnings into upstream response"
    );
    response.warnings = merge_warnings(&response.warnings, warnings);

    serde_json::to_vec(&response)
        .map_err(|e| Error::UpstreamDecode(format!("re-encoding upstream job response: {e}")))
}

fn rewrite_validate_response(body: &[u8], outputs: &AdmissionOutputs) -> Result<Vec<u8>> {
    let mut response: JobValidateResponse = serde_json::from_slice(body)
        .map_err(|e| Error::UpstreamDecode(format!("upstream validate response: {e}")))?;

    if let Some(agg) = &outputs.validation_error {
        // Keep the upstream's own findings and append ours, de-duplicated.
        let mut combined = response.validation_errors.clone();
        for message in agg.messages() {
            if !combined.iter().any(|existing| existing == message) {
                combined.push(message.clone());
            }
        }
        if let Some(all) = AggregateError::new(combined.clone()) {
            response.error = all.to_string();
        }
        response.validation_errors = combined;
    }

    if !outputs.warnings.is_empty() {
        response.warnings = merge_warnings(&response.warnings, &outputs.warnings);
    }

    serde_json::to_vec(&response)
        .map_err(|e| Error::UpstreamDecode(format!("re-encoding upstream validate response: {e}")))
}

fn build_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Result<Response> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|e| Error::Proxy(format!("failed to assemble response: {e}")))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn classify(method: &Method, path: &str) -> Option<RequestKind> {
    if method != Method::PUT {
        return None;
    }
    if path == "/v1/jobs" {
        return Some(RequestKind::Register);
    }
    if path == "/v1/validate/job" {
        return Some(RequestKind::Validate);
    }
    if let Some(rest) = path.strip_prefix("/v1/job/") {
        if let Some(name) = rest.strip_suffix("/plan") {
            if is_job_name(name) {
                return Some(RequestKind::Plan);
            }
        } else if is_job_name(rest) {
            return Some(RequestKind::Register);
        }
    }
    None
}

/// Job names start with a letter and continue with letters, digits or dashes
fn is_job_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}
