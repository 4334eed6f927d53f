//! Error types for the admission control proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::admission::AggregateError;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration or unknown component type
    #[error("configuration error: {0}")]
    Config(String),

    /// Policy module or query could not be prepared
    #[error("policy compile error: {0}")]
    Compile(String),

    /// Policy evaluator failed at runtime
    #[error("policy evaluation error: {0}")]
    Evaluate(String),

    /// Patch decoding or application failed
    #[error("patch error: {0}")]
    Patch(String),

    /// One or more rules rejected the job
    #[error("admission denied: {0}")]
    Admission(#[from] AggregateError),

    /// Incoming request body does not parse as the expected envelope
    #[error("decode error: {0}")]
    Decode(String),

    /// Upstream response body could not be parsed when a rewrite was needed
    #[error("upstream decode error: {0}")]
    UpstreamDecode(String),

    /// Failed to reach or relay to the upstream
    #[error("proxy error: {0}")]
    Proxy(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::UpstreamDecode(_) | Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_error_renders_aggregate() {
        let agg = AggregateError::new(vec![
            "forbidden (rule-a)".to_string(),
            "too big (rule-b)".to_string(),
        ])
        .unwrap();
        let err = Error::Admission(agg);

        assert!(err.to_string().contains("admission denied"));
        assert!(err.to_string().contains("forbidden (rule-a)"));
        assert!(err.to_string().contains("too big (rule-b)"));
    }

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        let response = Error::UpstreamDecode("bad json".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = Error::Proxy("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn admission_failures_map_to_internal_error() {
        let agg = AggregateError::new(vec!["no (r)".to_string()]).unwrap();
        let response = Error::Admission(agg).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = Error::Decode("not an envelope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
