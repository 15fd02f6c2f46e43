//! Error types for the supervisor and JSON error responses for the proxy

use crate::origin::OriginError;
use crate::process::CommandError;
use crate::wait::WaitError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Fatal startup errors. Anything that goes wrong after the proxy is serving
/// is logged instead of returned.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid origin: {0}")]
    Origin(#[from] OriginError),
    #[error("unable to start server command: {0}")]
    Command(#[from] CommandError),
    #[error("error while waiting for upstream host to come online: {0}")]
    Readiness(#[from] WaitError),
}

/// Error codes for responses the proxy answers itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The origin could not be reached or failed mid-response
    UpstreamUnavailable,
    /// The inbound request could not be rewritten for the origin
    BadRequest,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UpstreamUnavailable, "connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UPSTREAM_UNAVAILABLE\""));
        assert!(json.contains("\"message\":\"connection refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::UpstreamUnavailable, "down");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_UNAVAILABLE"
        );
    }

    #[test]
    fn test_supervisor_error_messages() {
        let err = SupervisorError::from(CommandError::Empty);
        assert_eq!(
            err.to_string(),
            "unable to start server command: empty command string given"
        );

        let err = SupervisorError::from(WaitError::InvalidPort(0));
        assert!(err.to_string().starts_with("error while waiting for upstream host"));
    }
}
