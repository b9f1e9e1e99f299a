//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::forward::ForwardError;
use crate::registry::RegistryError;
use crate::routes::RouteError;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route for the session and workspace (or no session at all)
    RouteNotFound,
    /// Workspace path escapes the workspace root or is not valid UTF-8
    InvalidWorkspacePath,
    /// WebSocket upgrade without the required subprotocol
    SubprotocolRequired,
    /// Malformed WebSocket upgrade request
    BadUpgradeRequest,
    /// The viewer process could not be launched
    ViewerLaunchFailed,
    /// The viewer process did not answer
    UpstreamUnavailable,
    /// Unknown path
    NotFound,
    /// Method not supported on this path
    MethodNotAllowed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InvalidWorkspacePath => StatusCode::BAD_REQUEST,
            ProxyErrorCode::SubprotocolRequired => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BadUpgradeRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ViewerLaunchFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::InvalidWorkspacePath => "INVALID_WORKSPACE_PATH",
            ProxyErrorCode::SubprotocolRequired => "SUBPROTOCOL_REQUIRED",
            ProxyErrorCode::BadUpgradeRequest => "BAD_UPGRADE_REQUEST",
            ProxyErrorCode::ViewerLaunchFailed => "VIEWER_LAUNCH_FAILED",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&RouteError> for ProxyErrorCode {
    fn from(_: &RouteError) -> Self {
        ProxyErrorCode::RouteNotFound
    }
}

impl From<&RegistryError> for ProxyErrorCode {
    fn from(_: &RegistryError) -> Self {
        ProxyErrorCode::ViewerLaunchFailed
    }
}

impl From<&ForwardError> for ProxyErrorCode {
    fn from(err: &ForwardError) -> Self {
        match err {
            ForwardError::UpstreamUnavailable { .. } => ProxyErrorCode::UpstreamUnavailable,
            ForwardError::InvalidTarget(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
