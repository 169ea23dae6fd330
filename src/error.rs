//! Error types for mcpaas
//!
//! Every failure surfaces to HTTP clients as a JSON-RPC error object
//! `{code, message, data?}` paired with an HTTP status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

use crate::resolver::Ecosystem;

pub type Result<T> = std::result::Result<T, Error>;

/// Reason a package identifier was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRejection {
    Empty,
    TooLong,
    InvalidFormat,
    PathTraversal,
    ShellMetacharacters,
}

impl NameRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            NameRejection::Empty => "empty",
            NameRejection::TooLong => "too_long",
            NameRejection::InvalidFormat => "invalid_format",
            NameRejection::PathTraversal => "path_traversal",
            NameRejection::ShellMetacharacters => "shell_metacharacters",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid JSON format")]
    ParseError,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Invalid JSON-RPC version. Expected \"2.0\"")]
    InvalidJsonRpcVersion,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unsupported protocol version: {requested}")]
    UnsupportedProtocolVersion { requested: String },

    #[error("Server not initialized")]
    ServerNotReady,

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("Runtime not available: {command} ({ecosystem})")]
    RuntimeNotAvailable { command: String, ecosystem: Ecosystem },

    #[error("Failed to start server: {0}")]
    ServerStartFailed(String),

    #[error("Maximum concurrent servers reached ({0})")]
    MaxProcessesExceeded(usize),

    #[error("Invalid package name ({})", .0.as_str())]
    InvalidPackageName(NameRejection),

    #[error("Package failed quality check: {0}")]
    QualityCheckFailed(String),

    #[error("Remote MCP servers are not supported; provide an installable package name")]
    RemoteServerNotSupported,

    #[error("Invalid args: {0}")]
    InvalidArgs(String),

    #[error("Server is not running: {0}")]
    ServerGone(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// JSON-RPC error code for this failure kind.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Error::ParseError => -32700,
            Error::InvalidRequest(_) => -32600,
            Error::MethodNotFound(_) => -32601,
            Error::InvalidParams(_) | Error::InvalidJsonRpcVersion | Error::InvalidArgs(_) => {
                -32602
            },
            Error::UnsupportedProtocolVersion { .. } => -32000,
            Error::ServerNotReady => -32006,
            Error::PackageNotFound(_) => -32020,
            Error::RuntimeNotAvailable { .. } => -32021,
            Error::ServerStartFailed(_) => -32022,
            Error::MaxProcessesExceeded(_) => -32023,
            Error::InvalidPackageName(_) => -32024,
            Error::QualityCheckFailed(_) => -32025,
            Error::RemoteServerNotSupported => -32026,
            Error::Internal(_)
            | Error::ServerGone(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_) => -32603,
        }
    }

    /// HTTP status paired with the JSON-RPC code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ParseError
            | Error::InvalidRequest(_)
            | Error::InvalidParams(_)
            | Error::InvalidJsonRpcVersion
            | Error::InvalidArgs(_)
            | Error::UnsupportedProtocolVersion { .. }
            | Error::ServerNotReady
            | Error::InvalidPackageName(_)
            | Error::QualityCheckFailed(_)
            | Error::RemoteServerNotSupported => StatusCode::BAD_REQUEST,
            Error::MethodNotFound(_) | Error::PackageNotFound(_) => StatusCode::NOT_FOUND,
            Error::RuntimeNotAvailable { .. } => StatusCode::FAILED_DEPENDENCY,
            Error::MaxProcessesExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::ServerStartFailed(_)
            | Error::Internal(_)
            | Error::ServerGone(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured `data` attached to the error object, where the kind carries one.
    pub fn error_data(&self) -> Option<serde_json::Value> {
        match self {
            Error::UnsupportedProtocolVersion { requested } => Some(json!({
                "supported": [crate::gateway::mcp::PROTOCOL_VERSION],
                "requested": requested,
            })),
            Error::RuntimeNotAvailable { command, ecosystem } => Some(json!({
                "command": command,
                "ecosystem": ecosystem,
            })),
            Error::InvalidPackageName(reason) => Some(json!({ "reason": reason.as_str() })),
            _ => None,
        }
    }

    /// The error object as it appears on the wire.
    pub fn to_error_object(&self) -> crate::types::McpError {
        crate::types::McpError {
            code: self.jsonrpc_code(),
            message: self.to_string(),
            data: self.error_data(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "jsonrpc": "2.0",
            "error": self.to_error_object(),
            "id": null,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_match_wire_contract() {
        assert_eq!(Error::ParseError.jsonrpc_code(), -32700);
        assert_eq!(Error::InvalidRequest("x".into()).jsonrpc_code(), -32600);
        assert_eq!(Error::MethodNotFound("m".into()).jsonrpc_code(), -32601);
        assert_eq!(Error::InvalidParams("p".into()).jsonrpc_code(), -32602);
        assert_eq!(Error::Internal("i".into()).jsonrpc_code(), -32603);
        assert_eq!(
            Error::UnsupportedProtocolVersion { requested: "1.0.0".into() }.jsonrpc_code(),
            -32000
        );
        assert_eq!(Error::ServerNotReady.jsonrpc_code(), -32006);
        assert_eq!(Error::PackageNotFound("p".into()).jsonrpc_code(), -32020);
        assert_eq!(
            Error::RuntimeNotAvailable { command: "npx".into(), ecosystem: Ecosystem::Node }
                .jsonrpc_code(),
            -32021
        );
        assert_eq!(Error::ServerStartFailed("s".into()).jsonrpc_code(), -32022);
        assert_eq!(Error::MaxProcessesExceeded(10).jsonrpc_code(), -32023);
        assert_eq!(
            Error::InvalidPackageName(NameRejection::TooLong).jsonrpc_code(),
            -32024
        );
        assert_eq!(Error::QualityCheckFailed("q".into()).jsonrpc_code(), -32025);
        assert_eq!(Error::RemoteServerNotSupported.jsonrpc_code(), -32026);
    }

    #[test]
    fn taxonomy_http_statuses() {
        assert_eq!(Error::ParseError.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::MethodNotFound("m".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::PackageNotFound("p".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::RuntimeNotAvailable { command: "pipx".into(), ecosystem: Ecosystem::Python }
                .status_code(),
            StatusCode::FAILED_DEPENDENCY
        );
        assert_eq!(
            Error::MaxProcessesExceeded(10).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::ServerStartFailed("s".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unsupported_protocol_version_carries_data() {
        let err = Error::UnsupportedProtocolVersion { requested: "1.0.0".into() };
        let data = err.error_data().unwrap();
        assert_eq!(data["supported"], json!(["2024-11-05"]));
        assert_eq!(data["requested"], json!("1.0.0"));
    }
}
