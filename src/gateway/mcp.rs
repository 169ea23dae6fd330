//! MCP handshake surface for the gateway itself
//!
//! `POST /mcp` speaks the MCP initialization protocol on behalf of the
//! gateway, independently of any child. The session is a process-wide
//! singleton: protocol version negotiation, capability advertisement, and
//! the initialized flag that gates the discovery lists.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::Error;
use crate::gateway::AppState;
use crate::types::{McpError, McpRequest, McpResponse};

/// The protocol revision this gateway speaks, advertised verbatim.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const INSTRUCTIONS: &str = "This gateway exposes installable MCP server packages over HTTP. \
Open an SSE session at /package/{pkg}/sse and post JSON-RPC frames to \
/package/{pkg}/messages; replies arrive on the SSE stream.";

/// Negotiated state of the gateway's own MCP session.
#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    protocol_version: Option<String>,
    client_capabilities: Option<Value>,
}

/// Process-wide MCP session singleton.
#[derive(Debug, Default)]
pub struct McpSession {
    state: RwLock<SessionState>,
}

impl McpSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    fn begin(&self, protocol_version: &str, client_capabilities: Option<Value>) {
        let mut state = self.state.write();
        state.protocol_version = Some(protocol_version.to_string());
        state.client_capabilities = client_capabilities;
    }

    fn mark_initialized(&self) {
        self.state.write().initialized = true;
    }

    /// Status document served by `GET /mcp/capabilities`.
    pub fn status(&self) -> Value {
        let state = self.state.read();
        json!({
            "initialized": state.initialized,
            "protocolVersion": state.protocol_version,
            "clientCapabilities": state.client_capabilities,
            "serverCapabilities": server_capabilities(),
            "serverInfo": server_info(),
        })
    }
}

/// Constant capability advertisement.
pub fn server_capabilities() -> Value {
    json!({
        "tools": { "listChanged": true },
        "resources": { "subscribe": true, "listChanged": true },
        "prompts": { "listChanged": true },
        "logging": {},
    })
}

/// Constant server identity.
pub fn server_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "title": "MCP-as-a-Service Gateway",
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /mcp` — the gateway's own JSON-RPC surface.
#[instrument(skip(state, body))]
pub async fn handle_mcp(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        // The id cannot be recovered from an unparsable body.
        return (
            StatusCode::BAD_REQUEST,
            Json(McpResponse::error(
                Value::Null,
                McpError {
                    code: -32602,
                    message: "Invalid JSON format".to_string(),
                    data: None,
                },
            )),
        )
            .into_response();
    };

    let fallback_id = payload.get("id").cloned().unwrap_or(Value::Null);
    let request: McpRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(_) => {
            return error_response(
                fallback_id,
                &Error::InvalidRequest("not a JSON-RPC request object".to_string()),
            );
        },
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return error_response(id, &Error::InvalidJsonRpcVersion);
    }
    if request.method.is_empty() {
        return error_response(id, &Error::InvalidRequest("missing method".to_string()));
    }

    debug!(method = %request.method, "mcp request");

    match request.method.as_str() {
        "initialize" => handle_initialize(&state, id, request.params.as_ref()),
        "notifications/initialized" => {
            state.session.mark_initialized();
            StatusCode::NO_CONTENT.into_response()
        },
        "capabilities/list" => {
            listing(&state, id, json!({ "capabilities": server_capabilities() }))
        },
        "tools/list" => listing(&state, id, json!({ "tools": [] })),
        "resources/list" => listing(&state, id, json!({ "resources": [] })),
        "prompts/list" => listing(&state, id, json!({ "prompts": [] })),
        other => error_response(id, &Error::MethodNotFound(other.to_string())),
    }
}

fn handle_initialize(state: &AppState, id: Value, params: Option<&Value>) -> Response {
    let Some(params) = params else {
        return error_response(
            id,
            &Error::InvalidParams("missing initialize params".to_string()),
        );
    };

    let requested = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if requested != PROTOCOL_VERSION {
        return error_response(
            id,
            &Error::UnsupportedProtocolVersion { requested: requested.to_string() },
        );
    }

    state
        .session
        .begin(requested, params.get("capabilities").cloned());

    rpc_result(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": server_capabilities(),
            "serverInfo": server_info(),
            "instructions": INSTRUCTIONS,
        }),
    )
}

/// Discovery lists require a completed handshake.
fn listing(state: &AppState, id: Value, result: Value) -> Response {
    if !state.session.is_initialized() {
        return error_response(id, &Error::ServerNotReady);
    }
    rpc_result(id, result)
}

/// `GET /mcp/capabilities` — session status without touching the handshake.
pub async fn handle_capabilities(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "status": state.session.status(),
    }))
}

fn rpc_result(id: Value, result: Value) -> Response {
    (StatusCode::OK, Json(McpResponse::result(id, result))).into_response()
}

fn error_response(id: Value, error: &Error) -> Response {
    (
        error.status_code(),
        Json(McpResponse::error(id, error.to_error_object())),
    )
        .into_response()
}
