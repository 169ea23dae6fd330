//! POST ingress for opaque JSON-RPC frames
//!
//! Accepts a JSON-RPC envelope for a package's child and forwards it to the
//! child's stdin through the framer. The gateway never waits for a matching
//! reply; responses arrive out-of-band on the package's SSE stream. Every
//! failure on this route answers HTTP 500 with a JSON-RPC error envelope,
//! carrying `id: null` when the body never parsed.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::gateway::{acquire_child, AppState};
use crate::types::{McpResponse, ServerId};

/// `POST /package/{pkg}/{respond|messages|message}` — forward one frame.
#[instrument(skip(state, params, body), fields(pkg = %pkg))]
pub async fn handle_message(
    State(state): State<AppState>,
    Path(pkg): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(_) => return ingress_error(Value::Null, &Error::ParseError),
    };
    let id = payload.get("id").cloned().unwrap_or(Value::Null);

    match forward(&state, &pkg, &params, payload).await {
        Ok(server_id) => {
            debug!(server = %server_id, "message forwarded to child");
            (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
        },
        Err(err) => ingress_error(id, &err),
    }
}

async fn forward(
    state: &AppState,
    pkg: &str,
    params: &BTreeMap<String, String>,
    payload: Value,
) -> Result<ServerId> {
    let (child, _) = acquire_child(state, pkg, params).await?;
    child.send(payload).await?;
    Ok(child.id().clone())
}

/// This route always answers 500; the JSON-RPC error object still carries
/// the kind-specific code.
fn ingress_error(id: Value, err: &Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(McpResponse::error(id, err.to_error_object())),
    )
        .into_response()
}
