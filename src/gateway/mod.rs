//! HTTP gateway surface
//!
//! Routes, shared application state, and the handlers for the three
//! transports the gateway speaks: per-package SSE streams, per-package POST
//! ingress, and the gateway's own MCP handshake endpoint.

pub mod ingress;
pub mod mcp;
pub mod server;
pub mod sse;

pub use server::{AppState, GatewayServer};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::registry::{ChildServer, ServerRegistry, SpawnRequest};
use crate::runner;
use crate::validate;

/// Shared admission path for SSE and POST ingress: validate the inputs,
/// resolve the package, pass the quality gate, then acquire (or spawn) the
/// keyed child. Returns the child and whether this call spawned it.
pub(crate) async fn acquire_child(
    state: &AppState,
    raw_pkg: &str,
    params: &BTreeMap<String, String>,
) -> Result<(Arc<ChildServer>, bool)> {
    // All validation happens at the edge, before any registry probe or
    // spawn can be reached.
    let canonical = validate::validate_package_identifier(raw_pkg)?;
    validate::validate_params(params)?;
    let extra_args = match params.get(validate::ARGS_PARAM) {
        Some(raw) => validate::build_extra_args(raw)?,
        None => Vec::new(),
    };
    let env = validate::project_environment(params);
    let parsed = validate::parse_package(&canonical);

    let resolved = state.resolver.resolve(&parsed).await?;
    state.resolver.quality_gate(&parsed, &resolved).await?;

    let spec = runner::build_command(resolved.ecosystem, &parsed, &extra_args)?;

    let server_id = ServerRegistry::server_id(&canonical, params);
    state.registry.get_or_create(
        &server_id,
        SpawnRequest { pkg: canonical, spec, env },
    )
}
