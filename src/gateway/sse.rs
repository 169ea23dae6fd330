//! SSE session handler
//!
//! Opens a streaming connection bound to one child, delivers every bus
//! message as an SSE `message` event, heart-beats with `ping` events, and
//! tears the session down exactly once on any exit path: peer disconnect,
//! write failure, session timeout, or child termination.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
};
use chrono::Utc;
use futures::stream;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::gateway::{acquire_child, AppState};
use crate::registry::ChildServer;
use crate::types::SubscriberId;

/// Events queued toward a single subscriber before its session is
/// considered stuck and the pump blocks on its stream.
const SESSION_QUEUE: usize = 64;

/// `GET /package/{pkg}/sse?{params}` — open an SSE session.
#[instrument(skip(state, params), fields(pkg = %pkg))]
pub async fn handle_sse(
    State(state): State<AppState>,
    Path(pkg): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> std::result::Result<impl IntoResponse, Error> {
    let (child, spawned) = acquire_child(&state, &pkg, &params).await?;

    // Fresh children get a settle window before the first event; reused
    // children are live already.
    let settle = state.config.settle();
    if spawned && !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let subscriber_id: SubscriberId = Uuid::new_v4().to_string();
    let bus_rx = child.subscribe(&subscriber_id);
    debug!(server = %child.id(), client = %subscriber_id, "subscriber attached");

    let (tx, rx) = mpsc::channel::<Event>(SESSION_QUEUE);
    tokio::spawn(pump_session(
        child,
        subscriber_id,
        bus_rx,
        tx,
        state.config.keepalive(),
        state.config.session_timeout(),
    ));

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<Event, Infallible>(event), rx))
    });

    Ok((
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(stream),
    ))
}

/// Forward bus messages and keepalives into the session channel until the
/// session ends, then run the one cleanup. Dropping the response body drops
/// the channel receiver, so a departed peer surfaces as a failed send no
/// later than the next message or ping.
async fn pump_session(
    child: Arc<ChildServer>,
    subscriber_id: SubscriberId,
    mut bus_rx: broadcast::Receiver<Arc<Value>>,
    tx: mpsc::Sender<Event>,
    keepalive: Duration,
    session_cap: Duration,
) {
    let connected = Event::default().event("status").data(
        json!({
            "type": "connected",
            "server": child.id(),
            "clientId": subscriber_id,
        })
        .to_string(),
    );

    if tx.send(connected).await.is_ok() {
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
        let deadline = tokio::time::sleep(session_cap);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!(client = %subscriber_id, "session reached wall-clock cap");
                    break;
                },
                _ = child.terminated() => break,
                next = bus_rx.recv() => match next {
                    Ok(value) => {
                        let event = Event::default().event("message").data(value.to_string());
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client = %subscriber_id, skipped, "subscriber too slow, dropping");
                        break;
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ping.tick() => {
                    let event = Event::default()
                        .event("ping")
                        .data(json!({ "timestamp": Utc::now().to_rfc3339() }).to_string());
                    if tx.send(event).await.is_err() {
                        break;
                    }
                },
            }
        }
    }

    child.unsubscribe(&subscriber_id);
    debug!(server = %child.id(), client = %subscriber_id, "subscriber detached");
}
