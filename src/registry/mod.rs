//! Child-process supervisor and server registry
//!
//! The single stateful heart of the gateway. Children are spawned on demand,
//! keyed by `(package, params digest)`, and shared by every subscriber that
//! asks for the same key. Each child owns a broadcast bus fed by a stdout
//! reader task running the stdio codec; an exit watcher removes the registry
//! entry exactly once on any terminal path, and a reaper kills children that
//! sit idle with no subscribers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::FramedJsonCodec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runner::CommandSpec;
use crate::types::{ServerId, SubscriberId};

/// Capacity of the per-child fanout bus. A subscriber that falls this far
/// behind is lagged out and torn down rather than back-pressuring the child.
const BUS_CAPACITY: usize = 256;

/// Lifecycle states for a managed child. A record is `Running` from the
/// moment it enters the registry; readiness is not probed further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Stopped,
    Errored,
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Canonical package identifier
    pub pkg: String,
    pub spec: CommandSpec,
    /// Environment delta overlaid on the inherited parent environment
    pub env: Vec<(String, String)>,
}

/// One live child process with its fanout bus and stdio plumbing.
pub struct ChildServer {
    id: ServerId,
    pkg: String,
    pid: Option<u32>,
    started_at: Instant,
    last_activity: RwLock<Instant>,
    subscribers: RwLock<HashSet<SubscriberId>>,
    bus: broadcast::Sender<Arc<Value>>,
    stdin: Mutex<FramedWrite<ChildStdin, FramedJsonCodec>>,
    status: RwLock<ChildStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChildServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildServer")
            .field("id", &self.id)
            .field("pkg", &self.pkg)
            .field("pid", &self.pid)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl ChildServer {
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn pkg(&self) -> &str {
        &self.pkg
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ChildStatus {
        *self.status.read()
    }

    /// Bump the activity clock. Called on every send, receive, and
    /// subscriber churn, so `Instant::now()` keeps it monotone.
    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Register a subscriber and hand it a receiving end of the bus.
    /// At most one set entry per id, no matter how often it is called.
    pub fn subscribe(&self, subscriber_id: &str) -> broadcast::Receiver<Arc<Value>> {
        self.subscribers.write().insert(subscriber_id.to_string());
        self.touch();
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.write().remove(subscriber_id);
        self.touch();
    }

    /// Write one framed message to the child's stdin. The stdin mutex
    /// serializes concurrent senders, so frames never interleave.
    pub async fn send(&self, payload: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ServerGone(self.id.clone()));
        }

        let mut stdin = self.stdin.lock().await;
        stdin
            .send(payload)
            .await
            .map_err(|_| Error::ServerGone(self.id.clone()))?;
        self.touch();
        Ok(())
    }

    /// Resolves once the child has reached a terminal state.
    pub fn terminated(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Ask the exit watcher to kill the process. Idempotent.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    fn is_reap_eligible(&self, idle_timeout: Duration) -> bool {
        self.subscriber_count() == 0 && self.idle_for() > idle_timeout
    }
}

/// Registry snapshot entry, as served by `GET /servers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub id: ServerId,
    pub pkg: String,
    pub uptime_secs: u64,
    pub subscribers: usize,
    pub last_activity_secs_ago: u64,
}

/// On-demand child registry with a bounded spawn budget.
pub struct ServerRegistry {
    children: DashMap<ServerId, Arc<ChildServer>>,
    slots: Arc<Semaphore>,
    max_children: usize,
    idle_timeout: Duration,
    reap_interval: Duration,
    shutdown: CancellationToken,
}

impl ServerRegistry {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            children: DashMap::new(),
            slots: Arc::new(Semaphore::new(config.max_children)),
            max_children: config.max_children,
            idle_timeout: config.idle_timeout(),
            reap_interval: config.reap_interval(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stable 8-character digest of a params map, sorted by key.
    pub fn params_digest(params: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in params {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        let digest = URL_SAFE_NO_PAD.encode(hasher.finalize());
        digest[..8].to_string()
    }

    /// Child key: identical `(pkg, params)` share a child, distinct params
    /// get distinct children.
    pub fn server_id(pkg: &str, params: &BTreeMap<String, String>) -> ServerId {
        format!("{}_{}", pkg, Self::params_digest(params))
    }

    /// Return the live child for `server_id`, spawning it if absent.
    ///
    /// Idempotent over the id: concurrent callers race through the map
    /// entry, and exactly one of them spawns. The second tuple field is
    /// true for the caller that actually spawned.
    pub fn get_or_create(
        self: &Arc<Self>,
        server_id: &ServerId,
        request: SpawnRequest,
    ) -> Result<(Arc<ChildServer>, bool)> {
        if let Some(child) = self.children.get(server_id) {
            child.touch();
            return Ok((child.clone(), false));
        }

        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::MaxProcessesExceeded(self.max_children))?;

        match self.children.entry(server_id.clone()) {
            Entry::Occupied(entry) => {
                // Lost the spawn race; the permit drops and the slot frees.
                let child = entry.get().clone();
                child.touch();
                Ok((child, false))
            },
            Entry::Vacant(entry) => {
                let child = self.spawn_child(server_id.clone(), request, permit)?;
                entry.insert(child.clone());
                Ok((child, true))
            },
        }
    }

    fn spawn_child(
        self: &Arc<Self>,
        server_id: ServerId,
        request: SpawnRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<Arc<ChildServer>> {
        let mut command = Command::new(&request.spec.program);
        command
            .args(&request.spec.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut process = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ServerStartFailed(format!(
                "runner not found: {}",
                request.spec.program.display()
            )),
            _ => Error::ServerStartFailed(e.to_string()),
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::ServerStartFailed("no stdin pipe".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::ServerStartFailed("no stdout pipe".to_string()))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| Error::ServerStartFailed("no stderr pipe".to_string()))?;

        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let now = Instant::now();

        let child = Arc::new(ChildServer {
            id: server_id.clone(),
            pkg: request.pkg.clone(),
            pid: process.id(),
            started_at: now,
            last_activity: RwLock::new(now),
            subscribers: RwLock::new(HashSet::new()),
            bus,
            stdin: Mutex::new(FramedWrite::new(stdin, FramedJsonCodec::new())),
            status: RwLock::new(ChildStatus::Running),
            cancel: CancellationToken::new(),
        });

        info!(
            server = %server_id,
            pkg = %request.pkg,
            pid = child.pid,
            "spawned child server"
        );

        tokio::spawn(drive_stdout(child.clone(), stdout));
        tokio::spawn(drain_stderr(stderr, server_id));
        tokio::spawn(watch_exit(self.clone(), child.clone(), process, permit));

        Ok(child)
    }

    pub fn get(&self, server_id: &ServerId) -> Option<Arc<ChildServer>> {
        self.children.get(server_id).map(|entry| entry.value().clone())
    }

    /// Forward one framed message to a child's stdin.
    pub async fn send(&self, server_id: &ServerId, payload: Value) -> Result<()> {
        let child = self
            .get(server_id)
            .ok_or_else(|| Error::ServerGone(server_id.clone()))?;
        child.send(payload).await
    }

    /// Register a subscriber on a child's bus by server id.
    pub fn subscribe(
        &self,
        server_id: &ServerId,
        subscriber_id: &str,
    ) -> Result<broadcast::Receiver<Arc<Value>>> {
        let child = self
            .get(server_id)
            .ok_or_else(|| Error::ServerGone(server_id.clone()))?;
        Ok(child.subscribe(subscriber_id))
    }

    /// Remove a subscriber by server id. A no-op for unknown servers, which
    /// happens whenever teardown races child exit.
    pub fn unsubscribe(&self, server_id: &ServerId, subscriber_id: &str) {
        if let Some(child) = self.get(server_id) {
            child.unsubscribe(subscriber_id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.children.len()
    }

    /// Snapshot of every live child.
    pub fn stats(&self) -> Vec<ServerStats> {
        self.children
            .iter()
            .map(|entry| {
                let child = entry.value();
                ServerStats {
                    id: child.id.clone(),
                    pkg: child.pkg.clone(),
                    uptime_secs: child.uptime().as_secs(),
                    subscribers: child.subscriber_count(),
                    last_activity_secs_ago: child.idle_for().as_secs(),
                }
            })
            .collect()
    }

    /// Kill one child by id. Returns false when no such child is live.
    pub fn kill(&self, server_id: &ServerId) -> bool {
        match self.get(server_id) {
            Some(child) => {
                child.kill();
                true
            },
            None => false,
        }
    }

    /// Start the periodic idle reaper.
    pub fn start_reaper(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.reap_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = tick.tick() => registry.reap_idle(),
                }
            }
            debug!("reaper stopped");
        });
    }

    fn reap_idle(&self) {
        for entry in self.children.iter() {
            let child = entry.value();
            if child.is_reap_eligible(self.idle_timeout) {
                info!(
                    server = %child.id,
                    idle_secs = child.idle_for().as_secs(),
                    "reaping idle child"
                );
                child.kill();
            }
        }
    }

    /// Kill every child and empty the registry.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.children.iter() {
            entry.value().kill();
        }
        self.children.clear();
        info!("registry shut down");
    }
}

/// Pump decoded frames from the child's stdout onto the bus. Every frame
/// reaches every currently registered subscriber; a send with no receivers
/// is not an error.
async fn drive_stdout(child: Arc<ChildServer>, stdout: ChildStdout) {
    let mut frames = FramedRead::new(stdout, FramedJsonCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(value) => {
                child.touch();
                let _ = child.bus.send(Arc::new(value));
            },
            Err(e) => {
                debug!(server = %child.id, error = %e, "stdout stream error");
                break;
            },
        }
    }
    debug!(server = %child.id, "stdout closed");
}

/// Drain stderr into logs so the 64 KiB pipe buffer never fills and stalls
/// the child. Stderr content is never surfaced to subscribers.
async fn drain_stderr(stderr: tokio::process::ChildStderr, server_id: ServerId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            debug!(server = %server_id, "stderr: {}", trimmed);
        }
    }
}

/// Wait for the child to exit, or kill it when asked to, then remove the
/// registry entry. The spawn-slot permit is released here, on the one path
/// every terminal state funnels through.
async fn watch_exit(
    registry: Arc<ServerRegistry>,
    child: Arc<ChildServer>,
    mut process: Child,
    permit: OwnedSemaphorePermit,
) {
    let exit = tokio::select! {
        exit = process.wait() => exit,
        _ = child.cancel.cancelled() => {
            let _ = process.start_kill();
            process.wait().await
        },
    };

    let status = match &exit {
        Ok(code) if code.success() => ChildStatus::Stopped,
        Ok(code) => {
            warn!(server = %child.id, code = ?code.code(), "child exited with failure");
            ChildStatus::Errored
        },
        Err(e) => {
            error!(server = %child.id, error = %e, "failed to reap child process");
            ChildStatus::Errored
        },
    };

    *child.status.write() = status;
    registry.children.remove(&child.id);
    // Wake subscribers on natural exit as well; their streams close on the
    // next poll.
    child.cancel.cancel();
    drop(permit);

    info!(server = %child.id, ?status, "child removed from registry");
}
