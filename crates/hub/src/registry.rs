// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Executor registry: long-lived control connections from remote agents,
//! typed RPC dispatch with correlation ids, heartbeat liveness, inventory
//! reconciliation, side-channel allocation, and controlled upgrades.
//!
//! Each control connection runs its own loop; registry tables are guarded
//! by short critical sections. Losing a control connection is never fatal
//! to sessions: remote sessions read as offline until the agent returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use roost_core::epoch_ms;
use roost_core::protocol::{ControlMessage, InventoryEntry, RpcOutcome, RpcPayload};
use roost_core::record::{ExecutorRecord, ExecutorStatus};

use crate::error::{ErrorCode, HubError};
use crate::logring::LogRing;
use crate::store::SessionStore;
use crate::transport::auth::constant_time_eq;

/// Ring capacity for `/api/executors/logs`.
const LOG_CAPACITY: usize = 1024;

/// How long the "upgrading" marker survives without a reconnect.
const UPGRADE_WINDOW: Duration = Duration::from_secs(120);

/// How long the agent gets to dial a side-channel before the browser
/// attach gives up.
pub const CHANNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback surface the session manager exposes to the registry for
/// inventory reconciliation.
pub trait AdoptionSink: Send + Sync {
    /// A session alive on the agent with no local record: adopt it under
    /// the executor id.
    fn adopt_orphan(&self, executor_id: &str, entry: &InventoryEntry);
    /// Records placed on this executor whose backing is missing from the
    /// reported inventory are dead.
    fn reconcile_missing(&self, executor_id: &str, alive_names: &[String]);
}

/// Which kind of side-channel a pending entry splices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Terminal,
    Rich,
}

/// A side-channel waiting for its agent dial-in.
struct PendingChannel {
    executor_id: String,
    #[allow(dead_code)]
    session_name: String,
    kind: ChannelKind,
    socket_tx: oneshot::Sender<WebSocket>,
}

struct PendingRpc {
    executor_id: String,
    tx: oneshot::Sender<Result<serde_json::Value, HubError>>,
}

/// Live control connection to one agent.
pub struct ExecutorHandle {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub version: String,
    outbound_tx: mpsc::Sender<ControlMessage>,
    last_inbound: Mutex<Instant>,
    inventory: Mutex<Vec<InventoryEntry>>,
    cancel: CancellationToken,
}

impl ExecutorHandle {
    /// Whether the agent reported this emulator session alive.
    pub fn inventory_alive(&self, name: &str) -> bool {
        self.inventory.lock().iter().any(|e| e.name == name && e.alive)
    }
}

/// Registry of executor agents and their control-plane state.
pub struct ExecutorRegistry {
    store: Arc<SessionStore>,
    static_token: Option<String>,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
    logs: LogRing,
    executors: RwLock<HashMap<String, Arc<ExecutorHandle>>>,
    pending_rpcs: Mutex<HashMap<String, PendingRpc>>,
    pending_channels: Mutex<HashMap<String, PendingChannel>>,
    upgrading: Mutex<HashMap<String, Instant>>,
    rpc_seq: AtomicU64,
    adoption: Mutex<Option<Arc<dyn AdoptionSink>>>,
}

impl ExecutorRegistry {
    pub fn new(
        store: Arc<SessionStore>,
        static_token: Option<String>,
        heartbeat_interval: Duration,
        rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            static_token,
            heartbeat_interval,
            rpc_timeout,
            logs: LogRing::new(LOG_CAPACITY),
            executors: RwLock::new(HashMap::new()),
            pending_rpcs: Mutex::new(HashMap::new()),
            pending_channels: Mutex::new(HashMap::new()),
            upgrading: Mutex::new(HashMap::new()),
            rpc_seq: AtomicU64::new(1),
            adoption: Mutex::new(None),
        })
    }

    /// Injection point for the manager's reconciliation callback.
    pub fn set_adoption_sink(&self, sink: Arc<dyn AdoptionSink>) {
        *self.adoption.lock() = Some(sink);
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval.as_millis() as u64
    }

    /// Whether an executor currently holds a control connection.
    pub async fn is_online(&self, id: &str) -> bool {
        self.executors.read().await.contains_key(id)
    }

    pub async fn handle(&self, id: &str) -> Option<Arc<ExecutorHandle>> {
        self.executors.read().await.get(id).map(Arc::clone)
    }

    /// Whether an upgrade is in flight for this executor.
    pub fn is_upgrading(&self, id: &str) -> bool {
        let mut upgrading = self.upgrading.lock();
        match upgrading.get(id) {
            Some(since) if since.elapsed() < UPGRADE_WINDOW => true,
            Some(_) => {
                upgrading.remove(id);
                false
            }
            None => false,
        }
    }

    /// Entries from the executor log ring newer than `since` micros.
    pub fn logs_since(&self, since: u64) -> Vec<crate::logring::LogEntry> {
        self.logs.logs_since(since)
    }

    // -- RPC ------------------------------------------------------------------

    /// Dispatch one RPC to an executor and await its reply.
    ///
    /// Completes with `ExecutorOffline` when no control connection exists,
    /// `Timeout` after the per-RPC deadline (late replies are discarded),
    /// and `Disconnected` when the connection drops mid-flight.
    pub async fn call(
        &self,
        executor_id: &str,
        payload: RpcPayload,
    ) -> Result<serde_json::Value, HubError> {
        let handle = self
            .handle(executor_id)
            .await
            .ok_or_else(|| HubError::new(ErrorCode::ExecutorOffline, format!("executor '{executor_id}' is offline")))?;

        let id = self.rpc_seq.fetch_add(1, Ordering::Relaxed).to_string();
        let op = payload.op();
        let (tx, rx) = oneshot::channel();
        self.pending_rpcs
            .lock()
            .insert(id.clone(), PendingRpc { executor_id: executor_id.to_owned(), tx });

        if handle.outbound_tx.send(ControlMessage::Rpc { id: id.clone(), payload }).await.is_err() {
            self.pending_rpcs.lock().remove(&id);
            return Err(HubError::new(ErrorCode::Disconnected, "control connection closed"));
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => {
                if let Err(ref e) = result {
                    self.logs.push(executor_id, "rpc_error", format!("{op}: {e}"));
                }
                result
            }
            Ok(Err(_)) => Err(HubError::new(ErrorCode::Disconnected, "control connection closed")),
            Err(_) => {
                // Deadline passed: drop the pending entry so a late reply
                // for this id is ignored.
                self.pending_rpcs.lock().remove(&id);
                self.logs.push(executor_id, "rpc_error", format!("{op}: timeout"));
                Err(HubError::new(ErrorCode::Timeout, format!("{op} timed out")))
            }
        }
    }

    // -- side-channels --------------------------------------------------------

    /// Allocate a side-channel and tell the agent to dial it.
    ///
    /// Returns the channel id and the receiver the agent's socket arrives
    /// on; the caller splices it with the browser socket. The pending
    /// entry is one-shot.
    pub async fn open_channel(
        self: &Arc<Self>,
        executor_id: &str,
        session_name: &str,
        kind: ChannelKind,
        command: Option<String>,
    ) -> Result<(String, oneshot::Receiver<WebSocket>), HubError> {
        let channel_id = uuid::Uuid::new_v4().to_string();
        let (socket_tx, socket_rx) = oneshot::channel();

        self.pending_channels.lock().insert(
            channel_id.clone(),
            PendingChannel {
                executor_id: executor_id.to_owned(),
                session_name: session_name.to_owned(),
                kind,
                socket_tx,
            },
        );

        let payload = match kind {
            ChannelKind::Terminal => RpcPayload::OpenTerminalChannel {
                channel_id: channel_id.clone(),
                session_name: session_name.to_owned(),
            },
            ChannelKind::Rich => RpcPayload::OpenRichChannel {
                channel_id: channel_id.clone(),
                session_name: session_name.to_owned(),
                command: command.unwrap_or_default(),
            },
        };

        // The reply only acknowledges the dial was started; the socket
        // itself lands on `socket_rx`. The agent authenticates the dial
        // with its executor token.
        if let Err(e) = self.call(executor_id, payload).await {
            self.pending_channels.lock().remove(&channel_id);
            return Err(e);
        }
        Ok((channel_id, socket_rx))
    }

    /// Atomically test-and-remove a pending channel for an agent dial-in.
    ///
    /// Returns the one-shot sender iff the token is a valid executor token
    /// and the channel is pending; a successful resolve consumes the entry
    /// so it can be used exactly once.
    pub fn resolve_terminal_channel(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Option<(ChannelKind, oneshot::Sender<WebSocket>)> {
        if !self.token_valid(token) {
            return None;
        }
        let entry = self.pending_channels.lock().remove(channel_id)?;
        Some((entry.kind, entry.socket_tx))
    }

    /// Drop a pending channel (browser gave up waiting).
    pub fn abandon_channel(&self, channel_id: &str) {
        self.pending_channels.lock().remove(channel_id);
    }

    // -- upgrade --------------------------------------------------------------

    /// Ask one executor to fetch a new build and restart.
    pub async fn upgrade_executor(&self, id: &str, reason: Option<String>) -> Result<(), HubError> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| HubError::new(ErrorCode::ExecutorOffline, format!("executor '{id}' is offline")))?;

        handle
            .outbound_tx
            .send(ControlMessage::Upgrade { reason })
            .await
            .map_err(|_| HubError::new(ErrorCode::Disconnected, "control connection closed"))?;

        self.upgrading.lock().insert(id.to_owned(), Instant::now());
        self.logs.push(id, "upgrading", "upgrade requested");
        Ok(())
    }

    /// Fan the upgrade out to every connected executor. Returns the ids
    /// contacted.
    pub async fn upgrade_all_executors(&self, reason: Option<String>) -> Vec<String> {
        let ids: Vec<String> = self.executors.read().await.keys().cloned().collect();
        let mut contacted = Vec::new();
        for id in ids {
            if self.upgrade_executor(&id, reason.clone()).await.is_ok() {
                contacted.push(id);
            }
        }
        contacted
    }

    // -- control connection ---------------------------------------------------

    /// Drive one control WebSocket to completion. Called by the transport
    /// layer after upgrade.
    ///
    /// `transport_token` is a bearer token carried in the upgrade request
    /// (header or query); it backs up an empty token in the hello itself.
    pub async fn handle_control_socket(
        self: Arc<Self>,
        socket: WebSocket,
        transport_token: Option<String>,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Handshake: the first frame must be a valid hello.
        let hello = tokio::time::timeout(Duration::from_secs(10), ws_rx.next()).await;
        let (id, name, labels, version) = match hello {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Hello { id, name, labels, version, token }) => {
                        let presented = if token.is_empty() {
                            transport_token.unwrap_or_default()
                        } else {
                            token
                        };
                        if !self.token_valid(&presented) {
                            let _ = close_with(&mut ws_tx, 4401, "UNAUTHORIZED").await;
                            return;
                        }
                        (id, name, labels, version)
                    }
                    _ => {
                        let _ = close_with(&mut ws_tx, 4400, "PROTOCOL_ERROR: expected hello").await;
                        return;
                    }
                }
            }
            _ => {
                let _ = close_with(&mut ws_tx, 4400, "PROTOCOL_ERROR: expected hello").await;
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(64);
        let handle = Arc::new(ExecutorHandle {
            id: id.clone(),
            name: name.clone(),
            labels: labels.clone(),
            version: version.clone(),
            outbound_tx,
            last_inbound: Mutex::new(Instant::now()),
            inventory: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        // One connection per executor id: a second handshake replaces the
        // prior connection, which closes with a "superseded" reason.
        let prior = self.executors.write().await.insert(id.clone(), Arc::clone(&handle));
        if let Some(prior) = prior {
            prior.cancel.cancel();
        }

        // A reconnect clears any in-flight upgrade marker.
        self.upgrading.lock().remove(&id);

        let record = ExecutorRecord {
            id: id.clone(),
            name,
            labels,
            status: ExecutorStatus::Online,
            version: version.clone(),
            last_seen: epoch_ms(),
            session_count: 0,
        };
        if let Err(e) = self.store.upsert_executor(&record) {
            tracing::warn!(executor = %id, err = %e, "failed to persist executor record");
        }
        self.logs.push(&id, "connected", format!("version {version}"));
        tracing::info!(executor = %id, %version, "executor connected");

        let ack = ControlMessage::HelloAck {
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            heartbeat_interval_ms: self.heartbeat_interval_ms(),
        };
        if send_control(&mut ws_tx, &ack).await.is_err() {
            self.deregister(&handle, "handshake write failed").await;
            return;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let starvation = self.heartbeat_interval * 3;
        let mut superseded = false;

        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => {
                    superseded = true;
                    let _ = close_with(&mut ws_tx, 4409, "superseded").await;
                    break;
                }

                _ = heartbeat.tick() => {
                    if handle.last_inbound.lock().elapsed() > starvation {
                        tracing::warn!(executor = %id, "heartbeat starvation, dropping connection");
                        break;
                    }
                    let msg = ControlMessage::Heartbeat { ts: epoch_ms() };
                    if send_control(&mut ws_tx, &msg).await.is_err() {
                        break;
                    }
                }

                msg = outbound_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if send_control(&mut ws_tx, &msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(_)) | None => break,
                    };
                    *handle.last_inbound.lock() = Instant::now();
                    match msg {
                        Message::Text(text) => {
                            match serde_json::from_str::<ControlMessage>(&text) {
                                Ok(msg) => self.handle_inbound(&handle, msg).await,
                                Err(e) => {
                                    tracing::debug!(executor = %id, err = %e, "malformed control message");
                                    let _ = close_with(&mut ws_tx, 4400, "PROTOCOL_ERROR: bad message").await;
                                    break;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        if superseded {
            // The replacement connection owns the registry entry and the
            // record stays online; only fail RPCs still bound to us.
            self.fail_pending_rpcs(&handle.id);
        } else {
            self.deregister(&handle, "connection closed").await;
        }
    }

    async fn handle_inbound(&self, handle: &Arc<ExecutorHandle>, msg: ControlMessage) {
        match msg {
            ControlMessage::Heartbeat { .. } => {}
            ControlMessage::Inventory { sessions } => {
                self.reconcile_inventory(handle, sessions).await;
            }
            ControlMessage::RpcReply { id, outcome } => {
                let pending = self.pending_rpcs.lock().remove(&id);
                match pending {
                    Some(p) => {
                        let result = match outcome {
                            RpcOutcome::Ok { data } => Ok(data),
                            RpcOutcome::Err { code, message } => {
                                Err(HubError::new(map_remote_code(&code), message))
                            }
                        };
                        let _ = p.tx.send(result);
                    }
                    // Late reply after timeout: discarded.
                    None => tracing::debug!(rpc = %id, "discarding late rpc reply"),
                }
            }
            ControlMessage::Log { line } => {
                self.logs.push(&handle.id, "log", line);
            }
            ControlMessage::UpgradeAck {} => {
                self.logs.push(&handle.id, "upgrading", "agent started upgrade");
            }
            other => {
                tracing::debug!(executor = %handle.id, ?other, "unexpected control message");
            }
        }
    }

    async fn reconcile_inventory(&self, handle: &Arc<ExecutorHandle>, sessions: Vec<InventoryEntry>) {
        *handle.inventory.lock() = sessions.clone();

        if let Err(e) = self.store.set_executor_session_count(&handle.id, sessions.len() as i64) {
            tracing::warn!(executor = %handle.id, err = %e, "failed to update session count");
        }

        let sink = self.adoption.lock().clone();
        let Some(sink) = sink else { return };

        let alive: Vec<String> =
            sessions.iter().filter(|e| e.alive).map(|e| e.name.clone()).collect();
        for entry in &sessions {
            if !entry.alive {
                continue;
            }
            match self.store.session_by_name(&entry.name) {
                Ok(None) => sink.adopt_orphan(&handle.id, entry),
                Ok(Some(_)) => {}
                Err(e) => {
                    tracing::warn!(executor = %handle.id, err = %e, "inventory lookup failed")
                }
            }
        }
        sink.reconcile_missing(&handle.id, &alive);
    }

    async fn deregister(&self, handle: &Arc<ExecutorHandle>, why: &str) {
        let mut executors = self.executors.write().await;
        // Only remove the entry if it is still ours; a replacement
        // connection may have taken the slot.
        if executors.get(&handle.id).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            executors.remove(&handle.id);
            drop(executors);
            if let Err(e) = self.store.set_executor_status(&handle.id, ExecutorStatus::Offline) {
                tracing::warn!(executor = %handle.id, err = %e, "failed to mark executor offline");
            }
            self.logs.push(&handle.id, "disconnected", why);
            tracing::info!(executor = %handle.id, %why, "executor disconnected");
        }

        self.fail_pending_rpcs(&handle.id);
        self.drop_pending_channels(&handle.id);
    }

    /// Complete every pending RPC bound to this executor with `Disconnected`.
    fn fail_pending_rpcs(&self, executor_id: &str) {
        let drained: Vec<PendingRpc> = {
            let mut pending = self.pending_rpcs.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.executor_id == executor_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in drained {
            let _ = p
                .tx
                .send(Err(HubError::new(ErrorCode::Disconnected, "control connection lost")));
        }
    }

    /// Drop side-channels still waiting on this executor; their browser
    /// sockets observe the closed oneshot and give up.
    fn drop_pending_channels(&self, executor_id: &str) {
        let mut pending = self.pending_channels.lock();
        pending.retain(|_, c| c.executor_id != executor_id);
    }

    fn token_valid(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let digest = hash_token(token);
        match self.store.find_key_by_hash(&digest) {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => tracing::warn!(err = %e, "key lookup failed"),
        }
        self.static_token.as_deref().is_some_and(|expected| constant_time_eq(expected, token))
    }
}

/// sha256 hex digest of an executor token, as stored in `executor_keys`.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn map_remote_code(code: &str) -> ErrorCode {
    match code {
        "NOT_FOUND" => ErrorCode::NotFound,
        "NAME_TAKEN" => ErrorCode::NameTaken,
        "SPAWN_FAILED" => ErrorCode::SpawnFailed,
        "BAD_REQUEST" => ErrorCode::BadRequest,
        _ => ErrorCode::Internal,
    }
}

async fn send_control<S>(tx: &mut S, msg: &ControlMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn close_with<S>(tx: &mut S, code: u16, reason: &'static str) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    })))
    .await
    .map_err(|_| ())
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
