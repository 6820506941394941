// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session PTY bridge: one upstream emulator attach fanned out to N
//! browser clients.
//!
//! The upstream attach is a PTY running `tmux attach-session`, reference-
//! counted by attached clients. Input from each client preserves
//! per-connection order; output broadcasts verbatim to every client. The
//! authoritative terminal size is the maximum over all clients' requested
//! sizes. When the last client detaches the attach lingers briefly to
//! absorb rapid reconnects, then tears down. The backing session always
//! outlives its clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use roost_core::pty::NativePty;
use roost_core::tmux::TmuxControl;

use crate::error::{ErrorCode, HubError};

/// Broadcast depth per bridge; a client this far behind is disconnected
/// rather than allowed to stall the others.
const OUTPUT_DEPTH: usize = 256;

/// How long `Draining` may flush buffered output before the bridge frees.
const DRAIN: Duration = Duration::from_millis(100);

/// Bridge lifecycle, observable for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Attaching,
    Streaming,
    Draining,
    Closed,
}

/// Identifies one browser client within a bridge.
pub type ClientId = u64;

/// Registry of live bridges keyed by emulator session name.
pub struct Bridges {
    tmux: TmuxControl,
    linger: Duration,
    map: Mutex<HashMap<String, Arc<TerminalBridge>>>,
}

impl Bridges {
    pub fn new(tmux: TmuxControl, linger: Duration) -> Self {
        Self { tmux, linger, map: Mutex::new(HashMap::new()) }
    }

    /// Attach a client to the named emulator session, creating the
    /// upstream attach if this is the first client.
    pub async fn attach(
        self: &Arc<Self>,
        emulator_name: &str,
        cols: u16,
        rows: u16,
    ) -> Result<BridgeClient, HubError> {
        let bridge = match self.live_bridge(emulator_name) {
            Some(b) => b,
            None => self.create_bridge(emulator_name, cols, rows).await?,
        };
        Ok(bridge.add_client(cols, rows))
    }

    /// Tear down the bridge for a session (delete path). The emulator
    /// session itself is killed by the caller.
    pub fn close(&self, emulator_name: &str) {
        let bridge = self.map.lock().remove(emulator_name);
        if let Some(bridge) = bridge {
            bridge.shutdown();
        }
    }

    fn live_bridge(&self, name: &str) -> Option<Arc<TerminalBridge>> {
        let map = self.map.lock();
        map.get(name)
            .filter(|b| {
                !b.cancel.is_cancelled()
                    && matches!(b.state(), BridgeState::Attaching | BridgeState::Streaming)
            })
            .map(Arc::clone)
    }

    async fn create_bridge(
        self: &Arc<Self>,
        name: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalBridge>, HubError> {
        // Attaching fails if the backing session does not exist.
        if !self.tmux.exists(name).await {
            return Err(HubError::new(
                ErrorCode::NotFound,
                format!("no backing session '{name}'"),
            ));
        }

        let bridge = TerminalBridge::start(&self.tmux, name, cols, rows, self.linger)?;

        let mut map = self.map.lock();
        // Another client may have raced us here; the existing attach wins
        // so at most one upstream attach exists per session.
        if let Some(existing) = map.get(name).filter(|b| !b.cancel.is_cancelled()) {
            bridge.shutdown();
            return Ok(Arc::clone(existing));
        }
        map.insert(name.to_owned(), Arc::clone(&bridge));

        // Remove the entry once the bridge closes, whatever the cause.
        let registry = Arc::clone(self);
        let watched = Arc::clone(&bridge);
        let key = name.to_owned();
        tokio::spawn(async move {
            watched.cancel.cancelled().await;
            let mut map = registry.map.lock();
            if map.get(&key).is_some_and(|b| Arc::ptr_eq(b, &watched)) {
                map.remove(&key);
            }
        });

        Ok(bridge)
    }
}

struct ClientSlot {
    cols: u16,
    rows: u16,
}

/// One upstream attach shared by all clients of a session.
pub struct TerminalBridge {
    name: String,
    input_tx: mpsc::Sender<Bytes>,
    output_tx: broadcast::Sender<Bytes>,
    size_tx: watch::Sender<(u16, u16)>,
    clients: Mutex<HashMap<ClientId, ClientSlot>>,
    next_id: AtomicU64,
    state: Mutex<BridgeState>,
    linger: Duration,
    linger_guard: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl TerminalBridge {
    fn start(
        tmux: &TmuxControl,
        name: &str,
        cols: u16,
        rows: u16,
        linger: Duration,
    ) -> Result<Arc<Self>, HubError> {
        let argv = tmux.attach_argv(name);
        let mut pty = NativePty::spawn(&argv, cols, rows)
            .map_err(|e| HubError::new(ErrorCode::SpawnFailed, format!("attach failed: {e}")))?;

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
        let (output_tx, _) = broadcast::channel::<Bytes>(OUTPUT_DEPTH);
        let (size_tx, size_rx) = watch::channel((cols, rows));
        let cancel = CancellationToken::new();

        let bridge = Arc::new(Self {
            name: name.to_owned(),
            input_tx,
            output_tx: output_tx.clone(),
            size_tx,
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: Mutex::new(BridgeState::Attaching),
            linger,
            linger_guard: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let task = Arc::clone(&bridge);
        tokio::spawn(async move {
            task.set_state(BridgeState::Streaming);
            let (raw_tx, mut raw_rx) = mpsc::channel::<Bytes>(64);

            let pump = async {
                let mut run = std::pin::pin!(pty.run(raw_tx, input_rx, size_rx));
                loop {
                    tokio::select! {
                        status = &mut run => {
                            tracing::debug!(session = %task.name, ?status, "upstream attach ended");
                            break;
                        }
                        data = raw_rx.recv() => {
                            match data {
                                // Lagged receivers surface as errors on
                                // their own recv; send never blocks.
                                Some(bytes) => { let _ = task.output_tx.send(bytes); }
                                None => break,
                            }
                        }
                    }
                }
            };

            tokio::select! {
                _ = task.cancel.cancelled() => {}
                _ = pump => {}
            }

            task.set_state(BridgeState::Draining);
            tokio::time::sleep(DRAIN).await;
            task.set_state(BridgeState::Closed);
            task.cancel.cancel();
        });

        Ok(bridge)
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    fn set_state(&self, next: BridgeState) {
        *self.state.lock() = next;
    }

    fn add_client(self: &Arc<Self>, cols: u16, rows: u16) -> BridgeClient {
        // A reconnect within the linger window keeps the attach alive.
        if let Some(guard) = self.linger_guard.lock().take() {
            guard.cancel();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().insert(id, ClientSlot { cols, rows });
        self.apply_max_size();

        BridgeClient { id, bridge: Arc::clone(self), output_rx: self.output_tx.subscribe() }
    }

    fn remove_client(self: &Arc<Self>, id: ClientId) {
        let empty = {
            let mut clients = self.clients.lock();
            clients.remove(&id);
            clients.is_empty()
        };
        if !empty {
            self.apply_max_size();
            return;
        }

        // Last client gone: linger, then tear down unless someone returned.
        let guard = CancellationToken::new();
        *self.linger_guard.lock() = Some(guard.clone());
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(bridge.linger) => {
                    if bridge.clients.lock().is_empty() {
                        bridge.cancel.cancel();
                    }
                }
            }
        });
    }

    /// Recompute the authoritative size as the max over all clients and
    /// push it upstream. The watch channel keeps only the latest value.
    fn apply_max_size(&self) {
        let clients = self.clients.lock();
        let cols = clients.values().map(|c| c.cols).max();
        let rows = clients.values().map(|c| c.rows).max();
        if let (Some(cols), Some(rows)) = (cols, rows) {
            self.size_tx.send_if_modified(|current| {
                if *current == (cols, rows) {
                    false
                } else {
                    *current = (cols, rows);
                    true
                }
            });
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// What a client read from the bridge.
pub enum BridgeRead {
    /// Upstream output to forward verbatim.
    Data(Bytes),
    /// The client fell behind the broadcast and must be disconnected.
    Lagged,
    /// The upstream attach ended.
    Closed,
}

/// Handle held by one browser connection.
pub struct BridgeClient {
    id: ClientId,
    bridge: Arc<TerminalBridge>,
    output_rx: broadcast::Receiver<Bytes>,
}

impl BridgeClient {
    /// Forward raw input bytes to the upstream, preserving this
    /// connection's order. Backpressure blocks only this client.
    pub async fn send_input(&self, data: Bytes) -> Result<(), HubError> {
        self.bridge
            .input_tx
            .send(data)
            .await
            .map_err(|_| HubError::new(ErrorCode::Disconnected, "upstream attach closed"))
    }

    /// Record this client's requested size; the max over all clients wins.
    pub fn request_resize(&self, cols: u16, rows: u16) {
        {
            let mut clients = self.bridge.clients.lock();
            if let Some(slot) = clients.get_mut(&self.id) {
                slot.cols = cols;
                slot.rows = rows;
            }
        }
        self.bridge.apply_max_size();
    }

    /// Receive the next upstream output chunk.
    pub async fn recv(&mut self) -> BridgeRead {
        match self.output_rx.recv().await {
            Ok(data) => BridgeRead::Data(data),
            Err(broadcast::error::RecvError::Lagged(_)) => BridgeRead::Lagged,
            Err(broadcast::error::RecvError::Closed) => BridgeRead::Closed,
        }
    }

    /// Cancellation signal for this bridge.
    pub fn closed(&self) -> CancellationToken {
        self.bridge.cancel.clone()
    }

    /// Detach this client, triggering the linger teardown when it was the
    /// last one. A clean detach never kills the backing session.
    pub fn detach(self) {
        self.bridge.remove_client(self.id);
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
