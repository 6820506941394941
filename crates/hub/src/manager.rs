// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: owns the session namespace, decides local vs remote
//! placement, and fronts the store, the tmux adapter, and the executor
//! registry behind one façade.
//!
//! Placement is a two-variant decision made at each operation's entry
//! point: `executor_id == "local"` runs against the local tmux server,
//! anything else dispatches an RPC through the registry. Both paths
//! return the same shapes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use roost_core::protocol::{InventoryEntry, RpcPayload};
use roost_core::record::{SessionMode, SessionRecord};
use roost_core::richlog::{self, RichDir};
use roost_core::tmux::TmuxControl;
use roost_core::{epoch_ms, LOCAL};

use crate::bridge::Bridges;
use crate::error::{ErrorCode, HubError};
use crate::names;
use crate::registry::{AdoptionSink, ExecutorRegistry};
use crate::store::{SessionStore, StoreError};

/// Text returned by snapshot when no backing session exists.
pub const NOT_RUNNING: &str = "[session not running]";

/// Parameters for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub description: Option<String>,
    pub command: Option<String>,
    pub executor_id: Option<String>,
    pub mode: Option<SessionMode>,
}

/// Parameters for the job convenience path.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub prompt: String,
    pub max_iterations: Option<u32>,
    pub executor_id: Option<String>,
    pub skip_permissions: bool,
}

/// A session record enriched with derived liveness.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub alive: bool,
}

/// An executor record enriched with live registry state.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorView {
    #[serde(flatten)]
    pub record: roost_core::record::ExecutorRecord,
    pub upgrading: bool,
}

/// Where an attach should go.
pub enum AttachTarget {
    Local { emulator_name: String },
    Remote { executor_id: String, session_name: String },
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    tmux: TmuxControl,
    bridges: Arc<Bridges>,
    data_dir: PathBuf,
    ai_command: String,
    registry: parking_lot::RwLock<Option<Arc<ExecutorRegistry>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        tmux: TmuxControl,
        bridges: Arc<Bridges>,
        data_dir: PathBuf,
        ai_command: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tmux,
            bridges,
            data_dir,
            ai_command,
            registry: parking_lot::RwLock::new(None),
        })
    }

    /// Injection: without a registry all operations run local-only and
    /// remote paths short-circuit.
    pub fn set_registry(&self, registry: Arc<ExecutorRegistry>) {
        *self.registry.write() = Some(registry);
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn bridges(&self) -> &Arc<Bridges> {
        &self.bridges
    }

    pub fn registry(&self) -> Option<Arc<ExecutorRegistry>> {
        self.registry.read().clone()
    }

    fn registry_for(&self, executor_id: &str) -> Result<Arc<ExecutorRegistry>, HubError> {
        self.registry().ok_or_else(|| {
            HubError::new(
                ErrorCode::ExecutorOffline,
                format!("no executor registry available for '{executor_id}'"),
            )
        })
    }

    // -- create ---------------------------------------------------------------

    /// Create a session: assign a fresh name, persist the record, then
    /// spawn the backing process. A failed spawn removes the record.
    pub async fn create(&self, params: CreateParams, owner_id: &str) -> Result<SessionView, HubError> {
        let mode = params.mode.unwrap_or(SessionMode::Terminal);
        let executor_id = params.executor_id.unwrap_or_else(|| LOCAL.to_owned());
        let command = match params.command {
            Some(c) if !c.is_empty() => c,
            _ => match mode {
                SessionMode::Terminal => "bash".to_owned(),
                SessionMode::Rich => self.ai_command.clone(),
            },
        };

        // Placement errors must precede record creation: two successive
        // creates against an offline executor leave no records behind.
        if executor_id != LOCAL {
            let registry = self.registry_for(&executor_id)?;
            if !registry.is_online(&executor_id).await {
                return Err(HubError::new(
                    ErrorCode::ExecutorOffline,
                    format!("executor '{executor_id}' is offline"),
                ));
            }
        }

        let record = self.persist_new(
            params.description.unwrap_or_default(),
            mode,
            command,
            executor_id,
            owner_id,
            None,
            None,
        )?;

        if let Err(e) = self.spawn_backing(&record).await {
            let _ = self.store.delete_session(owner_id, &record.name);
            return Err(e);
        }

        Ok(SessionView { record, alive: true })
    }

    /// Job convenience: a rich session whose command derives from the
    /// default AI CLI invocation, with the prompt stored on the record.
    pub async fn create_job(&self, params: JobParams, owner_id: &str) -> Result<SessionView, HubError> {
        if params.prompt.is_empty() {
            return Err(HubError::new(ErrorCode::BadRequest, "prompt is required"));
        }
        let executor_id = params.executor_id.unwrap_or_else(|| LOCAL.to_owned());
        let mut command = self.ai_command.clone();
        if let Some(n) = params.max_iterations {
            command.push_str(&format!(" --max-iterations {n}"));
        }
        if params.skip_permissions {
            command.push_str(" --dangerously-skip-permissions");
        }

        if executor_id != LOCAL {
            let registry = self.registry_for(&executor_id)?;
            if !registry.is_online(&executor_id).await {
                return Err(HubError::new(
                    ErrorCode::ExecutorOffline,
                    format!("executor '{executor_id}' is offline"),
                ));
            }
        }

        let record = self.persist_new(
            String::new(),
            SessionMode::Rich,
            command,
            executor_id,
            owner_id,
            None,
            Some(params.prompt),
        )?;

        if let Err(e) = self.spawn_backing(&record).await {
            let _ = self.store.delete_session(owner_id, &record.name);
            return Err(e);
        }

        Ok(SessionView { record, alive: true })
    }

    // -- fork -----------------------------------------------------------------

    /// Fork a session: fresh name, same executor and mode, parent
    /// recorded. Rich forks copy the parent's event log up to its current
    /// length so the child starts with the parent's context.
    pub async fn fork(&self, source_name: &str, owner_id: &str) -> Result<SessionView, HubError> {
        let source = self
            .store
            .get_session(owner_id, source_name)
            .map_err(|_| HubError::not_found(format!("session '{source_name}'")))?;

        let record = self.persist_new(
            source.description.clone(),
            source.mode,
            source.command.clone(),
            source.executor_id.clone(),
            owner_id,
            Some(source.name.clone()),
            None,
        )?;

        let spawned = if source.executor_id == LOCAL {
            self.fork_local(&source, &record).await
        } else {
            let registry = self.registry_for(&source.executor_id)?;
            registry
                .call(
                    &source.executor_id,
                    RpcPayload::ForkSession {
                        source: source.name.clone(),
                        name: record.name.clone(),
                        mode: source.mode,
                        command: source.command.clone(),
                    },
                )
                .await
                .map(|_| ())
        };

        if let Err(e) = spawned {
            let _ = self.store.delete_session(owner_id, &record.name);
            return Err(e);
        }

        Ok(SessionView { record, alive: true })
    }

    async fn fork_local(&self, source: &SessionRecord, child: &SessionRecord) -> Result<(), HubError> {
        if source.mode == SessionMode::Rich {
            let parent_dir = RichDir::new(&self.data_dir, &source.name);
            let child_dir = RichDir::new(&self.data_dir, &child.name);
            richlog::copy_event_prefix(&parent_dir, &child_dir)
                .map_err(|e| HubError::new(ErrorCode::Internal, format!("fork copy failed: {e}")))?;
        }
        self.spawn_backing(child).await
    }

    // -- delete ---------------------------------------------------------------

    /// Delete a session: kill the backing (idempotent for dead sessions)
    /// and remove the record. Owner mismatch reads as not found.
    pub async fn delete(&self, name: &str, owner_id: &str) -> Result<(), HubError> {
        let record = self
            .store
            .get_session(owner_id, name)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))?;

        if record.executor_id == LOCAL {
            let emulator = record.emulator_name();
            self.bridges.close(&emulator);
            let _ = self.tmux.kill(&emulator).await;
            if record.mode == SessionMode::Rich {
                let dir = RichDir::new(&self.data_dir, &record.name);
                let _ = std::fs::remove_dir_all(dir.path());
            }
        } else if let Ok(registry) = self.registry_for(&record.executor_id) {
            // A failed delete RPC (offline agent, dead backing) still
            // removes the record; the agent reconciles on reconnect.
            if let Err(e) = registry
                .call(
                    &record.executor_id,
                    RpcPayload::DeleteSession { name: record.name.clone(), mode: record.mode },
                )
                .await
            {
                tracing::debug!(session = %name, err = %e, "remote delete rpc failed");
            }
        }

        self.store.delete_session(owner_id, name).map_err(store_err)?;
        Ok(())
    }

    // -- snapshot -------------------------------------------------------------

    /// Current visible text of a session, or a placeholder when no
    /// backing exists.
    pub async fn snapshot(&self, name: &str, owner_id: &str) -> Result<String, HubError> {
        let record = self
            .store
            .get_session(owner_id, name)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))?;

        if record.executor_id == LOCAL {
            let emulator = record.emulator_name();
            if !self.tmux.exists(&emulator).await {
                return Ok(NOT_RUNNING.to_owned());
            }
            return self
                .tmux
                .capture(&emulator)
                .await
                .map_err(|e| HubError::new(ErrorCode::Internal, format!("capture failed: {e}")));
        }

        let registry = self.registry_for(&record.executor_id)?;
        match registry
            .call(
                &record.executor_id,
                RpcPayload::SnapshotSession { name: record.name.clone(), mode: record.mode },
            )
            .await
        {
            Ok(data) => Ok(data
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or(NOT_RUNNING)
                .to_owned()),
            Err(e) if e.code == ErrorCode::NotFound || e.code == ErrorCode::ExecutorOffline => {
                Ok(NOT_RUNNING.to_owned())
            }
            Err(e) => Err(e),
        }
    }

    // -- listing --------------------------------------------------------------

    /// An owner's sessions in order, each with derived liveness.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<SessionView>, HubError> {
        let records = self.store.list_sessions(owner_id).map_err(store_err)?;
        let registry = self.registry();

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let alive = if record.executor_id == LOCAL {
                self.tmux.exists(&record.emulator_name()).await
            } else {
                match registry {
                    Some(ref reg) => match reg.handle(&record.executor_id).await {
                        Some(handle) => handle.inventory_alive(&record.name),
                        None => false,
                    },
                    None => false,
                }
            };
            views.push(SessionView { record, alive });
        }
        Ok(views)
    }

    pub async fn list_executors(&self) -> Result<Vec<ExecutorView>, HubError> {
        let records = self.store.list_executors().map_err(store_err)?;
        let registry = self.registry();
        let mut views = Vec::with_capacity(records.len());
        for mut record in records {
            // The live connection table is authoritative; persisted status
            // can be stale after a hub restart.
            let (online, upgrading) = match registry {
                Some(ref reg) => (reg.is_online(&record.id).await, reg.is_upgrading(&record.id)),
                None => (false, false),
            };
            record.status = if online {
                roost_core::record::ExecutorStatus::Online
            } else {
                roost_core::record::ExecutorStatus::Offline
            };
            views.push(ExecutorView { record, upgrading });
        }
        Ok(views)
    }

    // -- misc operations ------------------------------------------------------

    pub fn reorder(&self, names: &[String], owner_id: &str) -> Result<(), HubError> {
        self.store.reorder_sessions(owner_id, names).map_err(store_err)
    }

    pub fn summarize(&self, name: &str, owner_id: &str, description: &str) -> Result<(), HubError> {
        self.store
            .set_description(owner_id, name, description)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))
    }

    /// Rich-session diagnostics; remote rich only.
    pub async fn diagnose(&self, name: &str, owner_id: &str) -> Result<serde_json::Value, HubError> {
        let record = self
            .store
            .get_session(owner_id, name)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))?;

        if record.mode != SessionMode::Rich {
            return Err(HubError::new(ErrorCode::BadRequest, "diagnostics are rich-only"));
        }
        if record.executor_id == LOCAL {
            return Err(HubError::new(
                ErrorCode::BadRequest,
                "diagnostics apply to remote rich sessions",
            ));
        }

        let registry = self.registry_for(&record.executor_id)?;
        registry
            .call(
                &record.executor_id,
                RpcPayload::DiagnoseRichSession { name: record.name.clone() },
            )
            .await
    }

    /// Resolve where an attach for this session must go.
    pub fn attach_target(&self, name: &str, owner_id: &str) -> Result<AttachTarget, HubError> {
        let record = self
            .store
            .get_session(owner_id, name)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))?;

        let _ = self.store.touch_activity(name);

        if record.executor_id == LOCAL {
            Ok(AttachTarget::Local { emulator_name: record.emulator_name() })
        } else {
            Ok(AttachTarget::Remote {
                executor_id: record.executor_id,
                session_name: record.name,
            })
        }
    }

    /// The rich channel resources for a local rich session.
    pub fn rich_session(&self, record_name: &str) -> roost_core::richlog::RichSession {
        let dir = RichDir::new(&self.data_dir, record_name);
        roost_core::richlog::RichSession::new(
            dir,
            self.tmux.clone(),
            SessionMode::Rich.emulator_name(record_name),
        )
    }

    /// Owner-scoped record fetch for the transport layer.
    pub fn get(&self, name: &str, owner_id: &str) -> Result<SessionRecord, HubError> {
        self.store
            .get_session(owner_id, name)
            .map_err(|_| HubError::not_found(format!("session '{name}'")))
    }

    // -- internals ------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn persist_new(
        &self,
        description: String,
        mode: SessionMode,
        command: String,
        executor_id: String,
        owner_id: &str,
        parent_name: Option<String>,
        job_prompt: Option<String>,
    ) -> Result<SessionRecord, HubError> {
        // Names are generated until unique; the store's primary key is
        // the backstop for races.
        for attempt in 0..8 {
            let name = if attempt < 4 { names::random_name() } else { names::random_name_suffixed() };
            if self.store.name_exists(&name).map_err(store_err)? {
                continue;
            }
            let now = epoch_ms();
            let record = SessionRecord {
                name,
                description: description.clone(),
                mode,
                command: command.clone(),
                executor_id: executor_id.clone(),
                owner_id: owner_id.to_owned(),
                parent_name: parent_name.clone(),
                job_prompt: job_prompt.clone(),
                order_index: self.store.next_order_index(owner_id).map_err(store_err)?,
                created_at: now,
                last_activity: now,
            };
            match self.store.create_session(&record) {
                Ok(()) => return Ok(record),
                Err(StoreError::NameTaken) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
        Err(HubError::new(ErrorCode::Internal, "could not allocate a unique session name"))
    }

    async fn spawn_backing(&self, record: &SessionRecord) -> Result<(), HubError> {
        if record.executor_id == LOCAL {
            let emulator = record.emulator_name();
            let command = match record.mode {
                SessionMode::Terminal => record.command.clone(),
                SessionMode::Rich => {
                    let dir = RichDir::new(&self.data_dir, &record.name);
                    dir.ensure().map_err(|e| {
                        HubError::new(ErrorCode::SpawnFailed, format!("rich dir: {e}"))
                    })?;
                    richlog::wrap_command(&record.command, &dir)
                }
            };
            self.tmux
                .spawn(&emulator, &command, None, &[])
                .await
                .map_err(|e| HubError::new(ErrorCode::SpawnFailed, format!("{e}")))
        } else {
            let registry = self.registry_for(&record.executor_id)?;
            registry
                .call(
                    &record.executor_id,
                    RpcPayload::CreateSession {
                        name: record.name.clone(),
                        mode: record.mode,
                        command: record.command.clone(),
                        cwd: None,
                    },
                )
                .await
                .map(|_| ())
        }
    }
}

impl AdoptionSink for SessionManager {
    fn adopt_orphan(&self, executor_id: &str, entry: &InventoryEntry) {
        match self.store.name_exists(&entry.name) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(err = %e, "adoption lookup failed");
                return;
            }
        }
        let now = epoch_ms();
        let record = SessionRecord {
            name: entry.name.clone(),
            description: format!("adopted from {executor_id}"),
            mode: entry.mode,
            command: String::new(),
            executor_id: executor_id.to_owned(),
            owner_id: LOCAL.to_owned(),
            parent_name: None,
            job_prompt: None,
            order_index: self.store.next_order_index(LOCAL).unwrap_or(0),
            created_at: now,
            last_activity: entry.last_activity,
        };
        match self.store.create_session(&record) {
            Ok(()) => {
                tracing::info!(session = %entry.name, executor = %executor_id, "adopted orphan session")
            }
            Err(StoreError::NameTaken) => {}
            Err(e) => tracing::warn!(err = %e, "failed to adopt orphan"),
        }
    }

    fn reconcile_missing(&self, executor_id: &str, alive_names: &[String]) {
        // Liveness is derived at list time from the latest inventory, so
        // a missing backing needs no record mutation here.
        let records = match self.store.list_sessions_for_executor(executor_id) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(err = %e, "reconcile listing failed");
                return;
            }
        };
        for record in records {
            if !alive_names.contains(&record.name) {
                tracing::debug!(session = %record.name, executor = %executor_id, "backing missing, session reads dead");
            }
        }
    }
}

fn store_err(e: StoreError) -> HubError {
    match e {
        StoreError::NameTaken => HubError::new(ErrorCode::NameTaken, "name already taken"),
        StoreError::NotFound => HubError::new(ErrorCode::NotFound, "not found"),
        StoreError::Db(e) => HubError::new(ErrorCode::Internal, format!("store: {e}")),
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
