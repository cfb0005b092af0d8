use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::events::{EventPublisher, SyncEvent};
use crate::session::payload::{clamp_event_time, parse_object};
use crate::storage::{now_ms, MachineRow, Storage, VersionedUpdate};

/// One registered runner host: presence plus two opaque versioned blobs.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub namespace: String,
    pub metadata: Option<Value>,
    pub metadata_version: i64,
    pub runner_state: Option<Value>,
    pub runner_state_version: i64,
    pub active: bool,
    pub active_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Machine {
    fn from_row(row: MachineRow) -> Self {
        Self {
            metadata: parse_object(&row.metadata),
            runner_state: row.runner_state.as_deref().and_then(parse_object),
            id: row.id,
            namespace: row.namespace,
            metadata_version: row.metadata_version,
            runner_state_version: row.runner_state_version,
            active: row.active,
            active_at: row.active_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    pub fn view(&self) -> MachineView {
        MachineView {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            metadata: self.metadata.clone().unwrap_or(Value::Null),
            metadata_version: self.metadata_version,
            runner_state: self.runner_state.clone().unwrap_or(Value::Null),
            runner_state_version: self.runner_state_version,
            active: self.active,
            active_at: self.active_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    pub id: String,
    pub namespace: String,
    pub metadata: Value,
    pub metadata_version: i64,
    pub runner_state: Value,
    pub runner_state_version: i64,
    pub active: bool,
    pub active_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Same shape as the session cache, for per-machine liveness and metadata.
pub struct MachineCache {
    storage: Arc<Storage>,
    publisher: EventPublisher,
    liveness_window_ms: i64,
    broadcast_gap_ms: i64,
    entries: RwLock<HashMap<(String, String), Arc<Mutex<Machine>>>>,
    last_broadcast_at: StdMutex<HashMap<(String, String), i64>>,
}

impl MachineCache {
    pub fn new(
        storage: Arc<Storage>,
        publisher: EventPublisher,
        liveness_window_ms: i64,
        broadcast_gap_ms: i64,
    ) -> Self {
        Self {
            storage,
            publisher,
            liveness_window_ms,
            broadcast_gap_ms,
            entries: RwLock::new(HashMap::new()),
            last_broadcast_at: StdMutex::new(HashMap::new()),
        }
    }

    async fn entry(&self, namespace: &str, id: &str) -> Result<Option<Arc<Mutex<Machine>>>> {
        let key = (namespace.to_string(), id.to_string());
        if let Some(entry) = self.entries.read().await.get(&key) {
            return Ok(Some(entry.clone()));
        }
        let Some(row) = self.storage.get_machine(namespace, id).await? else {
            return Ok(None);
        };
        let mut map = self.entries.write().await;
        Ok(Some(
            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Machine::from_row(row))))
                .clone(),
        ))
    }

    fn emit_updated(&self, view: &MachineView) {
        self.last_broadcast_at
            .lock()
            .unwrap()
            .insert((view.namespace.clone(), view.id.clone()), now_ms());
        self.publisher.emit(SyncEvent::MachineUpdated {
            namespace: view.namespace.clone(),
            machine: view.clone(),
        });
    }

    async fn adopt_row(&self, row: MachineRow) -> MachineView {
        let fresh = Machine::from_row(row);
        let view = fresh.view();
        let key = (view.namespace.clone(), view.id.clone());
        let mut map = self.entries.write().await;
        match map.get(&key) {
            Some(entry) => *entry.lock().await = fresh,
            None => {
                map.insert(key, Arc::new(Mutex::new(fresh)));
            }
        }
        view
    }

    /// Register a machine (idempotent) and emit an update.
    pub async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        metadata: &Value,
        runner_state: Option<&Value>,
    ) -> Result<MachineView> {
        let row = self
            .storage
            .upsert_machine(namespace, id, metadata, runner_state)
            .await?;
        let view = self.adopt_row(row).await;
        self.emit_updated(&view);
        Ok(view)
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<MachineView>> {
        match self.entry(namespace, id).await? {
            Some(entry) => Ok(Some(entry.lock().await.view())),
            None => Ok(None),
        }
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<MachineView>> {
        let rows = self.storage.list_machines(namespace).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let key = (row.namespace.clone(), row.id.clone());
            let cached = self.entries.read().await.get(&key).cloned();
            let entry = match cached {
                Some(e) => e,
                None => {
                    let mut map = self.entries.write().await;
                    map.entry(key)
                        .or_insert_with(|| Arc::new(Mutex::new(Machine::from_row(row))))
                        .clone()
                }
            };
            views.push(entry.lock().await.view());
        }
        Ok(views)
    }

    /// Runner heartbeat: promote to active, monotonically raise `active_at`,
    /// and broadcast only on transition or when the coalescing gap elapsed.
    pub async fn handle_alive(&self, namespace: &str, id: &str, time: i64) -> Result<()> {
        let Some(entry) = self.entry(namespace, id).await? else {
            return Ok(());
        };
        let now = now_ms();
        let time = clamp_event_time(time, now);

        let (view, active_at) = {
            let mut m = entry.lock().await;
            let was_active = m.active;
            m.active = true;
            if time > m.active_at {
                m.active_at = time;
            }
            let due = {
                let last = self.last_broadcast_at.lock().unwrap();
                match last.get(&(namespace.to_string(), id.to_string())) {
                    Some(at) => now - at >= self.broadcast_gap_ms,
                    None => true,
                }
            };
            let view = (!was_active || due).then(|| m.view());
            (view, m.active_at)
        };

        if let Some(view) = &view {
            self.emit_updated(view);
        }
        self.storage
            .update_machine_presence(namespace, id, true, active_at)
            .await?;
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: &Value,
        expected_version: i64,
    ) -> Result<VersionedUpdate<MachineView>> {
        match self
            .storage
            .update_machine_metadata(namespace, id, metadata, expected_version)
            .await?
        {
            VersionedUpdate::Updated(row) => {
                let view = self.adopt_row(row).await;
                self.emit_updated(&view);
                Ok(VersionedUpdate::Updated(view))
            }
            VersionedUpdate::VersionMismatch(row) => {
                Ok(VersionedUpdate::VersionMismatch(self.adopt_row(row).await))
            }
            VersionedUpdate::NotFound => Ok(VersionedUpdate::NotFound),
        }
    }

    pub async fn update_runner_state(
        &self,
        namespace: &str,
        id: &str,
        state: Option<&Value>,
        expected_version: i64,
    ) -> Result<VersionedUpdate<MachineView>> {
        match self
            .storage
            .update_machine_runner_state(namespace, id, state, expected_version)
            .await?
        {
            VersionedUpdate::Updated(row) => {
                let view = self.adopt_row(row).await;
                self.emit_updated(&view);
                Ok(VersionedUpdate::Updated(view))
            }
            VersionedUpdate::VersionMismatch(row) => {
                Ok(VersionedUpdate::VersionMismatch(self.adopt_row(row).await))
            }
            VersionedUpdate::NotFound => Ok(VersionedUpdate::NotFound),
        }
    }

    /// Demote machines whose heartbeats lapsed.
    pub async fn expire_inactive(&self, now: i64) -> Result<usize> {
        let snapshot: Vec<Arc<Mutex<Machine>>> =
            self.entries.read().await.values().cloned().collect();

        let mut demoted = Vec::new();
        for entry in snapshot {
            let view = {
                let mut m = entry.lock().await;
                if !m.active || now - m.active_at < self.liveness_window_ms {
                    continue;
                }
                m.active = false;
                m.view()
            };
            self.emit_updated(&view);
            demoted.push(view);
        }

        for view in &demoted {
            if let Err(e) = self
                .storage
                .update_machine_presence(&view.namespace, &view.id, false, view.active_at)
                .await
            {
                warn!(machine = %view.id, err = %e, "failed to persist machine demotion");
            }
        }
        Ok(demoted.len())
    }
}
