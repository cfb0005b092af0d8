pub mod payload;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::events::{EventPublisher, SyncEvent};
use crate::storage::{now_ms, SessionRow, Storage, VersionedUpdate};
use payload::{clamp_event_time, extract_todos, merge_metadata, parse_array, parse_object};

/// How many trailing messages the one-shot todo backfill scans.
const TODO_BACKFILL_SCAN: i64 = 200;
/// Bound on the backfill-attempted set; cleared wholesale when reached.
const TODO_BACKFILL_CAP: usize = 4096;
/// Internal agent-state writes retry a few times on version races.
const AGENT_STATE_RETRIES: usize = 3;

// ─── Hydrated session ─────────────────────────────────────────────────────────

/// In-memory authoritative view of one session.
///
/// Opaque blobs are parsed once at hydration; a blob that fails its shape
/// check is kept as `None` without rejecting the row.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub namespace: String,
    pub tag: Option<String>,
    pub seq: i64,
    pub metadata: Option<Value>,
    pub metadata_version: i64,
    pub agent_state: Option<Value>,
    pub agent_state_version: i64,
    pub todos: Option<Value>,
    pub todos_updated_at: i64,
    pub active: bool,
    pub active_at: i64,
    pub thinking: bool,
    pub thinking_at: i64,
    pub permission_mode: String,
    pub model_mode: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    fn from_row(row: SessionRow) -> Self {
        Self {
            metadata: parse_object(&row.metadata),
            agent_state: row.agent_state.as_deref().and_then(parse_object),
            todos: row.todos.as_deref().and_then(parse_array),
            id: row.id,
            namespace: row.namespace,
            tag: row.tag,
            seq: row.seq,
            metadata_version: row.metadata_version,
            agent_state_version: row.agent_state_version,
            todos_updated_at: row.todos_updated_at,
            active: row.active,
            active_at: row.active_at,
            thinking: row.thinking,
            thinking_at: row.thinking_at,
            permission_mode: row.permission_mode,
            model_mode: row.model_mode,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            tag: self.tag.clone(),
            seq: self.seq,
            metadata: self.metadata.clone().unwrap_or(Value::Null),
            metadata_version: self.metadata_version,
            agent_state: self.agent_state.clone().unwrap_or(Value::Null),
            agent_state_version: self.agent_state_version,
            todos: self.todos.clone(),
            todos_updated_at: self.todos_updated_at,
            active: self.active,
            active_at: self.active_at,
            thinking: self.thinking,
            thinking_at: self.thinking_at,
            permission_mode: self.permission_mode.clone(),
            model_mode: self.model_mode.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub seq: i64,
    pub metadata: Value,
    pub metadata_version: i64,
    pub agent_state: Value,
    pub agent_state_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<Value>,
    pub todos_updated_at: i64,
    pub active: bool,
    pub active_at: i64,
    pub thinking: bool,
    pub thinking_at: i64,
    pub permission_mode: String,
    pub model_mode: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The session is still heartbeating; deletion refused.
    ActiveRefused,
    NotFound,
}

/// Heartbeat payload from the runner channel.
#[derive(Debug, Clone)]
pub struct SessionAlive {
    pub session_id: String,
    pub time: i64,
    pub thinking: Option<bool>,
    pub permission_mode: Option<String>,
    pub model_mode: Option<String>,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

pub struct SessionCache {
    storage: Arc<Storage>,
    publisher: EventPublisher,
    /// Liveness window: active sessions with `active_at` older than this are demoted.
    liveness_window_ms: i64,
    /// Minimum gap between heartbeat-only `session-updated` broadcasts.
    broadcast_gap_ms: i64,
    entries: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    last_broadcast_at: StdMutex<HashMap<String, i64>>,
    todo_backfill_attempted: StdMutex<HashSet<String>>,
}

impl SessionCache {
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
            todo_backfill_attempted: StdMutex::new(HashSet::new()),
        }
    }

    // ─── Lookup & hydration ─────────────────────────────────────────────────

    /// Fetch the entry for a session, hydrating quietly from storage when the
    /// id is not cached yet. Quiet hydration emits nothing.
    async fn entry(&self, namespace: &str, id: &str) -> Result<Option<Arc<Mutex<Session>>>> {
        if let Some(entry) = self.entries.read().await.get(id) {
            if entry.lock().await.namespace == namespace {
                return Ok(Some(entry.clone()));
            }
            return Ok(None);
        }
        let Some(row) = self.storage.get_session(namespace, id).await? else {
            return Ok(None);
        };
        Ok(Some(self.insert_quiet(row).await))
    }

    async fn insert_quiet(&self, row: SessionRow) -> Arc<Mutex<Session>> {
        let mut map = self.entries.write().await;
        map.entry(row.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::from_row(row))))
            .clone()
    }

    async fn evict(&self, id: &str) -> bool {
        let removed = self.entries.write().await.remove(id).is_some();
        self.last_broadcast_at.lock().unwrap().remove(id);
        removed
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<SessionView>> {
        match self.entry(namespace, id).await? {
            Some(entry) => Ok(Some(entry.lock().await.view())),
            None => Ok(None),
        }
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<SessionView>> {
        let rows = self.storage.list_sessions(namespace).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            // Prefer the live entry; it may carry fresher presence flags.
            let cached = self.entries.read().await.get(&row.id).cloned();
            let entry = match cached {
                Some(e) => e,
                None => self.insert_quiet(row).await,
            };
            views.push(entry.lock().await.view());
        }
        views.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(views)
    }

    // ─── Create / refresh ───────────────────────────────────────────────────

    /// Delegate to storage (reusing an existing `tag` row when present) and
    /// refresh the cache entry, emitting `session-added` or `session-updated`.
    pub async fn get_or_create(
        self: &Arc<Self>,
        namespace: &str,
        tag: Option<&str>,
        metadata: &Value,
        agent_state: Option<&Value>,
    ) -> Result<SessionView> {
        let row = self
            .storage
            .create_session(namespace, tag, metadata, agent_state)
            .await?;
        let id = row.id.clone();
        self.refresh(namespace, &id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session vanished after create: {id}"))
    }

    /// Reload one session from storage.
    ///
    /// Emits `session-added` when the id was not cached, `session-updated`
    /// when it was, and `session-removed` (plus eviction) when storage no
    /// longer has the row. Schedules the one-shot todo backfill for sessions
    /// without a todo list.
    pub async fn refresh(self: &Arc<Self>, namespace: &str, id: &str) -> Result<Option<SessionView>> {
        let Some(row) = self.storage.get_session(namespace, id).await? else {
            if self.evict(id).await {
                self.publisher.emit(SyncEvent::SessionRemoved {
                    namespace: namespace.to_string(),
                    session_id: id.to_string(),
                });
            }
            return Ok(None);
        };

        let fresh = Session::from_row(row);
        let needs_backfill = fresh.todos.is_none();
        let (view, added) = {
            let mut map = self.entries.write().await;
            match map.get(id) {
                Some(entry) => {
                    let mut locked = entry.lock().await;
                    *locked = fresh;
                    (locked.view(), false)
                }
                None => {
                    let view = fresh.view();
                    map.insert(id.to_string(), Arc::new(Mutex::new(fresh)));
                    (view, true)
                }
            }
        };

        if added {
            self.publisher.emit(SyncEvent::SessionAdded {
                namespace: namespace.to_string(),
                session: view.clone(),
            });
        } else {
            self.emit_updated(&view);
        }

        if needs_backfill {
            self.schedule_todo_backfill(namespace, id);
        }
        Ok(Some(view))
    }

    fn emit_updated(&self, view: &SessionView) {
        self.last_broadcast_at
            .lock()
            .unwrap()
            .insert(view.id.clone(), now_ms());
        self.publisher.emit(SyncEvent::SessionUpdated {
            namespace: view.namespace.clone(),
            session: view.clone(),
        });
    }

    // ─── Heartbeats ─────────────────────────────────────────────────────────

    /// Apply a runner heartbeat.
    ///
    /// `active_at` only moves forward; reported times are clamped against
    /// clock skew. A `session-updated` is emitted only on a real transition
    /// (inactive→active, thinking flip, mode change) or when the coalescing
    /// gap has elapsed, so chatty runners do not flood subscribers.
    pub async fn handle_alive(&self, namespace: &str, alive: SessionAlive) -> Result<()> {
        let Some(entry) = self.entry(namespace, &alive.session_id).await? else {
            debug!(sid = %alive.session_id, "heartbeat for unknown session ignored");
            return Ok(());
        };
        let now = now_ms();
        let time = clamp_event_time(alive.time, now);

        let (persist, modes, view) = {
            let mut s = entry.lock().await;
            let was_active = s.active;
            s.active = true;
            if time > s.active_at {
                s.active_at = time;
            }

            let mut thinking_flip = false;
            if let Some(thinking) = alive.thinking {
                if thinking != s.thinking {
                    s.thinking = thinking;
                    s.thinking_at = time;
                    thinking_flip = true;
                }
            }

            let mut mode_change = false;
            if let Some(pm) = &alive.permission_mode {
                if *pm != s.permission_mode {
                    s.permission_mode = pm.clone();
                    mode_change = true;
                }
            }
            if let Some(mm) = &alive.model_mode {
                if *mm != s.model_mode {
                    s.model_mode = mm.clone();
                    mode_change = true;
                }
            }

            let due = {
                let last = self.last_broadcast_at.lock().unwrap();
                match last.get(&s.id) {
                    Some(at) => now - at >= self.broadcast_gap_ms,
                    None => true,
                }
            };
            let emit = !was_active || thinking_flip || mode_change || due;

            let persist = (s.active, s.active_at, s.thinking, s.thinking_at);
            let modes = mode_change
                .then(|| (alive.permission_mode.clone(), alive.model_mode.clone()));
            let view = emit.then(|| s.view());
            (persist, modes, view)
        };

        if let Some(view) = &view {
            self.emit_updated(view);
        }

        let (active, active_at, thinking, thinking_at) = persist;
        self.storage
            .update_session_presence(namespace, &alive.session_id, active, active_at, thinking, thinking_at)
            .await?;
        if let Some((pm, mm)) = modes {
            self.storage
                .update_session_modes(namespace, &alive.session_id, pm.as_deref(), mm.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Terminal signal from the runner: the agent process ended.
    pub async fn handle_end(&self, namespace: &str, id: &str, time: i64) -> Result<()> {
        let Some(entry) = self.entry(namespace, id).await? else {
            return Ok(());
        };
        let now = now_ms();
        let time = clamp_event_time(time, now);
        let view = {
            let mut s = entry.lock().await;
            s.active = false;
            s.thinking = false;
            if time > s.active_at {
                s.active_at = time;
            }
            s.view()
        };
        self.emit_updated(&view);
        self.storage
            .update_session_presence(namespace, id, false, view.active_at, false, view.thinking_at)
            .await?;
        Ok(())
    }

    /// Demote sessions whose heartbeats lapsed. Returns how many were demoted.
    pub async fn expire_inactive(&self, now: i64) -> Result<usize> {
        let snapshot: Vec<Arc<Mutex<Session>>> =
            self.entries.read().await.values().cloned().collect();

        let mut demoted = Vec::new();
        for entry in snapshot {
            let view = {
                let mut s = entry.lock().await;
                if !s.active || now - s.active_at < self.liveness_window_ms {
                    continue;
                }
                s.active = false;
                s.thinking = false;
                s.view()
            };
            self.emit_updated(&view);
            demoted.push(view);
        }

        for view in &demoted {
            if let Err(e) = self
                .storage
                .update_session_presence(
                    &view.namespace,
                    &view.id,
                    false,
                    view.active_at,
                    false,
                    view.thinking_at,
                )
                .await
            {
                warn!(sid = %view.id, err = %e, "failed to persist liveness demotion");
            }
        }
        Ok(demoted.len())
    }

    // ─── Config & metadata ──────────────────────────────────────────────────

    /// Client-pushed mode change; emits a full snapshot.
    pub async fn apply_config(
        &self,
        namespace: &str,
        id: &str,
        permission_mode: Option<&str>,
        model_mode: Option<&str>,
    ) -> Result<Option<SessionView>> {
        let Some(entry) = self.entry(namespace, id).await? else {
            return Ok(None);
        };
        let view = {
            let mut s = entry.lock().await;
            if let Some(pm) = permission_mode {
                s.permission_mode = pm.to_string();
            }
            if let Some(mm) = model_mode {
                s.model_mode = mm.to_string();
            }
            s.updated_at = now_ms();
            s.view()
        };
        self.emit_updated(&view);
        self.storage
            .update_session_modes(namespace, id, permission_mode, model_mode)
            .await?;
        Ok(Some(view))
    }

    /// Rename via version-checked metadata write. Does not touch `updated_at`.
    pub async fn rename(
        &self,
        namespace: &str,
        id: &str,
        name: &str,
        expected_version: i64,
    ) -> Result<VersionedUpdate<SessionView>> {
        let Some(row) = self.storage.get_session(namespace, id).await? else {
            return Ok(VersionedUpdate::NotFound);
        };
        let mut metadata =
            parse_object(&row.metadata).unwrap_or_else(|| Value::Object(Default::default()));
        metadata["name"] = Value::String(name.to_string());

        match self
            .storage
            .update_session_metadata(namespace, id, &metadata, expected_version, false)
            .await?
        {
            VersionedUpdate::Updated(row) => {
                let view = self.adopt_row(row).await;
                self.emit_updated(&view);
                Ok(VersionedUpdate::Updated(view))
            }
            VersionedUpdate::VersionMismatch(row) => {
                let view = self.adopt_row(row).await;
                Ok(VersionedUpdate::VersionMismatch(view))
            }
            VersionedUpdate::NotFound => Ok(VersionedUpdate::NotFound),
        }
    }

    /// Replace the cached entry with a freshly loaded row, quietly.
    async fn adopt_row(&self, row: SessionRow) -> SessionView {
        let fresh = Session::from_row(row);
        let view = fresh.view();
        let mut map = self.entries.write().await;
        match map.get(&view.id) {
            Some(entry) => *entry.lock().await = fresh,
            None => {
                map.insert(view.id.clone(), Arc::new(Mutex::new(fresh)));
            }
        }
        view
    }

    /// Overwrite the todo list when strictly newer; emits on success.
    pub async fn set_todos(
        &self,
        namespace: &str,
        id: &str,
        todos: &Value,
        updated_at: i64,
    ) -> Result<bool> {
        let applied = self
            .storage
            .set_session_todos(namespace, id, todos, updated_at)
            .await?;
        if applied {
            if let Some(entry) = self.entry(namespace, id).await? {
                let view = {
                    let mut s = entry.lock().await;
                    s.todos = Some(todos.clone());
                    s.todos_updated_at = updated_at;
                    s.view()
                };
                self.emit_updated(&view);
            }
        }
        Ok(applied)
    }

    // ─── Delete & merge ─────────────────────────────────────────────────────

    /// Delete a session. Refused while the session is still active.
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<DeleteOutcome> {
        let Some(entry) = self.entry(namespace, id).await? else {
            return Ok(DeleteOutcome::NotFound);
        };
        if entry.lock().await.active {
            return Ok(DeleteOutcome::ActiveRefused);
        }
        if !self.storage.delete_session(namespace, id).await? {
            self.evict(id).await;
            return Ok(DeleteOutcome::NotFound);
        }
        self.evict(id).await;
        self.publisher.emit(SyncEvent::SessionRemoved {
            namespace: namespace.to_string(),
            session_id: id.to_string(),
        });
        Ok(DeleteOutcome::Deleted)
    }

    /// Fold `old_id` into `new_id`: move the message log, combine metadata,
    /// carry newer todos, then delete the old session.
    pub async fn merge(
        self: &Arc<Self>,
        namespace: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<Option<SessionView>> {
        let Some(old_row) = self.storage.get_session(namespace, old_id).await? else {
            return Ok(None);
        };
        let Some(new_row) = self.storage.get_session(namespace, new_id).await? else {
            return Ok(None);
        };

        self.storage
            .merge_session_messages(namespace, old_id, new_id)
            .await?;

        let old_meta = parse_object(&old_row.metadata).unwrap_or(Value::Object(Default::default()));
        let new_meta = parse_object(&new_row.metadata).unwrap_or(Value::Object(Default::default()));
        let merged = merge_metadata(&old_meta, &new_meta);
        if merged != new_meta {
            // Internal write: retry on version races with concurrent renames.
            for _ in 0..AGENT_STATE_RETRIES {
                let Some(current) = self.storage.get_session(namespace, new_id).await? else {
                    break;
                };
                match self
                    .storage
                    .update_session_metadata(namespace, new_id, &merged, current.metadata_version, true)
                    .await?
                {
                    VersionedUpdate::VersionMismatch(_) => continue,
                    _ => break,
                }
            }
        }

        if old_row.todos_updated_at > new_row.todos_updated_at {
            if let Some(todos) = old_row.todos.as_deref().and_then(parse_array) {
                self.storage
                    .set_session_todos(namespace, new_id, &todos, old_row.todos_updated_at)
                    .await?;
            }
        }

        self.storage.delete_session(namespace, old_id).await?;
        self.evict(old_id).await;
        self.publisher.emit(SyncEvent::SessionRemoved {
            namespace: namespace.to_string(),
            session_id: old_id.to_string(),
        });

        self.refresh(namespace, new_id).await
    }

    // ─── Agent-state permission maps ────────────────────────────────────────

    /// Mirror a newly submitted permission request into
    /// `agentState.requests[id]`; emits `session-updated`.
    pub async fn record_permission_request(
        &self,
        namespace: &str,
        session_id: &str,
        request_id: &str,
        record: Value,
    ) -> Result<()> {
        self.mutate_agent_state(namespace, session_id, |state| {
            let requests = state
                .entry("requests".to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(map) = requests.as_object_mut() {
                map.insert(request_id.to_string(), record.clone());
            }
        })
        .await
    }

    /// Move a request from `agentState.requests` to
    /// `agentState.completedRequests`; emits `session-updated`.
    pub async fn complete_permission_request(
        &self,
        namespace: &str,
        session_id: &str,
        request_id: &str,
        completed: Value,
    ) -> Result<()> {
        self.mutate_agent_state(namespace, session_id, |state| {
            if let Some(requests) = state.get_mut("requests").and_then(Value::as_object_mut) {
                requests.remove(request_id);
            }
            let done = state
                .entry("completedRequests".to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(map) = done.as_object_mut() {
                map.insert(request_id.to_string(), completed.clone());
            }
        })
        .await
    }

    /// The pending/completed request maps, for the paginated message reads.
    pub async fn permission_maps(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<(Value, Value)>> {
        let Some(entry) = self.entry(namespace, id).await? else {
            return Ok(None);
        };
        let s = entry.lock().await;
        let state = s.agent_state.clone().unwrap_or(Value::Null);
        let requests = state
            .get("requests")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let completed = state
            .get("completedRequests")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(Some((requests, completed)))
    }

    /// CAS loop over the opaque agent-state blob. Unknown fields are
    /// preserved; only the closure's edits land.
    async fn mutate_agent_state(
        &self,
        namespace: &str,
        session_id: &str,
        edit: impl Fn(&mut serde_json::Map<String, Value>),
    ) -> Result<()> {
        for _ in 0..AGENT_STATE_RETRIES {
            let Some(row) = self.storage.get_session(namespace, session_id).await? else {
                anyhow::bail!("session not found: {session_id}");
            };
            let mut state = row
                .agent_state
                .as_deref()
                .and_then(parse_object)
                .unwrap_or(Value::Object(Default::default()));
            let map = state.as_object_mut().unwrap();
            edit(map);

            match self
                .storage
                .update_session_agent_state(namespace, session_id, Some(&state), row.agent_state_version)
                .await?
            {
                VersionedUpdate::Updated(row) => {
                    let view = self.adopt_row(row).await;
                    self.emit_updated(&view);
                    return Ok(());
                }
                VersionedUpdate::VersionMismatch(_) => continue,
                VersionedUpdate::NotFound => anyhow::bail!("session not found: {session_id}"),
            }
        }
        anyhow::bail!("agent state update kept losing version races: {session_id}")
    }

    // ─── Todo backfill ──────────────────────────────────────────────────────

    fn schedule_todo_backfill(self: &Arc<Self>, namespace: &str, id: &str) {
        {
            let mut attempted = self.todo_backfill_attempted.lock().unwrap();
            if attempted.len() >= TODO_BACKFILL_CAP {
                attempted.clear();
            }
            if !attempted.insert(id.to_string()) {
                return;
            }
        }
        let this = Arc::clone(self);
        let namespace = namespace.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.backfill_todos(&namespace, &id).await {
                debug!(sid = %id, err = %e, "todo backfill failed");
            }
        });
    }

    /// Scan the most recent messages for a todo write and store the newest one.
    async fn backfill_todos(&self, namespace: &str, id: &str) -> Result<()> {
        let rows = self.storage.get_messages(id, TODO_BACKFILL_SCAN, None).await?;
        for row in rows.iter().rev() {
            let content: Value = match serde_json::from_str(&row.content) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(todos) = extract_todos(&content) {
                self.set_todos(namespace, id, &todos, row.created_at).await?;
                break;
            }
        }
        Ok(())
    }
}
