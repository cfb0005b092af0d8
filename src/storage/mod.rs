use anyhow::Result;
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the hub indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub namespace: String,
    pub tag: Option<String>,
    /// High-water message sequence. Equals the max `messages.seq` for this session.
    pub seq: i64,
    /// Opaque JSON metadata blob.
    pub metadata: String,
    pub metadata_version: i64,
    /// Opaque JSON agent-state blob (carries the permission request maps).
    pub agent_state: Option<String>,
    pub agent_state_version: i64,
    /// JSON todo list, overwritten only by strictly newer writes.
    pub todos: Option<String>,
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

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub namespace: String,
    /// Dense per-session sequence, starting at 1.
    pub seq: i64,
    /// Client-supplied idempotency key, unique per session when set.
    pub local_id: Option<String>,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MachineRow {
    pub id: String,
    pub namespace: String,
    pub metadata: String,
    pub metadata_version: i64,
    pub runner_state: Option<String>,
    pub runner_state_version: i64,
    pub active: bool,
    pub active_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub namespace: String,
    /// SHA-256 hex digest of the bearer token. The raw token is never stored.
    pub token_hash: String,
    /// "user" (interactive client) or "runner" (CLI agent driver).
    pub kind: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushSubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub namespace: String,
    pub endpoint: String,
    pub keys: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserPreferenceRow {
    pub user_id: String,
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

/// Outcome of a version-checked (optimistic concurrency) update.
#[derive(Debug, Clone)]
pub enum VersionedUpdate<T> {
    /// The expected version matched; carries the post-update row.
    Updated(T),
    /// Stale expected version; carries the current row for the caller to retry with.
    VersionMismatch(T),
    NotFound,
}

// ─── Storage ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("hubd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    /// Create a session, or return the existing one when `tag` already
    /// resolves within the namespace (idempotent runner reconnects).
    pub async fn create_session(
        &self,
        namespace: &str,
        tag: Option<&str>,
        metadata: &Value,
        agent_state: Option<&Value>,
    ) -> Result<SessionRow> {
        let tag = tag.filter(|t| !t.is_empty());
        if let Some(t) = tag {
            if let Some(existing) = self.get_session_by_tag(namespace, t).await? {
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let inserted = sqlx::query(
            "INSERT INTO sessions (id, namespace, tag, metadata, agent_state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(namespace)
        .bind(tag)
        .bind(metadata.to_string())
        .bind(agent_state.map(|s| s.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) => {
                // Concurrent create with the same tag: the unique index wins,
                // the loser returns the row the winner inserted.
                let unique = e.to_string().contains("UNIQUE");
                match (unique, tag) {
                    (true, Some(t)) => {
                        if let Some(existing) = self.get_session_by_tag(namespace, t).await? {
                            return Ok(existing);
                        }
                        return Err(e.into());
                    }
                    _ => return Err(e.into()),
                }
            }
        }

        self.get_session(namespace, &id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, namespace: &str, id: &str) -> Result<Option<SessionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM sessions WHERE id = ? AND namespace = ?")
                .bind(id)
                .bind(namespace)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Lookup without a namespace filter. Only for the API boundary, which
    /// must tell a foreign-namespace id (403) apart from a missing one (404).
    pub async fn get_session_raw(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_session_by_tag(&self, namespace: &str, tag: &str) -> Result<Option<SessionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM sessions WHERE namespace = ? AND tag = ?")
                .bind(namespace)
                .bind(tag)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions WHERE namespace = ? ORDER BY updated_at DESC")
                    .bind(namespace)
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Delete a session and its message log. Returns `false` when the id
    /// did not exist in the namespace.
    pub async fn delete_session(&self, namespace: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ? AND namespace = ?")
            .bind(id)
            .bind(namespace)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ? AND namespace = ?")
            .bind(id)
            .bind(namespace)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Version-checked metadata replace. Bumps `metadata_version` by one on
    /// success. `touch_updated_at` controls whether the session resorts in
    /// `updated_at` order (a rename does not).
    pub async fn update_session_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: &Value,
        expected_version: i64,
        touch_updated_at: bool,
    ) -> Result<VersionedUpdate<SessionRow>> {
        let affected = if touch_updated_at {
            sqlx::query(
                "UPDATE sessions SET metadata = ?, metadata_version = metadata_version + 1, updated_at = ?
                 WHERE id = ? AND namespace = ? AND metadata_version = ?",
            )
            .bind(metadata.to_string())
            .bind(now_ms())
            .bind(id)
            .bind(namespace)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE sessions SET metadata = ?, metadata_version = metadata_version + 1
                 WHERE id = ? AND namespace = ? AND metadata_version = ?",
            )
            .bind(metadata.to_string())
            .bind(id)
            .bind(namespace)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        self.versioned_session_outcome(namespace, id, affected).await
    }

    /// Version-checked agent-state replace. Bumps `agent_state_version`.
    pub async fn update_session_agent_state(
        &self,
        namespace: &str,
        id: &str,
        state: Option<&Value>,
        expected_version: i64,
    ) -> Result<VersionedUpdate<SessionRow>> {
        let affected = sqlx::query(
            "UPDATE sessions SET agent_state = ?, agent_state_version = agent_state_version + 1, updated_at = ?
             WHERE id = ? AND namespace = ? AND agent_state_version = ?",
        )
        .bind(state.map(|s| s.to_string()))
        .bind(now_ms())
        .bind(id)
        .bind(namespace)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        self.versioned_session_outcome(namespace, id, affected).await
    }

    async fn versioned_session_outcome(
        &self,
        namespace: &str,
        id: &str,
        affected: u64,
    ) -> Result<VersionedUpdate<SessionRow>> {
        match self.get_session(namespace, id).await? {
            Some(row) if affected > 0 => Ok(VersionedUpdate::Updated(row)),
            Some(row) => Ok(VersionedUpdate::VersionMismatch(row)),
            None => Ok(VersionedUpdate::NotFound),
        }
    }

    /// Overwrite the todo list only when `updated_at` is strictly newer than
    /// the stored logical timestamp. Returns whether the write took effect.
    pub async fn set_session_todos(
        &self,
        namespace: &str,
        id: &str,
        todos: &Value,
        updated_at: i64,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE sessions SET todos = ?, todos_updated_at = ?
             WHERE id = ? AND namespace = ? AND todos_updated_at < ?",
        )
        .bind(todos.to_string())
        .bind(updated_at)
        .bind(id)
        .bind(namespace)
        .bind(updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Persist heartbeat-derived flags. Does not touch `updated_at`; session
    /// ordering is driven by real activity, not liveness pings.
    pub async fn update_session_presence(
        &self,
        namespace: &str,
        id: &str,
        active: bool,
        active_at: i64,
        thinking: bool,
        thinking_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET active = ?, active_at = ?, thinking = ?, thinking_at = ?
             WHERE id = ? AND namespace = ?",
        )
        .bind(active)
        .bind(active_at)
        .bind(thinking)
        .bind(thinking_at)
        .bind(id)
        .bind(namespace)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_modes(
        &self,
        namespace: &str,
        id: &str,
        permission_mode: Option<&str>,
        model_mode: Option<&str>,
    ) -> Result<()> {
        if permission_mode.is_none() && model_mode.is_none() {
            return Ok(());
        }
        let now = now_ms();
        if let Some(pm) = permission_mode {
            sqlx::query("UPDATE sessions SET permission_mode = ?, updated_at = ? WHERE id = ? AND namespace = ?")
                .bind(pm)
                .bind(now)
                .bind(id)
                .bind(namespace)
                .execute(&self.pool)
                .await?;
        }
        if let Some(mm) = model_mode {
            sqlx::query("UPDATE sessions SET model_mode = ?, updated_at = ? WHERE id = ? AND namespace = ?")
                .bind(mm)
                .bind(now)
                .bind(id)
                .bind(namespace)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Append a message, assigning the next dense `seq` and bumping the
    /// session's high-water mark in the same transaction.
    ///
    /// When `local_id` is set and a message with that key already exists in
    /// the session, the stored row is returned and no new `seq` is produced.
    /// The `bool` in the result is `true` only for a fresh insert.
    pub async fn add_message(
        &self,
        namespace: &str,
        session_id: &str,
        content: &Value,
        local_id: Option<&str>,
    ) -> Result<(MessageRow, bool)> {
        let local_id = local_id.filter(|l| !l.is_empty());
        let mut tx = self.pool.begin().await?;

        let seq: Option<(i64,)> =
            sqlx::query_as("SELECT seq FROM sessions WHERE id = ? AND namespace = ?")
                .bind(session_id)
                .bind(namespace)
                .fetch_optional(&mut *tx)
                .await?;
        let seq = match seq {
            Some((s,)) => s,
            None => anyhow::bail!("session not found: {session_id}"),
        };

        if let Some(lid) = local_id {
            let existing: Option<MessageRow> =
                sqlx::query_as("SELECT * FROM messages WHERE session_id = ? AND local_id = ?")
                    .bind(session_id)
                    .bind(lid)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(row) = existing {
                tx.commit().await?;
                return Ok((row, false));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let next = seq + 1;
        sqlx::query(
            "INSERT INTO messages (id, session_id, namespace, seq, local_id, content, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(namespace)
        .bind(next)
        .bind(local_id)
        .bind(content.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET seq = ?, updated_at = ? WHERE id = ?")
            .bind(next)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let row = sqlx::query_as("SELECT * FROM messages WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok((row, true))
    }

    /// Page backwards: at most `limit` rows with `seq < before_seq`, returned
    /// oldest-to-newest. Without `before_seq` this is the log tail.
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = if let Some(before) = before_seq {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE session_id = ? AND seq < ?
                     ORDER BY seq DESC LIMIT ?
                 ) ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE session_id = ?
                     ORDER BY seq DESC LIMIT ?
                 ) ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    /// Tail forwards: rows with `seq > after_seq`, oldest-to-newest.
    pub async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_as(
            "SELECT * FROM messages WHERE session_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Move the old session's messages onto the new id in insertion order,
    /// continuing the new session's `seq`. Returns the number moved.
    ///
    /// A moved message keeps its `local_id` unless the key already exists in
    /// the target session, in which case the key is dropped.
    pub async fn merge_session_messages(
        &self,
        namespace: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let target: Option<(i64,)> =
            sqlx::query_as("SELECT seq FROM sessions WHERE id = ? AND namespace = ?")
                .bind(new_id)
                .bind(namespace)
                .fetch_optional(&mut *tx)
                .await?;
        let mut next = match target {
            Some((s,)) => s,
            None => anyhow::bail!("session not found: {new_id}"),
        };

        let moving: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, local_id FROM messages WHERE session_id = ? AND namespace = ? ORDER BY seq ASC",
        )
        .bind(old_id)
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0i64;
        for (msg_id, local_id) in moving {
            next += 1;
            let keep_local = match &local_id {
                Some(lid) => {
                    let clash: Option<(i64,)> = sqlx::query_as(
                        "SELECT 1 FROM messages WHERE session_id = ? AND local_id = ?",
                    )
                    .bind(new_id)
                    .bind(lid)
                    .fetch_optional(&mut *tx)
                    .await?;
                    clash.is_none()
                }
                None => false,
            };
            sqlx::query("UPDATE messages SET session_id = ?, seq = ?, local_id = ? WHERE id = ?")
                .bind(new_id)
                .bind(next)
                .bind(if keep_local { local_id } else { None })
                .bind(&msg_id)
                .execute(&mut *tx)
                .await?;
            moved += 1;
        }

        if moved > 0 {
            sqlx::query("UPDATE sessions SET seq = ?, updated_at = ? WHERE id = ?")
                .bind(next)
                .bind(now_ms())
                .bind(new_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(moved)
    }

    // ─── Machines ───────────────────────────────────────────────────────────

    /// Insert a machine if missing; an existing row is returned unchanged
    /// (runners mutate via the version-checked update paths).
    pub async fn upsert_machine(
        &self,
        namespace: &str,
        id: &str,
        metadata: &Value,
        runner_state: Option<&Value>,
    ) -> Result<MachineRow> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO machines (id, namespace, metadata, runner_state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(namespace, id) DO NOTHING",
        )
        .bind(id)
        .bind(namespace)
        .bind(metadata.to_string())
        .bind(runner_state.map(|s| s.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_machine(namespace, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("machine not found after upsert"))
    }

    pub async fn get_machine(&self, namespace: &str, id: &str) -> Result<Option<MachineRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM machines WHERE id = ? AND namespace = ?")
                .bind(id)
                .bind(namespace)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_machines(&self, namespace: &str) -> Result<Vec<MachineRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM machines WHERE namespace = ? ORDER BY updated_at DESC")
                    .bind(namespace)
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn update_machine_metadata(
        &self,
        namespace: &str,
        id: &str,
        metadata: &Value,
        expected_version: i64,
    ) -> Result<VersionedUpdate<MachineRow>> {
        let affected = sqlx::query(
            "UPDATE machines SET metadata = ?, metadata_version = metadata_version + 1, updated_at = ?
             WHERE id = ? AND namespace = ? AND metadata_version = ?",
        )
        .bind(metadata.to_string())
        .bind(now_ms())
        .bind(id)
        .bind(namespace)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.versioned_machine_outcome(namespace, id, affected).await
    }

    pub async fn update_machine_runner_state(
        &self,
        namespace: &str,
        id: &str,
        state: Option<&Value>,
        expected_version: i64,
    ) -> Result<VersionedUpdate<MachineRow>> {
        let affected = sqlx::query(
            "UPDATE machines SET runner_state = ?, runner_state_version = runner_state_version + 1, updated_at = ?
             WHERE id = ? AND namespace = ? AND runner_state_version = ?",
        )
        .bind(state.map(|s| s.to_string()))
        .bind(now_ms())
        .bind(id)
        .bind(namespace)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.versioned_machine_outcome(namespace, id, affected).await
    }

    async fn versioned_machine_outcome(
        &self,
        namespace: &str,
        id: &str,
        affected: u64,
    ) -> Result<VersionedUpdate<MachineRow>> {
        match self.get_machine(namespace, id).await? {
            Some(row) if affected > 0 => Ok(VersionedUpdate::Updated(row)),
            Some(row) => Ok(VersionedUpdate::VersionMismatch(row)),
            None => Ok(VersionedUpdate::NotFound),
        }
    }

    pub async fn update_machine_presence(
        &self,
        namespace: &str,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE machines SET active = ?, active_at = ? WHERE id = ? AND namespace = ?")
            .bind(active)
            .bind(active_at)
            .bind(id)
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn create_user(&self, namespace: &str, token_hash: &str, kind: &str) -> Result<UserRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, namespace, token_hash, kind, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(namespace)
        .bind(token_hash)
        .bind(kind)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.get_user(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_user_by_token_hash(&self, token_hash: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_users(&self) -> Result<Vec<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // ─── Push subscriptions ─────────────────────────────────────────────────

    pub async fn upsert_push_subscription(
        &self,
        namespace: &str,
        user_id: &str,
        endpoint: &str,
        keys: &Value,
    ) -> Result<PushSubscriptionRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO push_subscriptions (id, user_id, namespace, endpoint, keys, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, endpoint) DO UPDATE SET keys = excluded.keys",
        )
        .bind(&id)
        .bind(user_id)
        .bind(namespace)
        .bind(endpoint)
        .bind(keys.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query_as(
            "SELECT * FROM push_subscriptions WHERE user_id = ? AND endpoint = ?",
        )
        .bind(user_id)
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_push_subscriptions(&self, user_id: &str) -> Result<Vec<PushSubscriptionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM push_subscriptions WHERE user_id = ? ORDER BY created_at ASC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_push_subscriptions_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<PushSubscriptionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM push_subscriptions WHERE namespace = ? ORDER BY created_at ASC")
                .bind(namespace)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn delete_push_subscription(&self, user_id: &str, id: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM push_subscriptions WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // ─── User preferences ───────────────────────────────────────────────────

    pub async fn set_user_preference(&self, user_id: &str, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_preferences (user_id, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key)
        .bind(value.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_preference(&self, user_id: &str, key: &str) -> Result<Option<UserPreferenceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM user_preferences WHERE user_id = ? AND key = ?")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_user_preferences(&self, user_id: &str) -> Result<Vec<UserPreferenceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM user_preferences WHERE user_id = ? ORDER BY key ASC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Startup recovery ───────────────────────────────────────────────────

    /// On hub startup, demote any session/machine left active by a previous
    /// (crashed/killed) process. Heartbeats re-promote live ones within one
    /// liveness window. Returns the number of rows demoted.
    pub async fn recover_stale_presence(&self) -> Result<u64> {
        with_timeout(async {
            let sessions = sqlx::query(
                "UPDATE sessions SET active = 0, thinking = 0 WHERE active = 1 OR thinking = 1",
            )
            .execute(&self.pool)
            .await?
            .rows_affected();
            let machines = sqlx::query("UPDATE machines SET active = 0 WHERE active = 1")
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(sessions + machines)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn create_session_reuses_tag() {
        let (s, _dir) = test_storage().await;
        let a = s
            .create_session("ns", Some("tag-1"), &json!({}), None)
            .await
            .unwrap();
        let b = s
            .create_session("ns", Some("tag-1"), &json!({"other": true}), None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        // Same tag in another namespace is a different session.
        let c = s
            .create_session("ns2", Some("tag-1"), &json!({}), None)
            .await
            .unwrap();
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn add_message_assigns_dense_seq() {
        let (s, _dir) = test_storage().await;
        let sess = s.create_session("ns", None, &json!({}), None).await.unwrap();
        for expected in 1..=3i64 {
            let (row, created) = s
                .add_message("ns", &sess.id, &json!({"text": format!("m{expected}")}), None)
                .await
                .unwrap();
            assert!(created);
            assert_eq!(row.seq, expected);
        }
        let reloaded = s.get_session("ns", &sess.id).await.unwrap().unwrap();
        assert_eq!(reloaded.seq, 3);
    }

    #[tokio::test]
    async fn add_message_local_id_is_idempotent() {
        let (s, _dir) = test_storage().await;
        let sess = s.create_session("ns", None, &json!({}), None).await.unwrap();
        let (first, created) = s
            .add_message("ns", &sess.id, &json!({"text": "hi"}), Some("x"))
            .await
            .unwrap();
        assert!(created);
        let (second, created_again) = s
            .add_message("ns", &sess.id, &json!({"text": "hi2"}), Some("x"))
            .await
            .unwrap();
        assert!(!created_again);
        assert_eq!(first.seq, second.seq);
        assert_eq!(second.content, json!({"text": "hi"}).to_string());
        let reloaded = s.get_session("ns", &sess.id).await.unwrap().unwrap();
        assert_eq!(reloaded.seq, 1);
    }

    #[tokio::test]
    async fn get_messages_pagination_boundaries() {
        let (s, _dir) = test_storage().await;
        let sess = s.create_session("ns", None, &json!({}), None).await.unwrap();
        for i in 1..=5 {
            s.add_message("ns", &sess.id, &json!({"n": i}), None)
                .await
                .unwrap();
        }
        // Tail of 2 → [4, 5].
        let tail = s.get_messages(&sess.id, 2, None).await.unwrap();
        assert_eq!(tail.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);
        // Page before 4 with limit 2 → [2, 3].
        let page = s.get_messages(&sess.id, 2, Some(4)).await.unwrap();
        assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
        // before_seq = 1 → empty.
        assert!(s.get_messages(&sess.id, 10, Some(1)).await.unwrap().is_empty());
        // limit = 0 → empty.
        assert!(s.get_messages(&sess.id, 0, None).await.unwrap().is_empty());
        // Tail after seq 3 → [4, 5].
        let after = s.get_messages_after(&sess.id, 3, 10).await.unwrap();
        assert_eq!(after.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn metadata_update_is_version_checked() {
        let (s, _dir) = test_storage().await;
        let sess = s.create_session("ns", None, &json!({}), None).await.unwrap();
        assert_eq!(sess.metadata_version, 0);

        let outcome = s
            .update_session_metadata("ns", &sess.id, &json!({"name": "a"}), 0, false)
            .await
            .unwrap();
        let row = match outcome {
            VersionedUpdate::Updated(row) => row,
            other => panic!("expected Updated, got {other:?}"),
        };
        assert_eq!(row.metadata_version, 1);
        // Rename path leaves updated_at untouched.
        assert_eq!(row.updated_at, sess.updated_at);

        // Stale expected version → mismatch with the latest row.
        let stale = s
            .update_session_metadata("ns", &sess.id, &json!({"name": "b"}), 0, false)
            .await
            .unwrap();
        match stale {
            VersionedUpdate::VersionMismatch(latest) => {
                assert_eq!(latest.metadata_version, 1);
                assert_eq!(latest.metadata, json!({"name": "a"}).to_string());
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn todos_require_newer_timestamp() {
        let (s, _dir) = test_storage().await;
        let sess = s.create_session("ns", None, &json!({}), None).await.unwrap();
        assert!(s
            .set_session_todos("ns", &sess.id, &json!([{"t": "a"}]), 100)
            .await
            .unwrap());
        // Equal timestamp loses.
        assert!(!s
            .set_session_todos("ns", &sess.id, &json!([{"t": "b"}]), 100)
            .await
            .unwrap());
        assert!(s
            .set_session_todos("ns", &sess.id, &json!([{"t": "c"}]), 101)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn merge_continues_target_seq() {
        let (s, _dir) = test_storage().await;
        let old = s.create_session("ns", None, &json!({}), None).await.unwrap();
        let new = s.create_session("ns", None, &json!({}), None).await.unwrap();
        s.add_message("ns", &old.id, &json!({"n": 1}), Some("dup"))
            .await
            .unwrap();
        s.add_message("ns", &old.id, &json!({"n": 2}), None).await.unwrap();
        s.add_message("ns", &new.id, &json!({"n": 3}), Some("dup"))
            .await
            .unwrap();

        let moved = s.merge_session_messages("ns", &old.id, &new.id).await.unwrap();
        assert_eq!(moved, 2);

        let all = s.get_messages(&new.id, 100, None).await.unwrap();
        assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        // The colliding idempotency key was dropped from the moved row.
        let dups: Vec<_> = all
            .iter()
            .filter(|m| m.local_id.as_deref() == Some("dup"))
            .collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].seq, 1);
        let reloaded = s.get_session("ns", &new.id).await.unwrap().unwrap();
        assert_eq!(reloaded.seq, 3);
    }

    #[tokio::test]
    async fn machine_upsert_returns_existing_unchanged() {
        let (s, _dir) = test_storage().await;
        let a = s
            .upsert_machine("ns", "m1", &json!({"host": "a"}), None)
            .await
            .unwrap();
        let b = s
            .upsert_machine("ns", "m1", &json!({"host": "b"}), None)
            .await
            .unwrap();
        assert_eq!(b.metadata, a.metadata);
        assert_eq!(b.metadata_version, 0);
    }
}
