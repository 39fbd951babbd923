//! Durable, crash-safe storage of Sessions, Messages, AllowedTools, and
//! PendingEvents. A single SQLite file in WAL mode; all writes are
//! serialized through one connection (held behind a blocking mutex and
//! driven from `spawn_blocking`, mirroring how the rest of this crate
//! keeps blocking work off the async executor — see `auth::verify_identity`'s
//! callers and the Supervisor's use of `spawn_blocking` for the same
//! reason).

use std::path::Path;
use std::sync::Arc;

use gateway_protocol::SessionMode;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: Uuid,
    pub name: String,
    pub owner_username: String,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub owner_home: String,
    pub working_directory: String,
    pub mode: SessionMode,
    pub web_search_enabled: bool,
    pub agent_session_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub role: String,
    pub content: String,
    pub ts: i64,
}

#[derive(Debug, Clone)]
pub struct PendingEventRow {
    pub sequence: i64,
    pub event_type: String,
    pub payload: String,
    pub enqueued_at: i64,
}

/// A single mutable field of a Session, updated without a
/// read-modify-write that could leave `agentSessionId` (invariant #4)
/// stale.
#[derive(Debug, Clone)]
pub enum SessionField {
    Name(String),
    Mode(SessionMode),
    WebSearchEnabled(bool),
    AgentSessionId(Option<String>),
    LastActivity(i64),
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: &Path) -> GatewayResult<Self> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            apply_migrations(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(join_err)??;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> GatewayResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(join_err)?
        .map_err(GatewayError::from)
    }

    pub async fn upsert_session(&self, s: SessionRow) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, owner_username, owner_uid, owner_gid, owner_home, \
                 working_directory, mode, web_search_enabled, agent_session_id, created_at, \
                 last_activity, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(id) DO UPDATE SET \
                 name=excluded.name, mode=excluded.mode, web_search_enabled=excluded.web_search_enabled, \
                 agent_session_id=excluded.agent_session_id, last_activity=excluded.last_activity, \
                 is_active=excluded.is_active",
                params![
                    s.id.to_string(),
                    s.name,
                    s.owner_username,
                    s.owner_uid,
                    s.owner_gid,
                    s.owner_home,
                    s.working_directory,
                    s.mode.to_string(),
                    s.web_search_enabled,
                    s.agent_session_id,
                    s.created_at,
                    s.last_activity,
                    s.is_active,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_field(&self, id: Uuid, field: SessionField) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            match field {
                SessionField::Name(name) => {
                    conn.execute(
                        "UPDATE sessions SET name = ?1 WHERE id = ?2",
                        params![name, id.to_string()],
                    )?;
                }
                SessionField::Mode(mode) => {
                    conn.execute(
                        "UPDATE sessions SET mode = ?1 WHERE id = ?2",
                        params![mode.to_string(), id.to_string()],
                    )?;
                }
                SessionField::WebSearchEnabled(enabled) => {
                    conn.execute(
                        "UPDATE sessions SET web_search_enabled = ?1 WHERE id = ?2",
                        params![enabled, id.to_string()],
                    )?;
                }
                SessionField::AgentSessionId(agent_session_id) => {
                    conn.execute(
                        "UPDATE sessions SET agent_session_id = ?1 WHERE id = ?2",
                        params![agent_session_id, id.to_string()],
                    )?;
                }
                SessionField::LastActivity(ts) => {
                    conn.execute(
                        "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
                        params![ts, id.to_string()],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: String,
        content: String,
        ts: i64,
    ) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, ts) VALUES (?1, ?2, ?3, ?4)",
                params![session_id.to_string(), role, content, ts],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_active_sessions(&self) -> GatewayResult<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, owner_username, owner_uid, owner_gid, owner_home, \
                 working_directory, mode, web_search_enabled, agent_session_id, created_at, \
                 last_activity, is_active FROM sessions WHERE is_active = 1 \
                 ORDER BY last_activity DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_session(&self, id: Uuid) -> GatewayResult<Option<SessionRow>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, owner_username, owner_uid, owner_gid, owner_home, \
                 working_directory, mode, web_search_enabled, agent_session_id, created_at, \
                 last_activity, is_active FROM sessions WHERE id = ?1",
                params![id.to_string()],
                row_to_session,
            )
            .optional()
        })
        .await
    }

    pub async fn find_by_owner(&self, username: String) -> GatewayResult<Vec<SessionRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, owner_username, owner_uid, owner_gid, owner_home, \
                 working_directory, mode, web_search_enabled, agent_session_id, created_at, \
                 last_activity, is_active FROM sessions WHERE owner_username = ?1 AND is_active = 1 \
                 ORDER BY last_activity DESC",
            )?;
            let rows = stmt
                .query_map(params![username], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn load_messages(&self, session_id: Uuid) -> GatewayResult<Vec<MessageRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, ts FROM messages WHERE session_id = ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![session_id.to_string()], |row| {
                    Ok(MessageRow {
                        role: row.get(0)?,
                        content: row.get(1)?,
                        ts: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn allowed_tools_for(&self, session_id: Uuid) -> GatewayResult<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name FROM allowed_tools WHERE session_id = ?1 ORDER BY allowed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![session_id.to_string()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn allow_tool(&self, session_id: Uuid, name: String) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO allowed_tools (session_id, tool_name, allowed_at) \
                 VALUES (?1, ?2, ?3)",
                params![session_id.to_string(), name, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_allowed_tools(&self, session_id: Uuid) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM allowed_tools WHERE session_id = ?1",
                params![session_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Enqueue an event for a session with no attached client; returns
    /// the per-session monotone sequence assigned to it.
    pub async fn enqueue_event(
        &self,
        session_id: Uuid,
        event_type: String,
        payload: String,
    ) -> GatewayResult<i64> {
        self.with_conn(move |conn| {
            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM pending_events WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO pending_events (session_id, sequence, event_type, payload, enqueued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id.to_string(), sequence, event_type, payload, now_ms()],
            )?;
            Ok(sequence)
        })
        .await
    }

    pub async fn drain_events(&self, session_id: Uuid) -> GatewayResult<Vec<PendingEventRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, event_type, payload, enqueued_at FROM pending_events \
                 WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let rows = stmt
                .query_map(params![session_id.to_string()], |row| {
                    Ok(PendingEventRow {
                        sequence: row.get(0)?,
                        event_type: row.get(1)?,
                        payload: row.get(2)?,
                        enqueued_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn purge_events(&self, session_id: Uuid, up_to: i64) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM pending_events WHERE session_id = ?1 AND sequence <= ?2",
                params![session_id.to_string(), up_to],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn deactivate(&self, id: Uuid) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> GatewayResult<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
        .await
    }

    /// Returns the ids of sessions whose `last_activity` is older than
    /// `cutoff_activity` (epoch ms) and marks them inactive.
    pub async fn expire_sessions_older_than(&self, cutoff_activity: i64) -> GatewayResult<Vec<Uuid>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE is_active = 1 AND last_activity < ?1",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![cutoff_activity], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity < ?1",
                params![cutoff_activity],
            )?;
            Ok(ids
                .into_iter()
                .filter_map(|s| Uuid::parse_str(&s).ok())
                .collect())
        })
        .await
    }

    pub async fn checkpoint(&self) -> GatewayResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    let id: String = row.get(0)?;
    let mode: String = row.get(7)?;
    Ok(SessionRow {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        name: row.get(1)?,
        owner_username: row.get(2)?,
        owner_uid: row.get(3)?,
        owner_gid: row.get(4)?,
        owner_home: row.get(5)?,
        working_directory: row.get(6)?,
        mode: mode.parse().unwrap_or_default(),
        web_search_enabled: row.get(8)?,
        agent_session_id: row.get(9)?,
        created_at: row.get(10)?,
        last_activity: row.get(11)?,
        is_active: row.get(12)?,
    })
}

fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

         CREATE TABLE IF NOT EXISTS sessions (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             owner_username TEXT NOT NULL,
             owner_uid INTEGER NOT NULL,
             owner_gid INTEGER NOT NULL,
             owner_home TEXT NOT NULL,
             working_directory TEXT NOT NULL,
             mode TEXT NOT NULL,
             web_search_enabled INTEGER NOT NULL,
             agent_session_id TEXT,
             created_at INTEGER NOT NULL,
             last_activity INTEGER NOT NULL,
             is_active INTEGER NOT NULL
         );

         CREATE TABLE IF NOT EXISTS messages (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
             role TEXT NOT NULL,
             content TEXT NOT NULL,
             ts INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, ts);

         CREATE TABLE IF NOT EXISTS allowed_tools (
             session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
             tool_name TEXT NOT NULL,
             allowed_at INTEGER NOT NULL,
             PRIMARY KEY (session_id, tool_name)
         );

         CREATE TABLE IF NOT EXISTS pending_events (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
             sequence INTEGER NOT NULL,
             event_type TEXT NOT NULL,
             payload TEXT NOT NULL,
             enqueued_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_pending_events_session ON pending_events(session_id, sequence);
        ",
    )
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn join_err(e: tokio::task::JoinError) -> GatewayError {
    GatewayError::Fatal(format!("blocking store task panicked: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(id: Uuid) -> SessionRow {
        SessionRow {
            id,
            name: "proj".to_string(),
            owner_username: "alice".to_string(),
            owner_uid: 1000,
            owner_gid: 1000,
            owner_home: "/home/alice".to_string(),
            working_directory: "/home/alice/proj".to_string(),
            mode: SessionMode::Plan,
            web_search_enabled: false,
            agent_session_id: None,
            created_at: 1,
            last_activity: 1,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn persist_then_reload_returns_identical_fields() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.name, "proj");
        assert_eq!(loaded.owner_username, "alice");
        assert_eq!(loaded.mode, SessionMode::Plan);
        assert!(loaded.is_active);
    }

    #[tokio::test]
    async fn create_then_delete_cascades_messages_and_allowed_tools() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();
        store
            .append_message(id, "user".to_string(), "hi".to_string(), 1)
            .await
            .unwrap();
        store.allow_tool(id, "Bash".to_string()).await.unwrap();

        store.delete(id).await.unwrap();

        assert!(store.load_messages(id).await.unwrap().is_empty());
        assert!(store.allowed_tools_for(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_then_reload_reflects_new_name() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();

        store
            .update_session_field(id, SessionField::Name("renamed".to_string()))
            .await
            .unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
    }

    #[tokio::test]
    async fn agent_session_id_update_is_isolated_from_other_fields() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();

        store
            .update_session_field(id, SessionField::AgentSessionId(Some("agent-1".to_string())))
            .await
            .unwrap();
        store
            .update_session_field(id, SessionField::Name("renamed".to_string()))
            .await
            .unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.agent_session_id.as_deref(), Some("agent-1"));
        assert_eq!(loaded.name, "renamed");
    }

    #[tokio::test]
    async fn pending_events_drain_in_enqueue_order() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();

        store
            .enqueue_event(id, "text_chunk".to_string(), "\"a\"".to_string())
            .await
            .unwrap();
        store
            .enqueue_event(id, "text_chunk".to_string(), "\"b\"".to_string())
            .await
            .unwrap();

        let drained = store.drain_events(id).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].sequence, 1);
        assert_eq!(drained[1].sequence, 2);
        assert_eq!(drained[0].payload, "\"a\"");
    }

    #[tokio::test]
    async fn purge_events_removes_up_to_sequence() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();
        store
            .enqueue_event(id, "text_chunk".to_string(), "\"a\"".to_string())
            .await
            .unwrap();
        let seq2 = store
            .enqueue_event(id, "text_chunk".to_string(), "\"b\"".to_string())
            .await
            .unwrap();

        store.purge_events(id, seq2).await.unwrap();

        assert!(store.drain_events(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn allow_all_persists_across_clear_is_independent_per_tool() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.upsert_session(sample_session(id)).await.unwrap();

        store.allow_tool(id, "Bash".to_string()).await.unwrap();
        store.allow_tool(id, "Bash".to_string()).await.unwrap(); // duplicate, ignored
        store.allow_tool(id, "Read".to_string()).await.unwrap();

        let tools = store.allowed_tools_for(id).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.contains(&"Bash".to_string()));

        store.clear_allowed_tools(id).await.unwrap();
        assert!(store.allowed_tools_for(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_sessions_older_than_marks_inactive_and_returns_ids() {
        let store = Store::open_in_memory().unwrap();
        let old_id = Uuid::new_v4();
        let mut old = sample_session(old_id);
        old.last_activity = 100;
        store.upsert_session(old).await.unwrap();

        let new_id = Uuid::new_v4();
        let mut new = sample_session(new_id);
        new.last_activity = 10_000;
        store.upsert_session(new).await.unwrap();

        let expired = store.expire_sessions_older_than(5_000).await.unwrap();
        assert_eq!(expired, vec![old_id]);

        let active = store.list_active_sessions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new_id);
    }

    #[tokio::test]
    async fn find_by_owner_only_returns_that_owners_active_sessions() {
        let store = Store::open_in_memory().unwrap();
        let alice_id = Uuid::new_v4();
        store.upsert_session(sample_session(alice_id)).await.unwrap();

        let mut bob = sample_session(Uuid::new_v4());
        bob.owner_username = "bob".to_string();
        store.upsert_session(bob).await.unwrap();

        let found = store.find_by_owner("alice".to_string()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, alice_id);
    }
}
