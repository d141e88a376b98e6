//! Local SQLite conversation history.
//!
//! One connection per call (like the rest of the local stores); each append runs in a
//! single transaction that inserts the message and bumps the session's `updated_at_ms`.

use crate::shared::{Message, Role, Session, SessionSummary};
use crate::store::{ConversationStore, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct SqliteConversationStore {
    db_path: PathBuf,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl SqliteConversationStore {
    pub fn new(db_path: PathBuf) -> Result<Self, StoreError> {
        let this = Self {
            db_path,
            session_locks: DashMap::new(),
        };
        this.init()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Persistence(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at_ms);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                UNIQUE(session_id, seq),
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            "#,
        )?;
        Ok(())
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl ConversationStore for SqliteConversationStore {
    fn create_session(&self) -> Result<String, StoreError> {
        let session = Session::new();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO sessions (id, created_at_ms, updated_at_ms) VALUES (?1, ?2, ?3)",
            params![
                session.id,
                session.created_at.timestamp_millis(),
                session.updated_at.timestamp_millis()
            ],
        )?;
        Ok(session.id)
    }

    fn append_message(&self, session_id: &str, message: &Message) -> Result<(), StoreError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        tx.execute(
            r#"
            INSERT INTO messages (session_id, seq, role, content, timestamp_ms)
            VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1), ?2, ?3, ?4)
            "#,
            params![
                session_id,
                message.role.as_str(),
                message.content,
                message.timestamp.timestamp_millis()
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at_ms = MAX(updated_at_ms, ?1) WHERE id = ?2",
            params![now_ms(), session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.created_at_ms, s.updated_at_ms,
                   (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
            FROM sessions s
            ORDER BY s.updated_at_ms DESC, s.id DESC
            "#,
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(SessionSummary {
                    session_id: r.get(0)?,
                    created_at: from_ms(r.get(1)?),
                    updated_at: from_ms(r.get(2)?),
                    message_count: r.get::<_, i64>(3)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let conn = self.open()?;
        let head: Option<(i64, i64)> = conn
            .query_row(
                "SELECT created_at_ms, updated_at_ms FROM sessions WHERE id = ?1",
                params![session_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (created_at_ms, updated_at_ms) =
            head.ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp_ms FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (role, content, ts) in rows {
            let role = Role::parse(&role)
                .ok_or_else(|| StoreError::Persistence(format!("unknown role '{}' in store", role)))?;
            messages.push(Message {
                role,
                content,
                timestamp: from_ms(ts),
            });
        }

        Ok(Session {
            id: session_id.to_string(),
            created_at: from_ms(created_at_ms),
            updated_at: from_ms(updated_at_ms),
            messages,
        })
    }
}
