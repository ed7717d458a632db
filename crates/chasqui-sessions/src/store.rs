use std::sync::Mutex;

use chasqui_core::types::ConversationKey;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{Awaiting, BotSession};

/// Thread-safe bot-session persistence.
///
/// Wraps a single SQLite connection in a `Mutex`; access is already
/// serialized per conversation by the conversation lock, so contention is
/// cross-conversation only.
pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn get(&self, key: &ConversationKey) -> Result<Option<BotSession>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT flow_id, current_node_id, variables, history, awaiting, retry_count,
                        wake_at, created_at, last_activity_at
                 FROM bot_sessions WHERE session_key = ?1",
                params![key.format()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((flow_id, node, vars_json, history_json, awaiting, retry_count, wake_at, created_at, last_activity_at)) = row
        else {
            return Ok(None);
        };

        Ok(Some(BotSession {
            key: key.clone(),
            flow_id,
            current_node_id: node,
            variables: serde_json::from_str(&vars_json).unwrap_or_default(),
            history: serde_json::from_str(&history_json).unwrap_or_default(),
            awaiting: Awaiting::parse(&awaiting).unwrap_or_default(),
            retry_count,
            wake_at,
            created_at,
            last_activity_at,
        }))
    }

    /// Persist the whole session in one statement, a step either commits
    /// entirely or not at all.
    #[instrument(skip(self, session), fields(key = %session.key, node = %session.current_node_id))]
    pub fn put(&self, session: &BotSession) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO bot_sessions
             (session_key, flow_id, current_node_id, variables, history, awaiting,
              retry_count, wake_at, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_key) DO UPDATE SET
                flow_id = ?2, current_node_id = ?3, variables = ?4, history = ?5,
                awaiting = ?6, retry_count = ?7, wake_at = ?8, last_activity_at = ?10",
            params![
                session.key.format(),
                session.flow_id,
                session.current_node_id,
                serde_json::to_string(&session.variables)?,
                serde_json::to_string(&session.history)?,
                session.awaiting.as_str(),
                session.retry_count,
                session.wake_at,
                session.created_at,
                session.last_activity_at,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &ConversationKey) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM bot_sessions WHERE session_key = ?1",
            params![key.format()],
        )?;
        if n == 0 {
            return Err(SessionError::NotFound { key: key.format() });
        }
        Ok(())
    }

    /// Delete without caring whether the row existed.
    pub fn delete_if_exists(&self, key: &ConversationKey) -> Result<bool> {
        match self.delete(key) {
            Ok(()) => Ok(true),
            Err(SessionError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list_keys(&self) -> Result<Vec<ConversationKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT session_key FROM bot_sessions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| ConversationKey::parse(&s).ok())
            .collect())
    }

    /// Sessions whose durable wake time has arrived, resumed delay nodes.
    pub fn due_wakeups(&self, now_ms: i64) -> Result<Vec<ConversationKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_key FROM bot_sessions
             WHERE wake_at IS NOT NULL AND wake_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now_ms], |row| row.get::<_, String>(0))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| ConversationKey::parse(&s).ok())
            .collect())
    }

    /// Sessions idle since before `cutoff_ms` (cleanup candidates). A
    /// session suspended on a long delay is not stale, its wake is still
    /// in the future.
    pub fn stale_keys(&self, cutoff_ms: i64) -> Result<Vec<ConversationKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_key FROM bot_sessions
             WHERE last_activity_at < ?1
               AND (wake_at IS NULL OR wake_at < ?1)",
        )?;
        let rows = stmt.query_map(params![cutoff_ms], |row| row.get::<_, String>(0))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| ConversationKey::parse(&s).ok())
            .collect())
    }
}
