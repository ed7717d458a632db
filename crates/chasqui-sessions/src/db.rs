use rusqlite::Connection;

use crate::error::Result;

/// Initialise the bot_sessions table. Safe to call on every startup.
///
/// The conversation store also creates this table so it can delete a
/// session inside a conversation-close transaction; both definitions must
/// stay identical.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bot_sessions (
            session_key       TEXT PRIMARY KEY,
            flow_id           TEXT NOT NULL,
            current_node_id   TEXT NOT NULL,
            variables         TEXT NOT NULL DEFAULT '{}',
            history           TEXT NOT NULL DEFAULT '[]',
            awaiting          TEXT NOT NULL DEFAULT 'none',
            retry_count       INTEGER NOT NULL DEFAULT 0,
            wake_at           INTEGER,
            created_at        INTEGER NOT NULL,
            last_activity_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_wake
            ON bot_sessions(wake_at) WHERE wake_at IS NOT NULL;",
    )?;
    Ok(())
}
