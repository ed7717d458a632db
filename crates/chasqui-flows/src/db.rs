use rusqlite::Connection;

use crate::error::Result;

/// Initialise the flows table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS flows (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1,
            definition  TEXT NOT NULL,
            is_default  INTEGER NOT NULL DEFAULT 0,
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );",
    )?;
    Ok(())
}
