use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table this crate owns. Safe to call on every startup -
/// uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                     TEXT PRIMARY KEY,
            channel                TEXT NOT NULL DEFAULT 'whatsapp',
            channel_connection_id  TEXT NOT NULL,
            remote_phone           TEXT NOT NULL,
            display_number         TEXT NOT NULL,
            contact_name           TEXT,
            status                 TEXT NOT NULL DEFAULT 'active',
            assigned_to            TEXT,
            assigned_at            INTEGER,
            queued_at              INTEGER,
            queue_id               TEXT,
            bot_flow_id            TEXT,
            bot_started_at         INTEGER,
            ticket_number          INTEGER NOT NULL,
            attended_by            TEXT NOT NULL DEFAULT '[]',
            active_advisors        TEXT NOT NULL DEFAULT '[]',
            transferred_from       TEXT,
            transferred_at         INTEGER,
            queue_timeout_level    INTEGER NOT NULL DEFAULT 0,
            unread                 INTEGER NOT NULL DEFAULT 0,
            last_message_preview   TEXT,
            last_message_at        INTEGER,
            created_at             INTEGER NOT NULL,
            updated_at             INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_key
            ON conversations(channel_connection_id, remote_phone, status);
        CREATE INDEX IF NOT EXISTS idx_conversations_queue
            ON conversations(queue_id, status, queued_at);
        CREATE INDEX IF NOT EXISTS idx_conversations_advisor
            ON conversations(assigned_to, status);

        CREATE TABLE IF NOT EXISTS messages (
            id                   TEXT PRIMARY KEY,
            conversation_id      TEXT NOT NULL REFERENCES conversations(id),
            direction            TEXT NOT NULL,
            msg_type             TEXT NOT NULL,
            text                 TEXT,
            media_url            TEXT,
            media_thumb          TEXT,
            replied_to_id        TEXT,
            status               TEXT NOT NULL DEFAULT 'pending',
            timestamp            INTEGER NOT NULL,
            event_type           TEXT,
            sent_by              TEXT,
            provider_message_id  TEXT,
            provider_metadata    TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_id
            ON messages(provider_message_id) WHERE provider_message_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp);

        CREATE TABLE IF NOT EXISTS attachments (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            kind        TEXT NOT NULL,
            url         TEXT NOT NULL,
            thumbnail   TEXT,
            filename    TEXT NOT NULL,
            mimetype    TEXT NOT NULL,
            size        INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_message
            ON attachments(message_id);

        CREATE TABLE IF NOT EXISTS advisors (
            id                   TEXT PRIMARY KEY,
            username             TEXT NOT NULL UNIQUE,
            display_name         TEXT NOT NULL,
            role                 TEXT NOT NULL DEFAULT 'advisor',
            password_hash        TEXT NOT NULL,
            theme                TEXT,
            is_manually_offline  INTEGER NOT NULL DEFAULT 0,
            last_assignment_at   INTEGER,
            created_at           INTEGER NOT NULL,
            updated_at           INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS advisor_statuses (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            color           TEXT NOT NULL DEFAULT '#4caf50',
            action          TEXT NOT NULL DEFAULT 'accept',
            redirect_queue  TEXT,
            is_default      INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS advisor_status_assignments (
            advisor_id  TEXT PRIMARY KEY REFERENCES advisors(id),
            status_id   TEXT NOT NULL REFERENCES advisor_statuses(id),
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS advisor_sessions (
            id          TEXT PRIMARY KEY,
            advisor_id  TEXT NOT NULL REFERENCES advisors(id),
            conversation_id TEXT,
            start_time  INTEGER NOT NULL,
            end_time    INTEGER,
            duration    INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_advisor_sessions_open
            ON advisor_sessions(advisor_id, end_time);

        CREATE TABLE IF NOT EXISTS advisor_activity_logs (
            id          TEXT PRIMARY KEY,
            advisor_id  TEXT NOT NULL,
            action      TEXT NOT NULL,
            details     TEXT NOT NULL DEFAULT '{}',
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_advisor
            ON advisor_activity_logs(advisor_id, created_at);

        CREATE TABLE IF NOT EXISTS queues (
            id                 TEXT PRIMARY KEY,
            name               TEXT NOT NULL,
            distribution_mode  TEXT NOT NULL DEFAULT 'round_robin',
            max_concurrent     INTEGER NOT NULL DEFAULT 5,
            status             TEXT NOT NULL DEFAULT 'active',
            rr_cursor          INTEGER NOT NULL DEFAULT 0,
            schedule           TEXT,
            created_at         INTEGER NOT NULL,
            updated_at         INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_members (
            queue_id       TEXT NOT NULL REFERENCES queues(id),
            advisor_id     TEXT NOT NULL REFERENCES advisors(id),
            is_supervisor  INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (queue_id, advisor_id)
        );

        CREATE TABLE IF NOT EXISTS channel_connections (
            id                        TEXT PRIMARY KEY,
            alias                     TEXT,
            provider_phone_number_id  TEXT NOT NULL UNIQUE,
            display_number            TEXT NOT NULL,
            access_token_enc          TEXT NOT NULL,
            verify_token_enc          TEXT NOT NULL,
            is_active                 INTEGER NOT NULL DEFAULT 1,
            default_queue_id          TEXT,
            default_flow_id           TEXT,
            created_at                INTEGER NOT NULL,
            updated_at                INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
            name   TEXT PRIMARY KEY,
            value  INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO counters(name, value) VALUES ('ticket', 0);

        CREATE TABLE IF NOT EXISTS rag_usage (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT,
            query            TEXT NOT NULL,
            found            INTEGER NOT NULL,
            chunks_used      INTEGER NOT NULL DEFAULT 0,
            cost_usd         REAL NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL
        );

        -- Owned by chasqui-sessions; mirrored here so close() can delete
        -- the bot session inside the same transaction.
        CREATE TABLE IF NOT EXISTS bot_sessions (
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
        );",
    )?;
    Ok(())
}
