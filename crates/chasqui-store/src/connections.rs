//! WhatsApp channel connections. Access and verify tokens are stored
//! encrypted; the canonical identifier is always the provider
//! phone-number-id, local row UUIDs are aliases the resolver rewrites.

use chasqui_core::secrets::SecretStore;
use chasqui_core::types::{normalize_display_number, now_millis};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelConnection {
    pub id: String,
    pub alias: Option<String>,
    pub provider_phone_number_id: String,
    pub display_number: String,
    #[serde(skip_serializing)]
    pub access_token_enc: String,
    #[serde(skip_serializing)]
    pub verify_token_enc: String,
    pub is_active: bool,
    pub default_queue_id: Option<String>,
    pub default_flow_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChannelConnection {
    pub fn access_token(&self, secrets: &SecretStore) -> Result<String> {
        secrets
            .decrypt(&self.access_token_enc)
            .map_err(|e| StoreError::Crypto(e.to_string()))
    }

    pub fn verify_token(&self, secrets: &SecretStore) -> Result<String> {
        secrets
            .decrypt(&self.verify_token_enc)
            .map_err(|e| StoreError::Crypto(e.to_string()))
    }
}

const CONN_COLS: &str = "id, alias, provider_phone_number_id, display_number, access_token_enc, \
     verify_token_enc, is_active, default_queue_id, default_flow_id, created_at, updated_at";

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelConnection> {
    Ok(ChannelConnection {
        id: row.get(0)?,
        alias: row.get(1)?,
        provider_phone_number_id: row.get(2)?,
        display_number: row.get(3)?,
        access_token_enc: row.get(4)?,
        verify_token_enc: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        default_queue_id: row.get(7)?,
        default_flow_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl Store {
    /// Create or update the connection for a provider phone-number-id.
    /// Tokens arrive in plaintext and are encrypted before the row is
    /// written.
    #[allow(clippy::too_many_arguments)]
    pub fn save_connection(
        &self,
        secrets: &SecretStore,
        provider_phone_number_id: &str,
        alias: Option<&str>,
        display_number: &str,
        access_token: &str,
        verify_token: &str,
        default_queue_id: Option<&str>,
        default_flow_id: Option<&str>,
    ) -> Result<ChannelConnection> {
        if provider_phone_number_id.trim().is_empty() {
            return Err(StoreError::Validation(
                "provider_phone_number_id must not be empty".into(),
            ));
        }
        let access_enc = secrets
            .encrypt(access_token)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        let verify_enc = secrets
            .encrypt(verify_token)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        let display = normalize_display_number(display_number);
        let now = now_millis();

        {
            let db = self.db.lock().unwrap();
            let existing: Option<String> = db
                .query_row(
                    "SELECT id FROM channel_connections WHERE provider_phone_number_id = ?1",
                    params![provider_phone_number_id],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    db.execute(
                        "UPDATE channel_connections
                         SET alias = ?1, display_number = ?2, access_token_enc = ?3,
                             verify_token_enc = ?4, default_queue_id = ?5, default_flow_id = ?6,
                             updated_at = ?7
                         WHERE id = ?8",
                        params![
                            alias,
                            display,
                            access_enc,
                            verify_enc,
                            default_queue_id,
                            default_flow_id,
                            now,
                            id
                        ],
                    )?;
                }
                None => {
                    db.execute(
                        "INSERT INTO channel_connections
                         (id, alias, provider_phone_number_id, display_number, access_token_enc,
                          verify_token_enc, is_active, default_queue_id, default_flow_id,
                          created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?9)",
                        params![
                            Uuid::new_v4().to_string(),
                            alias,
                            provider_phone_number_id,
                            display,
                            access_enc,
                            verify_enc,
                            default_queue_id,
                            default_flow_id,
                            now
                        ],
                    )?;
                }
            }
        }
        self.get_connection(provider_phone_number_id)?
            .ok_or_else(|| StoreError::NotFound {
                what: "channel connection",
                id: provider_phone_number_id.to_string(),
            })
    }

    /// Resolve a connection by canonical provider id, falling back to the
    /// row UUID or alias for legacy callers. The returned record always
    /// carries the canonical id.
    pub fn get_connection(&self, id_or_alias: &str) -> Result<Option<ChannelConnection>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                &format!(
                    "SELECT {CONN_COLS} FROM channel_connections
                     WHERE provider_phone_number_id = ?1 OR id = ?1 OR alias = ?1
                     LIMIT 1"
                ),
                params![id_or_alias],
                row_to_connection,
            )
            .optional()?)
    }

    pub fn list_connections(&self) -> Result<Vec<ChannelConnection>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CONN_COLS} FROM channel_connections ORDER BY display_number"
        ))?;
        let rows = stmt.query_map([], row_to_connection)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_connection_active(&self, provider_phone_number_id: &str, active: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE channel_connections SET is_active = ?1, updated_at = ?2
             WHERE provider_phone_number_id = ?3",
            params![active as i64, now_millis(), provider_phone_number_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "channel connection",
                id: provider_phone_number_id.to_string(),
            });
        }
        Ok(())
    }

    /// Alias → canonical-id map for the one-time conversation migration.
    pub fn connection_alias_map(&self) -> Result<std::collections::HashMap<String, String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, alias, provider_phone_number_id FROM channel_connections",
        )?;
        let mut map = std::collections::HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            let (id, alias, canonical) = row;
            if id != canonical {
                map.insert(id, canonical.clone());
            }
            if let Some(alias) = alias {
                if alias != canonical {
                    map.insert(alias, canonical);
                }
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> SecretStore {
        SecretStore::new("test-process-secret").unwrap()
    }

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn tokens_roundtrip_through_encryption() {
        let s = store();
        let sec = secrets();
        let conn = s
            .save_connection(
                &sec,
                "104858275551234",
                Some("linea-principal"),
                "+51 1 700 0000",
                "EAAG-access",
                "verify-123",
                None,
                None,
            )
            .unwrap();
        assert_ne!(conn.access_token_enc, "EAAG-access");
        assert_eq!(conn.access_token(&sec).unwrap(), "EAAG-access");
        assert_eq!(conn.verify_token(&sec).unwrap(), "verify-123");
        assert_eq!(conn.display_number, "+5117000000");
    }

    #[test]
    fn resolves_by_canonical_id_alias_and_row_uuid() {
        let s = store();
        let sec = secrets();
        let conn = s
            .save_connection(&sec, "104", Some("main"), "+51", "t", "v", None, None)
            .unwrap();
        for needle in ["104", "main", conn.id.as_str()] {
            let found = s.get_connection(needle).unwrap().unwrap();
            assert_eq!(found.provider_phone_number_id, "104");
        }
        assert!(s.get_connection("nope").unwrap().is_none());
    }

    #[test]
    fn save_twice_updates_in_place() {
        let s = store();
        let sec = secrets();
        let first = s
            .save_connection(&sec, "104", None, "+51", "t1", "v1", None, None)
            .unwrap();
        let second = s
            .save_connection(&sec, "104", None, "+51", "t2", "v2", Some("q-1"), None)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.access_token(&sec).unwrap(), "t2");
        assert_eq!(second.default_queue_id.as_deref(), Some("q-1"));
    }

    #[test]
    fn alias_map_covers_uuid_and_alias() {
        let s = store();
        let sec = secrets();
        let conn = s
            .save_connection(&sec, "104", Some("main"), "+51", "t", "v", None, None)
            .unwrap();
        let map = s.connection_alias_map().unwrap();
        assert_eq!(map.get(&conn.id).map(String::as_str), Some("104"));
        assert_eq!(map.get("main").map(String::as_str), Some("104"));
    }
}
