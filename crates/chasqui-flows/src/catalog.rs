//! The flow catalog: durable storage plus an in-memory cache of validated
//! definitions. The durable store is the single source of truth; the cache
//! only ever holds flows that passed validation.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument};

use crate::db::init_db;
use crate::error::{FlowError, Result};
use crate::graph::FlowDefinition;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub is_default: bool,
    pub is_active: bool,
}

pub struct FlowCatalog {
    db: Mutex<Connection>,
    cache: DashMap<String, Arc<FlowDefinition>>,
}

impl FlowCatalog {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cache: DashMap::new(),
        })
    }

    /// Validate and persist a flow, bumping its version when it already
    /// exists. The cache entry is replaced only after the write commits.
    #[instrument(skip(self, definition), fields(flow_id = %definition.id))]
    pub fn save(&self, mut definition: FlowDefinition) -> Result<Arc<FlowDefinition>> {
        definition.validate()?;

        let now = chrono::Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            let existing_version: Option<u32> = db
                .query_row(
                    "SELECT version FROM flows WHERE id = ?1",
                    params![definition.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(version) = existing_version {
                definition.version = version + 1;
                db.execute(
                    "UPDATE flows SET name = ?1, version = ?2, definition = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![
                        definition.name,
                        definition.version,
                        serde_json::to_string(&definition)?,
                        now,
                        definition.id
                    ],
                )?;
            } else {
                db.execute(
                    "INSERT INTO flows (id, name, version, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        definition.id,
                        definition.name,
                        definition.version,
                        serde_json::to_string(&definition)?,
                        now
                    ],
                )?;
            }
        }

        let arc = Arc::new(definition);
        self.cache.insert(arc.id.clone(), arc.clone());
        info!(version = arc.version, "flow saved");
        Ok(arc)
    }

    /// Fetch a flow, cache-first.
    pub fn get(&self, flow_id: &str) -> Result<Arc<FlowDefinition>> {
        if let Some(cached) = self.cache.get(flow_id) {
            return Ok(cached.clone());
        }

        let json: Option<String> = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT definition FROM flows WHERE id = ?1 AND is_active = 1",
                params![flow_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(json) = json else {
            return Err(FlowError::NotFound {
                id: flow_id.to_string(),
            });
        };

        let definition: FlowDefinition = serde_json::from_str(&json)?;
        definition.validate()?;
        let arc = Arc::new(definition);
        self.cache.insert(flow_id.to_string(), arc.clone());
        Ok(arc)
    }

    /// Resolve the entry flow for an inbound channel: the connection's
    /// default flow when configured, else the global default.
    pub fn resolve_entry(&self, channel_default: Option<&str>) -> Result<Arc<FlowDefinition>> {
        if let Some(flow_id) = channel_default {
            match self.get(flow_id) {
                Ok(flow) => return Ok(flow),
                Err(FlowError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let global: Option<String> = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT id FROM flows WHERE is_default = 1 AND is_active = 1 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };
        match global {
            Some(id) => self.get(&id),
            None => Err(FlowError::NoEntryFlow),
        }
    }

    /// Mark a flow as the global default, demoting any previous one.
    pub fn set_default(&self, flow_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let tx_result: rusqlite::Result<()> = (|| {
            db.execute("UPDATE flows SET is_default = 0", [])?;
            let n = db.execute(
                "UPDATE flows SET is_default = 1 WHERE id = ?1",
                params![flow_id],
            )?;
            if n == 0 {
                // leave no default rather than point at a missing flow
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(())
        })();
        tx_result.map_err(|_| FlowError::NotFound {
            id: flow_id.to_string(),
        })
    }

    pub fn list(&self) -> Result<Vec<FlowSummary>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, version, is_default, is_active FROM flows ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FlowSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
                is_default: row.get::<_, i64>(3)? != 0,
                is_active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{handle, Edge, FlowNode};
    use crate::node::{EndNode, MessageNode, NodeKind};

    fn catalog() -> FlowCatalog {
        FlowCatalog::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn tiny_flow(id: &str) -> FlowDefinition {
        FlowDefinition {
            id: id.to_string(),
            name: format!("Flujo {id}"),
            version: 1,
            nodes: vec![
                FlowNode {
                    id: "n-start".into(),
                    label: None,
                    kind: NodeKind::Start,
                    delay_seconds: None,
                },
                FlowNode {
                    id: "n-msg".into(),
                    label: None,
                    kind: NodeKind::Message(MessageNode { text: "Hola".into() }),
                    delay_seconds: None,
                },
                FlowNode {
                    id: "n-end".into(),
                    label: None,
                    kind: NodeKind::End(EndNode::default()),
                    delay_seconds: None,
                },
            ],
            edges: vec![
                Edge {
                    from_node: "n-start".into(),
                    from_handle: handle::DEFAULT.into(),
                    to_node: "n-msg".into(),
                },
                Edge {
                    from_node: "n-msg".into(),
                    from_handle: handle::DEFAULT.into(),
                    to_node: "n-end".into(),
                },
            ],
            bot_timeout_minutes: 30,
            fallback_queue_id: None,
            allow_unreachable: false,
        }
    }

    #[test]
    fn save_and_get_roundtrip() {
        let c = catalog();
        c.save(tiny_flow("f-1")).unwrap();
        let loaded = c.get("f-1").unwrap();
        assert_eq!(loaded.name, "Flujo f-1");
        assert_eq!(loaded.nodes.len(), 3);
    }

    #[test]
    fn save_bumps_version() {
        let c = catalog();
        let v1 = c.save(tiny_flow("f-1")).unwrap();
        assert_eq!(v1.version, 1);
        let v2 = c.save(tiny_flow("f-1")).unwrap();
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn invalid_flow_rejected_at_save() {
        let c = catalog();
        let mut flow = tiny_flow("f-bad");
        flow.nodes.retain(|n| n.kind != NodeKind::Start);
        assert!(matches!(c.save(flow), Err(FlowError::Invalid(_))));
        assert!(matches!(c.get("f-bad"), Err(FlowError::NotFound { .. })));
    }

    #[test]
    fn entry_resolution_prefers_channel_default() {
        let c = catalog();
        c.save(tiny_flow("f-global")).unwrap();
        c.save(tiny_flow("f-channel")).unwrap();
        c.set_default("f-global").unwrap();

        assert_eq!(c.resolve_entry(Some("f-channel")).unwrap().id, "f-channel");
        assert_eq!(c.resolve_entry(None).unwrap().id, "f-global");
        // A channel default that no longer exists falls back to global.
        assert_eq!(c.resolve_entry(Some("f-gone")).unwrap().id, "f-global");
    }

    #[test]
    fn no_entry_flow_is_an_error() {
        let c = catalog();
        assert!(matches!(c.resolve_entry(None), Err(FlowError::NoEntryFlow)));
    }
}
