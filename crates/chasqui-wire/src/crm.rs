//! CRM integration contract.
//!
//! The engine substitutes `{{entity:FIELD}}` tokens and the agent saves
//! leads through [`CrmAdapter`]; the concrete implementation is a
//! Bitrix-style REST client (`{base}/rest/{auth}/{method}.json`).

use std::time::Duration;

use async_trait::async_trait;
use chasqui_core::config::CrmConfig;
use chasqui_core::hours::WeekSchedule;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, WireError};

/// A CRM contact: stable id plus a flat field map used for token
/// substitution (`{{entity:NAME}}` reads `fields["NAME"]`).
#[derive(Debug, Clone)]
pub struct CrmContact {
    pub id: String,
    pub fields: Map<String, Value>,
}

#[async_trait]
pub trait CrmAdapter: Send + Sync {
    /// Look a contact up by phone. `Ok(None)` when the CRM knows nothing.
    async fn lookup_contact(&self, phone: &str) -> Result<Option<CrmContact>>;

    /// Update fields on an existing contact.
    async fn update_contact(&self, contact_id: &str, fields: &Map<String, Value>) -> Result<()>;

    /// Create a lead. Best-effort callers log failures and continue.
    async fn add_lead(&self, fields: &Map<String, Value>) -> Result<String>;

    /// Business-hours schedule maintained in the CRM for a queue type.
    async fn fetch_schedule(&self, queue_type: &str) -> Result<Option<WeekSchedule>>;
}

pub struct BitrixClient {
    http: reqwest::Client,
    base_url: String,
    auth: String,
}

impl BitrixClient {
    pub fn new(cfg: &CrmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WireError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            auth: cfg.auth.clone(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let url = format!("{}/rest/{}/{}.json", self.base_url, self.auth, method);
        let resp = self
            .http
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| WireError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return Err(WireError::InvalidToken);
        }
        if !(200..=299).contains(&status) {
            let body = chasqui_core::redact::redact_text(&resp.text().await.unwrap_or_default());
            return Err(WireError::Provider { status, body });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| WireError::Network(e.to_string()))?;
        debug!(method, "CRM call ok");
        Ok(body)
    }
}

#[async_trait]
impl CrmAdapter for BitrixClient {
    async fn lookup_contact(&self, phone: &str) -> Result<Option<CrmContact>> {
        let body = self
            .call(
                "crm.contact.list",
                json!({ "filter": { "PHONE": phone }, "select": ["*"] }),
            )
            .await?;

        let Some(first) = body
            .get("result")
            .and_then(|r| r.as_array())
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };

        let id = first
            .get("ID")
            .map(value_to_string)
            .unwrap_or_default();
        let fields = first.as_object().cloned().unwrap_or_default();
        Ok(Some(CrmContact { id, fields }))
    }

    async fn update_contact(&self, contact_id: &str, fields: &Map<String, Value>) -> Result<()> {
        self.call(
            "crm.contact.update",
            json!({ "id": contact_id, "fields": fields }),
        )
        .await?;
        Ok(())
    }

    async fn add_lead(&self, fields: &Map<String, Value>) -> Result<String> {
        let body = self
            .call("crm.lead.add", json!({ "fields": fields }))
            .await?;
        Ok(body.get("result").map(value_to_string).unwrap_or_default())
    }

    async fn fetch_schedule(&self, queue_type: &str) -> Result<Option<WeekSchedule>> {
        let body = self
            .call("crm.schedule.get", json!({ "queue_type": queue_type }))
            .await?;
        match body.get("result") {
            Some(result) if !result.is_null() => {
                match serde_json::from_value::<WeekSchedule>(result.clone()) {
                    Ok(schedule) => Ok(Some(schedule)),
                    Err(e) => {
                        warn!(queue_type, error = %e, "CRM schedule has unexpected shape");
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }
}

/// Bitrix returns ids both as numbers and strings.
fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
