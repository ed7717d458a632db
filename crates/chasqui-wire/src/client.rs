//! Retrying HTTP client for the Cloud API.
//!
//! Transient failures (5xx, 408, 429, network) are retried up to three
//! times with 500/1500/4500 ms backoff, jittered ±20%; 429 honours the
//! `Retry-After` header instead of the backoff table. 4xx other than
//! 408/429 fail immediately.

use std::time::Duration;

use chasqui_core::config::ProviderConfig;
use chasqui_core::redact;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, WireError};

const BACKOFF_MS: [u64; 3] = [500, 1500, 4500];

/// Metadata for a provider phone number, from `GET …/{phone_number_id}`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PhoneMeta {
    pub id: String,
    pub display_phone_number: Option<String>,
    pub verified_name: Option<String>,
    pub quality_rating: Option<String>,
}

pub struct CloudApiClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl CloudApiClient {
    pub fn new(cfg: &ProviderConfig) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout_secs));
        if let Some(proxy) = &cfg.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| WireError::Network(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| WireError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_version: cfg.api_version.clone(),
        })
    }

    /// POST a message payload. Returns the provider message id (`wamid.…`).
    pub async fn send_message(
        &self,
        phone_number_id: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<String> {
        let url = format!(
            "{}/{}/{}/messages",
            self.base_url, self.api_version, phone_number_id
        );

        let body = self
            .request_with_retry(phone_number_id, || {
                self.http.post(&url).bearer_auth(access_token).json(payload)
            })
            .await?;

        body.get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| WireError::Provider {
                status: 200,
                body: "response carried no message id".into(),
            })
    }

    /// GET the phone-number metadata, used by the connection `check` and
    /// `test` endpoints.
    pub async fn fetch_phone_meta(
        &self,
        phone_number_id: &str,
        access_token: &str,
    ) -> Result<PhoneMeta> {
        let url = format!("{}/{}/{}", self.base_url, self.api_version, phone_number_id);
        let body = self
            .request_with_retry(phone_number_id, || {
                self.http.get(&url).bearer_auth(access_token)
            })
            .await?;
        serde_json::from_value(body).map_err(WireError::Serialization)
    }

    async fn request_with_retry<F>(&self, phone_number_id: &str, make: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match self.execute_once(phone_number_id, make()).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < BACKOFF_MS.len() => {
                    let delay = match &e {
                        WireError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms)
                        }
                        _ => jittered(BACKOFF_MS[attempt]),
                    };
                    warn!(
                        phone_number_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_once(
        &self,
        phone_number_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value> {
        let resp = request
            .send()
            .await
            .map_err(|e| WireError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => resp
                .json()
                .await
                .map_err(|e| WireError::Network(e.to_string())),
            401 | 403 => Err(WireError::InvalidToken),
            404 => Err(WireError::InvalidPhoneId(phone_number_id.to_string())),
            429 => {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(5000);
                Err(WireError::RateLimited { retry_after_ms })
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                let body = redact::redact_text(&body);
                debug!(phone_number_id, status, body = %body, "provider error body");
                Err(WireError::Provider { status, body })
            }
        }
    }
}

/// Jitter a backoff delay by ±20%.
fn jittered(base_ms: u64) -> Duration {
    let spread = base_ms / 5;
    let low = base_ms - spread;
    let high = base_ms + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let d = jittered(1500).as_millis() as u64;
            assert!((1200..=1800).contains(&d), "out of range: {d}");
        }
    }
}
