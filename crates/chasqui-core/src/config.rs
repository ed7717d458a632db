use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Runtime constants shared across subsystems.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // WS ping cadence
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024; // hard cap per WS frame
pub const CLIENT_QUEUE_CAPACITY: usize = 256; // per-WS-client outbound buffer
pub const INGRESS_QUEUE_CAPACITY: usize = 512; // per-channel webhook backlog
pub const SCHEDULER_TICK_SECS: u64 = 60;
pub const PROVIDER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_PORT: u16 = 8330;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (chasqui.toml + CHASQUI_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChasquiConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub locale: LocaleConfig,
    pub crm: Option<CrmConfig>,
    pub agent: Option<AgentConfig>,
    /// When true the webhook keeps acknowledging but processing is paused.
    #[serde(default)]
    pub maintenance_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer key WS clients must present. `None` disables the realtime bus.
    pub realtime_auth_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            realtime_auth_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// WhatsApp Cloud API settings shared by every channel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Graph API version segment, e.g. "v21.0".
    pub api_version: String,
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    /// App secret for webhook body signatures (X-Hub-Signature-256).
    /// When unset, POST bodies are accepted unsigned.
    pub app_secret: Option<String>,
    /// Optional HTTPS proxy for all outbound provider calls.
    pub https_proxy: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Process-wide secret the at-rest encryption key is derived from.
    #[serde(default)]
    pub process_secret: String,
}

/// Fixed locale used for business-hours evaluation and report headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleConfig {
    /// Minutes east of UTC. Default -300 (America/Lima).
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_timezone_name")]
    pub timezone_name: String,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset(),
            timezone_name: default_timezone_name(),
        }
    }
}

/// Bitrix-style CRM REST endpoint: `{base_url}/rest/{auth}/{method}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    pub base_url: String,
    pub auth: String,
}

/// Chat-completion provider driving `agent` nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub api_key: String,
    #[serde(default = "default_agent_model")]
    pub model: String,
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    /// Where the send_catalogs tool builds its PDF links from.
    pub catalog_base_url: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chasqui/chasqui.db", home)
}
fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}
fn default_provider_timeout() -> u64 {
    PROVIDER_TIMEOUT_SECS
}
fn default_utc_offset() -> i32 {
    -300
}
fn default_timezone_name() -> String {
    "America/Lima".to_string()
}
fn default_agent_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_agent_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

impl ChasquiConfig {
    /// Load config from a TOML file with CHASQUI_* env var overrides.
    ///
    /// Nested keys use a double underscore in the environment,
    /// e.g. `CHASQUI_SECURITY__PROCESS_SECRET`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChasquiConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHASQUI_").split("__"))
            .extract()
            .map_err(|e| crate::error::ChasquiError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Validate everything at once and report every problem, not just the
    /// first. Startup aborts (exit code 1) when this fails.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.security.process_secret.trim().is_empty() {
            problems.push("security.process_secret must not be empty".into());
        }
        if self.provider.api_version.trim().is_empty() {
            problems.push("provider.api_version must not be empty (e.g. \"v21.0\")".into());
        }
        if self.database.path.trim().is_empty() {
            problems.push("database.path must not be empty".into());
        }
        if self.server.port == 0 {
            problems.push("server.port must not be 0".into());
        }
        if !(-720..=840).contains(&self.locale.utc_offset_minutes) {
            problems.push(format!(
                "locale.utc_offset_minutes {} is outside -720..=840",
                self.locale.utc_offset_minutes
            ));
        }
        if let Some(crm) = &self.crm {
            if crm.base_url.trim().is_empty() || crm.auth.trim().is_empty() {
                problems.push("crm.base_url and crm.auth must both be set when [crm] is present".into());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(crate::error::ChasquiError::Config(format!(
                "invalid configuration:\n  - {}",
                problems.join("\n  - ")
            )))
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chasqui/chasqui.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ChasquiConfig {
        ChasquiConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            provider: ProviderConfig {
                api_version: "v21.0".into(),
                base_url: default_graph_base_url(),
                app_secret: None,
                https_proxy: None,
                timeout_secs: 15,
            },
            security: SecurityConfig {
                process_secret: "a-long-process-secret".into(),
            },
            locale: LocaleConfig::default(),
            crm: None,
            agent: None,
            maintenance_mode: false,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_secret_and_version_both_reported() {
        let mut cfg = valid_config();
        cfg.security.process_secret = String::new();
        cfg.provider.api_version = "  ".into();
        let err = cfg.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("process_secret"));
        assert!(msg.contains("api_version"));
    }

    #[test]
    fn offset_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.locale.utc_offset_minutes = 10_000;
        assert!(cfg.validate().is_err());
    }
}
