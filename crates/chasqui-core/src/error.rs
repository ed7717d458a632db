use thiserror::Error;

/// Platform-wide error taxonomy. Subsystem crates define their own error
/// enums and convert into this at the gateway boundary.
#[derive(Debug, Error)]
pub enum ChasquiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Server is shutting down")]
    Shutdown,
}

impl ChasquiError {
    /// Short error code string sent to clients in API and WS responses.
    pub fn code(&self) -> &'static str {
        match self {
            ChasquiError::Config(_) => "CONFIG_ERROR",
            ChasquiError::Auth(_) => "AUTH_FAILED",
            ChasquiError::Validation(_) => "VALIDATION_ERROR",
            ChasquiError::NotFound(_) => "NOT_FOUND",
            ChasquiError::Conflict(_) => "CONFLICT",
            ChasquiError::Upstream { .. } => "UPSTREAM_ERROR",
            ChasquiError::Network(_) => "NETWORK_ERROR",
            ChasquiError::RateLimited { .. } => "RATE_LIMITED",
            ChasquiError::Serialization(_) => "SERIALIZATION_ERROR",
            ChasquiError::Internal(_) => "INTERNAL_ERROR",
            ChasquiError::Shutdown => "SHUTTING_DOWN",
        }
    }

    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChasquiError::Network(_)
                | ChasquiError::RateLimited { .. }
                | ChasquiError::Upstream { status: 500..=599, .. }
                | ChasquiError::Upstream { status: 408, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChasquiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes() {
        assert!(ChasquiError::Network("reset".into()).is_transient());
        assert!(ChasquiError::RateLimited { retry_after_ms: 100 }.is_transient());
        assert!(ChasquiError::Upstream { status: 503, body: String::new() }.is_transient());
        assert!(ChasquiError::Upstream { status: 408, body: String::new() }.is_transient());
        assert!(!ChasquiError::Upstream { status: 401, body: String::new() }.is_transient());
        assert!(!ChasquiError::Validation("bad".into()).is_transient());
    }
}
