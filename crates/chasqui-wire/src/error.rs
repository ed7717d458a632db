use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("provider rejected the access token")]
    InvalidToken,

    #[error("unknown phone-number-id: {0}")]
    InvalidPhoneId(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider error ({status}): {body}")]
    Provider { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WireError {
    /// Transient errors are worth a retry; the rest fail the send.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WireError::Network(_)
                | WireError::RateLimited { .. }
                | WireError::Provider { status: 500..=599, .. }
                | WireError::Provider { status: 408, .. }
        )
    }
}

impl From<WireError> for chasqui_core::ChasquiError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::InvalidToken => chasqui_core::ChasquiError::Auth("invalid provider token".into()),
            WireError::InvalidPhoneId(id) => {
                chasqui_core::ChasquiError::NotFound(format!("phone-number-id {id}"))
            }
            WireError::RateLimited { retry_after_ms } => {
                chasqui_core::ChasquiError::RateLimited { retry_after_ms }
            }
            WireError::Provider { status, body } => {
                chasqui_core::ChasquiError::Upstream { status, body }
            }
            WireError::Network(msg) => chasqui_core::ChasquiError::Network(msg),
            WireError::Serialization(e) => chasqui_core::ChasquiError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
