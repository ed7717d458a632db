use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {key}")]
    NotFound { key: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SessionError> for chasqui_core::ChasquiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { key } => {
                chasqui_core::ChasquiError::NotFound(format!("session {key}"))
            }
            SessionError::Database(e) => chasqui_core::ChasquiError::Internal(e.to_string()),
            SessionError::Serialization(e) => chasqui_core::ChasquiError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
