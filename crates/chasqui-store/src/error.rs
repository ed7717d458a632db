use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<StoreError> for chasqui_core::ChasquiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { what, id } => {
                chasqui_core::ChasquiError::NotFound(format!("{what} {id}"))
            }
            StoreError::Conflict(msg) => chasqui_core::ChasquiError::Conflict(msg),
            StoreError::Validation(msg) => chasqui_core::ChasquiError::Validation(msg),
            StoreError::Serialization(e) => chasqui_core::ChasquiError::Serialization(e),
            StoreError::Database(e) => chasqui_core::ChasquiError::Internal(e.to_string()),
            StoreError::Crypto(msg) => chasqui_core::ChasquiError::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
