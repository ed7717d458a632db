use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("flow not found: {id}")]
    NotFound { id: String },

    #[error("no entry flow configured")]
    NoEntryFlow,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<FlowError> for chasqui_core::ChasquiError {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::Invalid(problems) => {
                chasqui_core::ChasquiError::Validation(problems.join("; "))
            }
            FlowError::NotFound { id } => chasqui_core::ChasquiError::NotFound(format!("flow {id}")),
            FlowError::NoEntryFlow => {
                chasqui_core::ChasquiError::NotFound("entry flow".to_string())
            }
            FlowError::Database(e) => chasqui_core::ChasquiError::Internal(e.to_string()),
            FlowError::Serialization(e) => chasqui_core::ChasquiError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
