use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] chasqui_store::StoreError),

    #[error("advisor {advisor_id} is not eligible: {reason}")]
    NotEligible { advisor_id: String, reason: String },
}

impl From<QueueError> for chasqui_core::ChasquiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Store(e) => e.into(),
            QueueError::NotEligible { advisor_id, reason } => {
                chasqui_core::ChasquiError::Conflict(format!("advisor {advisor_id}: {reason}"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
