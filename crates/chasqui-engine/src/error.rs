use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] chasqui_store::StoreError),

    #[error(transparent)]
    Session(#[from] chasqui_sessions::SessionError),

    #[error(transparent)]
    Flow(#[from] chasqui_flows::FlowError),

    #[error(transparent)]
    Queue(#[from] chasqui_queue::QueueError),

    #[error("send failed: {0}")]
    Send(#[from] chasqui_core::ChasquiError),

    #[error("agent error: {0}")]
    Agent(#[from] chasqui_agent::ProviderError),

    #[error("node '{node_id}' failed: {reason}")]
    Node { node_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
