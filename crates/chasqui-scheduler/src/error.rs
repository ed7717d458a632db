use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] chasqui_store::StoreError),

    #[error(transparent)]
    Session(#[from] chasqui_sessions::SessionError),

    #[error(transparent)]
    Flow(#[from] chasqui_flows::FlowError),

    #[error(transparent)]
    Queue(#[from] chasqui_queue::QueueError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
