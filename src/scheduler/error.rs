use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
