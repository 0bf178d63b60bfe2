use thiserror::Error;

use crate::storage::StorageError;
use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("wire error talking to {0}: {1}")]
    Wire(&'static str, WireError),

    #[error("storage rejected request: {0}")]
    Storage(String),

    #[error("script error at pc={0}: {1}")]
    Script(u32, String),

    #[error("unknown opcode {0} in script")]
    UnknownOpcode(String),

    #[error("out of memory frames")]
    OutOfMemory,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for WorkerError {
    fn from(e: StorageError) -> Self {
        WorkerError::Storage(e.to_string())
    }
}
