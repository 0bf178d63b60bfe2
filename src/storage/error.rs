use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {0}: {1}")]
    Io(String, std::io::Error),
    #[error("no free block available (ENOSPC)")]
    NoSpace,
    #[error("(file, tag) {0}:{1} already exists")]
    AlreadyExists(String, String),
    #[error("(file, tag) {0}:{1} does not exist")]
    NotFound(String, String),
    #[error("(file, tag) {0}:{1} is COMMITTED, operation not permitted")]
    Committed(String, String),
    #[error("cannot delete initial_file:BASE")]
    CannotDeleteInitial,
    #[error("tag operation {0} requires matching file name")]
    TagFileMismatch(String),
    #[error("offset {0} + size {1} exceeds file size {2}")]
    OutOfRange(u64, u64, u64),
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(String),
    #[error("metadata corrupt for {0}:{1}: {2}")]
    CorruptMetadata(String, String, String),
}
