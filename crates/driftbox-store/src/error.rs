use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("File not found")]
    FileNotFound,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Only the sender or the session creator may delete a message")]
    Forbidden,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("File is empty")]
    EmptyFile,

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Session already holds {max} files")]
    FileCapReached { max: usize },

    #[error("Session already holds {max} messages")]
    MessageCapReached { max: usize },

    #[error("Byte budget exhausted: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;
