use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of application error tags carried in negative acks.
///
/// The display string is the stable user-facing message; [`ErrorKind::code`]
/// is the machine tag clients branch on. `Timeout` is produced only on the
/// client side when the server fails to acknowledge in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("Invalid session code")]
    InvalidCode,

    #[error("Not found")]
    NotFound,

    #[error("Session has expired")]
    SessionExpired,

    #[error("You have not joined a session")]
    NotJoined,

    #[error("You are not allowed to do that")]
    Forbidden,

    #[error("Message is empty")]
    Empty,

    #[error("Message is too long")]
    TooLong,

    #[error("File is too large")]
    FileTooLarge,

    #[error("File is empty")]
    EmptyFile,

    #[error("Session message limit reached")]
    MessageCapReached,

    #[error("Session file limit reached")]
    SessionFileCapReached,

    #[error("Server storage is full, try again later")]
    OutOfMemory,

    #[error("Too many uploads in progress for this session")]
    TooManyConcurrentUploads,

    #[error("Upload not found")]
    UploadNotFound,

    #[error("Upload already completed")]
    AlreadyCompleted,

    #[error("Invalid chunk index")]
    InvalidChunkIndex,

    #[error("Upload is not complete")]
    Incomplete,

    #[error("Upload is missing a chunk")]
    MissingChunk,

    #[error("Assembled size does not match the declared size")]
    SizeMismatch,

    #[error("Request timed out")]
    Timeout,
}

impl ErrorKind {
    /// Stable machine tag for programmatic branching.
    pub const fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCode => "InvalidCode",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::SessionExpired => "SessionExpired",
            ErrorKind::NotJoined => "NotJoined",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Empty => "Empty",
            ErrorKind::TooLong => "TooLong",
            ErrorKind::FileTooLarge => "FileTooLarge",
            ErrorKind::EmptyFile => "EmptyFile",
            ErrorKind::MessageCapReached => "MessageCapReached",
            ErrorKind::SessionFileCapReached => "SessionFileCapReached",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::TooManyConcurrentUploads => "TooManyConcurrentUploads",
            ErrorKind::UploadNotFound => "UploadNotFound",
            ErrorKind::AlreadyCompleted => "AlreadyCompleted",
            ErrorKind::InvalidChunkIndex => "InvalidChunkIndex",
            ErrorKind::Incomplete => "Incomplete",
            ErrorKind::MissingChunk => "MissingChunk",
            ErrorKind::SizeMismatch => "SizeMismatch",
            ErrorKind::Timeout => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_matches_variant() {
        assert_eq!(ErrorKind::OutOfMemory.code(), "OutOfMemory");
        assert_eq!(ErrorKind::NotJoined.code(), "NotJoined");
    }

    #[test]
    fn test_user_facing_strings() {
        assert_eq!(
            ErrorKind::SessionExpired.to_string(),
            "Session has expired"
        );
        assert_eq!(ErrorKind::Timeout.to_string(), "Request timed out");
    }
}
