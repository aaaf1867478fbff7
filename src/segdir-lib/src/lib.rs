mod block_size;
mod commit;
mod directory;
mod tools;

pub use block_size::*;
pub use commit::*;
pub use directory::*;
pub use tools::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("version conflict: {0}")]
    VersionConflict(String),
    #[error("not empty: {0}")]
    NotEmpty(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("offset too large: {0}")]
    OffsetTooLarge(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SegError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SegError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, SegError::AlreadyExists(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, SegError::VersionConflict(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, SegError::Unavailable(_))
    }
}

pub type SegResult<T> = std::result::Result<T, SegError>;

impl From<std::io::Error> for SegError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SegError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => SegError::AlreadyExists(err.to_string()),
            _ => SegError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SegError {
    fn from(err: serde_json::Error) -> Self {
        SegError::InvalidParam(err.to_string())
    }
}

// The producer regenerates this file locally on every open, so it is never pulled from remote.
pub const SEGMENTS_GEN_FILE: &str = "segments.gen";

pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_REFS_NAME: &str = "refs";
pub const DEFAULT_LOCKS_NAME: &str = "locks";
pub const DEFAULT_BASE_COORD_PATH: &str = "/segdir";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: SegError = std::io::Error::new(std::io::ErrorKind::NotFound, "seg.0").into();
        assert!(err.is_not_found());

        let err: SegError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "seg.0").into();
        assert!(matches!(err, SegError::IoError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = SegError::VersionConflict("/locks/write.lock".to_string());
        assert_eq!(err.to_string(), "version conflict: /locks/write.lock");
        assert!(err.is_version_conflict());
        assert!(!err.is_not_found());
    }
}
