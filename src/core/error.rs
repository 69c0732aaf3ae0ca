use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No index found at {path}. Build the index first (docindex index <dir>).")]
    IndexNotFound { path: PathBuf },

    #[error("Index at {path} is corrupted: {details}. Rebuild the index (docindex rebuild).")]
    IndexCorrupted { path: PathBuf, details: String },
}

/// Coarse classification callers can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation needs an index that does not exist yet.
    NotFound,
    /// Persisted artifacts are unreadable or inconsistent with each other.
    Corrupted,
    /// The caller asked for something invalid.
    Contract,
    /// A single file failed; retrying later may succeed.
    Transient,
    /// Embedder, storage or other internal failure.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IndexNotFound { .. } => ErrorKind::NotFound,
            Error::IndexCorrupted { .. } => ErrorKind::Corrupted,
            Error::InvalidInput(_) | Error::Config(_) => ErrorKind::Contract,
            Error::Io(_) | Error::Parsing(_) => ErrorKind::Transient,
            Error::Serialization(_) | Error::Database(_) | Error::Model(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let not_found = Error::IndexNotFound {
            path: PathBuf::from("/tmp/index"),
        };
        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        assert!(not_found.is_not_found());
        assert!(not_found.to_string().contains("Build the index first"));

        let corrupted = Error::IndexCorrupted {
            path: PathBuf::from("/tmp/index"),
            details: "record count mismatch".to_string(),
        };
        assert_eq!(corrupted.kind(), ErrorKind::Corrupted);
        assert!(corrupted.to_string().contains("Rebuild"));

        assert_eq!(
            Error::InvalidInput("bad".to_string()).kind(),
            ErrorKind::Contract
        );
        assert_eq!(Error::Parsing("bad".to_string()).kind(), ErrorKind::Transient);
    }
}
