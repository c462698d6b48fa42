// ABOUTME: Domain error type returned by the sandbox managers and service facade
// ABOUTME: Folds runtime and storage errors into the kinds callers branch on

use crate::runtime::RuntimeError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SandboxError::Conflict(_))
    }

    /// Whether running the same job again could succeed. A vanished instance or a
    /// destroyed record will not come back on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SandboxError::NotFound(_) | SandboxError::Validation(_)
        )
    }
}

impl From<RuntimeError> for SandboxError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::NotFound(msg) => SandboxError::NotFound(msg),
            RuntimeError::Backend(msg) => SandboxError::Backend(msg),
            RuntimeError::Timeout(msg) => SandboxError::Timeout(msg),
        }
    }
}

impl From<StorageError> for SandboxError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(msg) => SandboxError::NotFound(msg),
            StorageError::Conflict(msg) => SandboxError::Conflict(msg),
            StorageError::Capacity(msg) => SandboxError::Capacity(msg),
            StorageError::InvalidTransition { from, to } => {
                SandboxError::Conflict(format!("cannot move from {} to {}", from, to))
            }
            other => SandboxError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_keep_their_kind() {
        assert!(SandboxError::from(RuntimeError::NotFound("x".into())).is_not_found());
        assert!(matches!(
            SandboxError::from(RuntimeError::Timeout("x".into())),
            SandboxError::Timeout(_)
        ));
    }

    #[test]
    fn test_missing_and_invalid_are_final() {
        assert!(!SandboxError::NotFound("alice-dev".into()).is_retryable());
        assert!(!SandboxError::Validation("alice-dev is destroyed".into()).is_retryable());
        assert!(SandboxError::Backend("engine unavailable".into()).is_retryable());
        assert!(SandboxError::Timeout("start".into()).is_retryable());
    }

    #[test]
    fn test_storage_transition_is_conflict() {
        let err = SandboxError::from(StorageError::InvalidTransition {
            from: "destroyed".into(),
            to: "running".into(),
        });
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "Conflict: cannot move from destroyed to running"
        );
    }
}
