//! Backend error types and options

use bookkeeper_core::deployment::CheckpointError;
use bookkeeper_core::engine::EngineError;
use bookkeeper_core::project::{PROJECT_FILE, ProjectError};
use thiserror::Error;

use crate::blob::BlobError;
use crate::lock::LockInfo;

/// Enables gzip compression of newly written checkpoints and history
pub const GZIP_ENV_VAR: &str = "BOOKKEEPER_SELF_MANAGED_STATE_GZIP";

/// Disables the `.bak` copies made before overwriting a checkpoint
pub const DISABLE_BACKUPS_ENV_VAR: &str = "BOOKKEEPER_DISABLE_CHECKPOINT_BACKUPS";

/// Errors that can occur when interacting with the state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The stack does not exist
    #[error("no stack named '{0}' found")]
    StackNotFound(String),

    /// Create of a stack that already exists
    #[error("stack '{0}' already exists")]
    StackAlreadyExists(String),

    /// Rename onto a stack that already exists
    #[error("a stack named {0} already exists")]
    DestinationExists(String),

    /// Another backend instance holds a lock on the stack
    #[error(
        "the stack is currently locked by {count} lock(s). Either wait for the other process(es) to end or delete the lock file with `bookkeeper cancel`.\n{details}"
    )]
    Locked { count: usize, details: String },

    /// Malformed stack or project identifier
    #[error("{0}")]
    InvalidStackReference(String),

    /// Project in a stack reference disagrees with the workspace
    #[error(
        "provided project name \"{given}\" doesn't match {file} project name \"{expected}\"",
        file = PROJECT_FILE
    )]
    ProjectMismatch { given: String, expected: String },

    /// Reference of the wrong shape for the current layout
    #[error("stack reference {reference} is not valid for a {mode} state store")]
    InvalidReferenceForLayout { reference: String, mode: String },

    /// The layout marker is unreadable or too old
    #[error("state store is corrupt: {0}")]
    CorruptState(String),

    /// The layout marker was written by a newer version
    #[error(
        "state store version {found} is not supported by this version of bookkeeper (supports up to {max}); please upgrade bookkeeper"
    )]
    UnsupportedStateVersion { found: i64, max: i64 },

    /// The bucket URL names a scheme nobody can open
    #[error("unsupported bucket scheme \"{scheme}\"; valid schemes are: {valid}")]
    UnsupportedScheme { scheme: String, valid: String },

    /// A checkpoint or deployment could not be decoded
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Imported deployment has a version outside the supported range
    #[error("unsupported deployment version {0}")]
    UnsupportedDeploymentVersion(i64),

    /// Blob store failure
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Local I/O failure outside of the blob store
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Remove of a stack that still has resources
    #[error(
        "'{stack}' still has {count} resource(s) under management; remove them or pass --force"
    )]
    StackNotEmpty { stack: String, count: usize },

    /// A legacy stack could not be moved into the project layout
    #[error("upgrading stack '{stack}': {message}")]
    Migration { stack: String, message: String },

    /// Loading the workspace project failed
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// The engine reported a failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Recording history after an operation failed
    #[error("saving update info: {0}")]
    SavingUpdateInfo(Box<BackendError>),

    /// Backing up the checkpoint after an operation failed
    #[error("saving backup: {0}")]
    SavingBackup(Box<BackendError>),

    /// The stack has never been deployed
    #[error("no previous deployment")]
    NoPreviousDeployment,
}

impl BackendError {
    /// Create a Locked error from the foreign locks found on a stack
    pub fn locked(locks: &[LockInfo]) -> Self {
        let details = locks
            .iter()
            .map(|lock| format!("  {}", lock.describe()))
            .collect::<Vec<_>>()
            .join("\n");
        Self::Locked {
            count: locks.len(),
            details,
        }
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidStackReference(message.into())
    }

    pub fn migration(stack: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Migration {
            stack: stack.into(),
            message: message.to_string(),
        }
    }

    /// True for a missing stack or blob
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::StackNotFound(_) => true,
            Self::Blob(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// True for duplicate names and held locks
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::StackAlreadyExists(_) | Self::DestinationExists(_) | Self::Locked { .. }
        )
    }
}

impl From<CheckpointError> for BackendError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::UnsupportedDeploymentVersion(version) => {
                Self::UnsupportedDeploymentVersion(version)
            }
            other => Self::InvalidCheckpoint(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Behaviour switches of a [`crate::FileStateBackend`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Write new checkpoints and history as `.json.gz`
    pub gzip: bool,
    /// Skip the `.bak` copies made before overwriting a checkpoint
    pub disable_checkpoint_backups: bool,
}

impl BackendOptions {
    /// Read options from the process environment
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).is_ok_and(|v| is_truthy(&v));
        Self {
            gzip: flag(GZIP_ENV_VAR),
            disable_checkpoint_backups: flag(DISABLE_BACKUPS_ENV_VAR),
        }
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }
}

/// `1` or `true` (any case)
pub fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_locked() {
        let lock = LockInfo::new("abc", "update");
        let error = BackendError::locked(std::slice::from_ref(&lock));

        match &error {
            BackendError::Locked { count, details } => {
                assert_eq!(*count, 1);
                assert!(details.contains(&lock.who));
                assert!(details.contains("update"));
            }
            _ => panic!("Expected Locked error"),
        }
        assert!(error.is_conflict());
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::StackNotFound("organization/proj/dev".to_string());
        assert_eq!(error.to_string(), "no stack named 'organization/proj/dev' found");
        assert!(error.is_not_found());

        let error = BackendError::ProjectMismatch {
            given: "other".to_string(),
            expected: "proj".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "provided project name \"other\" doesn't match Pulumi.yaml project name \"proj\""
        );

        let error = BackendError::SavingBackup(Box::new(BackendError::Io("disk full".to_string())));
        assert_eq!(error.to_string(), "saving backup: I/O error: disk full");
    }

    #[test]
    fn test_checkpoint_error_conversion() {
        let error: BackendError = CheckpointError::UnsupportedDeploymentVersion(9).into();
        assert!(matches!(error, BackendError::UnsupportedDeploymentVersion(9)));
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("TRUE"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("yes"));
        assert!(!is_truthy(""));
    }
}
