//! Common error types for the Apollo storage subsystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StorageError`].
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors returned by the storage subsystem.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    /// The driver's backing tool is missing or unusable.
    #[error("Storage driver '{driver}' is unavailable: {reason}")]
    #[diagnostic(code(apollo::storage::backend_unavailable))]
    BackendUnavailable {
        /// The driver that failed to initialize.
        driver: String,
        /// Why the driver cannot be used.
        reason: String,
    },

    /// A pool, volume or snapshot does not exist.
    #[error("{what} '{name}' not found")]
    #[diagnostic(code(apollo::storage::not_found))]
    NotFound {
        /// The kind of object ("storage pool", "storage volume", ...).
        what: String,
        /// The name that was looked up.
        name: String,
    },

    /// A create collided with an existing object.
    #[error("{what} '{name}' already exists")]
    #[diagnostic(code(apollo::storage::already_exists))]
    AlreadyExists {
        /// The kind of object.
        what: String,
        /// The colliding name.
        name: String,
    },

    /// Delete refused because other objects still depend on this one.
    #[error("{what} '{name}' is still in use by {used_by}")]
    #[diagnostic(
        code(apollo::storage::in_use),
        help("Delete the dependent objects first")
    )]
    InUse {
        /// The kind of object.
        what: String,
        /// The object that cannot be deleted.
        name: String,
        /// Human-readable description of the dependents.
        used_by: String,
    },

    /// A custom volume cannot be shifted because attached containers disagree.
    #[error("Idmap of container '{container}' does not match storage volume '{volume}'")]
    #[diagnostic(code(apollo::storage::idmap_conflict))]
    IdmapConflict {
        /// The volume that would have to be shifted.
        volume: String,
        /// The container whose idmap disagrees.
        container: String,
    },

    /// Quota requested on a backend without native quota support.
    #[error("Storage driver '{driver}' does not support quotas")]
    #[diagnostic(code(apollo::storage::quota_unsupported))]
    QuotaUnsupported {
        /// The driver lacking quota support.
        driver: String,
    },

    /// Copying volumes between different pools is not implemented.
    #[error("Copying between storage pools '{source_pool}' and '{target_pool}' is not supported")]
    #[diagnostic(code(apollo::storage::cross_pool_copy))]
    CrossPoolCopy {
        /// Pool the source volume lives on.
        source_pool: String,
        /// Pool the copy was requested on.
        target_pool: String,
    },

    /// An operation the driver does not implement.
    #[error("Operation not supported: {feature}")]
    #[diagnostic(code(apollo::storage::unsupported))]
    Unsupported {
        /// The unsupported operation.
        feature: String,
    },

    /// A helper process failed in a way that may succeed on retry.
    #[error("Command '{command}' failed: {message}")]
    #[diagnostic(code(apollo::storage::transient))]
    Transient {
        /// The command that failed.
        command: String,
        /// Captured output or error text.
        message: String,
    },

    /// On-disk state and metadata have diverged; operator intervention needed.
    #[error("Storage state for '{object}' is inconsistent: {message}")]
    #[diagnostic(
        code(apollo::storage::fatal),
        help("Automatic operations on this object are disabled until resolved")
    )]
    Fatal {
        /// The affected object.
        object: String,
        /// What diverged.
        message: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(apollo::storage::config))]
    Config {
        /// What was wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(apollo::storage::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(apollo::storage::serialization))]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Shorthand for a [`StorageError::NotFound`].
    pub fn not_found(what: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a [`StorageError::AlreadyExists`].
    pub fn already_exists(what: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            what: what.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a [`StorageError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True if this error means the object simply was not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_renders_object_kind() {
        let err = StorageError::not_found("storage pool", "p1");
        assert_eq!(err.to_string(), "storage pool 'p1' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> StorageResult<()> {
            let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
            Err(err.into())
        }
        assert!(matches!(fails(), Err(StorageError::Io(_))));
    }
}
