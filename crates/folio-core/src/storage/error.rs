//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions.
//!
//! Lookup misses are not errors: they surface as `Ok(None)` or an empty
//! list from the store.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A migration step failed to apply
    #[error("Migration to schema v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    /// Required tables or indexes are missing after migration
    #[error("Schema drift detected: missing {}", .missing.join(", "))]
    SchemaDrift { missing: Vec<String> },

    /// The database was written by a newer release
    #[error("Database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    /// The connection handle was invalidated and must be re-acquired
    #[error("Connection handle was invalidated; reopen the store")]
    Invalidated,

    /// Another opener changed the schema underneath this handle
    #[error("Schema changed by another connection (now v{found}); reopen the store")]
    VersionChanged { found: i32 },

    /// Activation requested for a version that does not exist
    #[error("Translation version {version} not found for chapter '{stable_id}'")]
    VersionNotFound { stable_id: String, version: i64 },

    /// No chapter, mapping or history is known for a URL or stable ID
    #[error("No chapter known for '{reference}'")]
    ChapterNotFound { reference: String },

    /// Import payload is not a session document this store understands
    #[error("Invalid session payload: {0}")]
    InvalidPayload(String),

    /// A required import section failed
    #[error("Import of section '{section}' failed: {source}")]
    ImportFailed {
        section: &'static str,
        #[source]
        source: Box<StorageError>,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    TaskJoin(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error raised while preparing a directory
    ///
    /// Classifies the error based on its kind.
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Whether the store cannot be used until the operator intervenes
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::SchemaDrift { .. }
                | StorageError::SchemaTooNew { .. }
                | StorageError::Migration { .. }
        )
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StorageError::Invalidated | StorageError::VersionChanged { .. } => true,
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions for the data directory.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::SchemaDrift { .. } => {
                Some("The database is missing required tables or indexes. Export what you can and restore into a fresh store.")
            }
            StorageError::SchemaTooNew { .. } => {
                Some("Upgrade folio to a release that understands this database.")
            }
            StorageError::Invalidated | StorageError::VersionChanged { .. } => {
                Some("Another process upgraded the store. Retry the operation to reopen it.")
            }
            _ => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_other_io_is_create_directory() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err = StorageError::from_io(io_err, PathBuf::from("/data"));
        assert!(matches!(err, StorageError::CreateDirectory { .. }));
    }

    #[test]
    fn test_schema_drift_display() {
        let err = StorageError::SchemaDrift {
            missing: vec![
                "index idx_versions_active".to_string(),
                "table chapter_summaries".to_string(),
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("idx_versions_active"));
        assert!(msg.contains("chapter_summaries"));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_invalidated_suggests_retry() {
        let err = StorageError::Invalidated;
        assert!(err.is_retryable());
        assert!(err.recovery_suggestion().unwrap().contains("Retry"));
    }

    #[test]
    fn test_import_failed_wraps_source() {
        let err = StorageError::ImportFailed {
            section: "chapters",
            source: Box::new(StorageError::InvalidPayload("not an array".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("chapters"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_chapter_not_found_names_reference() {
        let err = StorageError::ChapterNotFound {
            reference: "https://e.com/missing".to_string(),
        };
        assert!(err.to_string().contains("https://e.com/missing"));
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }
}
