//! Error types for the page tree core library.

use thiserror::Error;

/// All errors that can occur within the page tree core library.
#[derive(Debug, Error)]
pub enum PageTreeError {
    /// The target path is already occupied by a published page.
    #[error("Path conflict: {0} already exists")]
    PathConflict(String),

    /// The operation is structurally forbidden for the given path
    /// (root, reserved subtree, trashed page, move into own subtree, ...).
    #[error("Invalid operation on {path}: {reason}")]
    InvalidOperation { path: String, reason: String },

    /// A page, operation or ancestor that the operation depends on is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The SQLite database is locked, busy or cannot be opened.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A cascade was cancelled between chunks; it can be resumed later.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A SQLite operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored JSON could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O operation on the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias that pins the error type to [`PageTreeError`].
pub type Result<T> = std::result::Result<T, PageTreeError>;

impl PageTreeError {
    pub(crate) fn invalid(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Re-classifies lock and open failures as [`PageTreeError::StoreUnavailable`].
    ///
    /// All other errors pass through untouched.
    #[must_use]
    pub fn classify(self) -> Self {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, msg))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                ) =>
            {
                Self::StoreUnavailable(msg.unwrap_or_else(|| err.to_string()))
            }
            other => other,
        }
    }

    /// Whether an idempotent read may be retried after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Returns a short, human-readable message suitable for display to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PathConflict(path) => format!("A page already exists at {path}"),
            Self::InvalidOperation { path, reason } => format!("Cannot modify {path}: {reason}"),
            Self::NotFound(_) => "Page no longer exists".to_string(),
            Self::StoreUnavailable(_) => "The page store is unavailable, try again later".to_string(),
            Self::Cancelled(_) => "The operation was interrupted and can be resumed".to_string(),
            Self::Database(e) => format!("Failed to save: {e}"),
            Self::Json(e) => format!("Data format error: {e}"),
            Self::Io(e) => format!("File error: {e}"),
        }
    }
}

/// Returns true when `err` is a unique/constraint violation reported by SQLite.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
