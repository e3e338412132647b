use teamvault_types::errors::{Categorize, ErrorCategory};

/// Errors a [`crate::Repository`] implementation can raise.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The requested row does not exist (or is soft-deleted).
    #[error("not found")]
    NotFound,
    /// A unique constraint would be violated, or a version write lost its
    /// race after exhausting retries.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller supplied invalid input (e.g. an empty path).
    #[error("invalid input: {0}")]
    Validation(String),
    /// The backing store failed.
    #[error("repository backend error: {0}")]
    Backend(String),
}

impl Categorize for RepositoryError {
    fn category(&self) -> ErrorCategory {
        match self {
            RepositoryError::NotFound => ErrorCategory::NotFound,
            RepositoryError::Conflict(_) => ErrorCategory::Conflict,
            RepositoryError::Validation(_) => ErrorCategory::Validation,
            RepositoryError::Backend(_) => ErrorCategory::Backend,
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            RepositoryError::Conflict(err.to_string())
        } else {
            RepositoryError::Backend(err.to_string())
        }
    }
}

/// Whether `err` represents a unique-constraint violation, as opposed to a
/// generic backend failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}
