//! Database error type.

use thiserror::Error;

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum DbError {
    /// Could not open or acquire a connection.
    #[error("database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    #[error("query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// A write hit a unique constraint. Callers that expect this (idempotent
    /// inserts) skip; everyone else treats it as fatal.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DbError::QueryFailed(e) => is_unique_violation(e),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::ConnectionFailed(err)
            }
            sqlx::Error::RowNotFound => DbError::NotFound("row not found".to_string()),
            other => DbError::QueryFailed(other),
        }
    }
}

/// True when `err` is a Postgres unique-key violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
        assert!(!err.is_constraint_violation());
    }

    #[test]
    fn pool_timeout_is_a_connection_error() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_connection_error());
        assert!(err.to_string().starts_with("database connection failed"));
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
