//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be mapped back onto a domain type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<nimbus_core::Error> for DbError {
    fn from(err: nimbus_core::Error) -> Self {
        DbError::Decode(err.to_string())
    }
}

impl From<DbError> for nimbus_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => nimbus_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => nimbus_core::Error::Conflict(msg),
            other => nimbus_core::Error::Store(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
