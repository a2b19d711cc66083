use rollcall_core::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database value: {0}")]
    InvalidValue(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::InvalidValue(v) => StoreError::InvalidValue(v),
            DbError::Poisoned => StoreError::Poisoned,
            other => StoreError::Backend(other.to_string()),
        }
    }
}
