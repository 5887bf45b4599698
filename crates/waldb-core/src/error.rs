use rusqlite::ffi::ErrorCode;

/// All errors produced by waldb-core.
///
/// Programmer errors (reentrancy, wrong executor, leaked transactions) are
/// not represented here: they panic with a diagnostic instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cancelled database access. Surfaced by awaited accesses whose
    /// cancellation token fired, or whose future was dropped mid-flight.
    #[error("database access was cancelled")]
    Cancelled,

    /// A write aborted because the database is suspended.
    #[error("database is suspended")]
    Suspended,

    /// The engine cannot provide a required capability (e.g. WAL mode).
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The reader pool or connection was shut down.
    #[error("connection pool shut down")]
    PoolShutDown,

    /// The serialized executor behind a connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for engine errors raised by `sqlite3_interrupt` or by a denying
    /// authorizer, the two ways an in-flight statement gets aborted.
    pub(crate) fn is_abort(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::OperationInterrupted
                    | ErrorCode::OperationAborted
                    | ErrorCode::AuthorizationForStatementDenied
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_abort() {
        let err = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        ));
        assert!(err.is_abort());
    }

    #[test]
    fn plain_errors_are_not_abort() {
        assert!(!Error::Cancelled.is_abort());
        assert!(!Error::Sqlite(rusqlite::Error::InvalidQuery).is_abort());
    }
}
