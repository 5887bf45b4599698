use rusqlite::config::DbConfig;
use rusqlite::Connection;

use crate::config::{BusyMode, Config};
use crate::error::{Error, Result};

/// Role of a connection — determines which PRAGMAs to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionRole {
    /// The single write-capable connection of a `DatabasePool`. WAL mode.
    Writer,
    /// A pooled, pinning or snapshot read-only connection of a
    /// `DatabasePool`.
    Reader,
    /// The lone connection of a `DatabaseQueue`. Journal mode stays as the
    /// engine default.
    Single,
}

/// Apply all PRAGMAs for a freshly opened connection. Runs on the
/// connection's executor before any prepare hook.
pub(crate) fn apply_pragmas(conn: &Connection, role: ConnectionRole, config: &Config) -> Result<()> {
    if role == ConnectionRole::Writer {
        // WAL must be requested first; readers rely on it being in place.
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(Error::NotSupported(
                "write-ahead logging is not available for this database",
            ));
        }
        // WAL-safe durability default.
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }

    conn.pragma_update(None, "foreign_keys", if config.foreign_keys { "ON" } else { "OFF" })?;

    let _ = conn.set_db_config(
        DbConfig::SQLITE_DBCONFIG_DQS_DML,
        config.double_quoted_string_literals,
    )?;
    let _ = conn.set_db_config(
        DbConfig::SQLITE_DBCONFIG_DQS_DDL,
        config.double_quoted_string_literals,
    )?;

    let busy = match role {
        ConnectionRole::Reader => config.reader_busy_mode(),
        _ => config.busy_mode,
    };
    match busy {
        BusyMode::ImmediateError => conn.busy_timeout(std::time::Duration::ZERO)?,
        BusyMode::Timeout(duration) => conn.busy_timeout(duration)?,
        BusyMode::Callback(callback) => conn.busy_handler(Some(callback))?,
    }

    if role == ConnectionRole::Reader {
        conn.pragma_update(None, "query_only", "ON")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writer_pragmas() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("test.db")).unwrap();
        apply_pragmas(&conn, ConnectionRole::Writer, &Config::default()).unwrap();

        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |r| r.get(0))
            .unwrap();
        assert_eq!(mode, "wal");

        // 1 = NORMAL
        let sync: i64 = conn
            .pragma_query_value(None, "synchronous", |r| r.get(0))
            .unwrap();
        assert_eq!(sync, 1);

        let qo: i64 = conn
            .pragma_query_value(None, "query_only", |r| r.get(0))
            .unwrap();
        assert_eq!(qo, 0);
    }

    #[test]
    fn reader_pragmas() {
        let dir = TempDir::new().unwrap();
        // Writer first so the database is in WAL mode before a reader opens.
        let writer = Connection::open(dir.path().join("test.db")).unwrap();
        apply_pragmas(&writer, ConnectionRole::Writer, &Config::default()).unwrap();

        let reader = Connection::open(dir.path().join("test.db")).unwrap();
        apply_pragmas(&reader, ConnectionRole::Reader, &Config::default()).unwrap();

        let qo: i64 = reader
            .pragma_query_value(None, "query_only", |r| r.get(0))
            .unwrap();
        assert_eq!(qo, 1);
    }

    #[test]
    fn wal_unavailable_is_not_supported() {
        // An in-memory database reports journal_mode=memory.
        let conn = Connection::open_in_memory().unwrap();
        let err = apply_pragmas(&conn, ConnectionRole::Writer, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn single_role_keeps_default_journal() {
        let conn = Connection::open_in_memory().unwrap();
        let cfg = Config::builder().foreign_keys(false).build();
        apply_pragmas(&conn, ConnectionRole::Single, &cfg).unwrap();

        let fk: i64 = conn
            .pragma_query_value(None, "foreign_keys", |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 0);
    }
}
