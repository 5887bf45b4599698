use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;

/// WAL checkpoint flavor, matching the engine's `wal_checkpoint` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CheckpointMode {
    /// Copy what can be copied without waiting on anyone.
    Passive,
    /// Wait for writers, then copy the whole WAL.
    Full,
    /// Like `Full`, and additionally wait until readers move past the WAL.
    Restart,
    /// Like `Restart`, and truncate the WAL file afterwards.
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            Self::Full => "PRAGMA wal_checkpoint(FULL)",
            Self::Restart => "PRAGMA wal_checkpoint(RESTART)",
            Self::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }

    /// Modes that require readers to be past the WAL; these are downgraded
    /// while snapshot tokens are outstanding.
    pub(crate) fn blocks_on_readers(self) -> bool {
        matches!(self, Self::Restart | Self::Truncate)
    }
}

impl std::fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passive => write!(f, "passive"),
            Self::Full => write!(f, "full"),
            Self::Restart => write!(f, "restart"),
            Self::Truncate => write!(f, "truncate"),
        }
    }
}

/// Result of one checkpoint run, in WAL pages.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointOutcome {
    /// The checkpoint could not run to completion because of a concurrent
    /// reader or writer.
    pub busy: bool,
    pub wal_pages: i32,
    pub checkpointed_pages: i32,
}

/// Run `wal_checkpoint` on `conn`. Runs on the connection's executor.
pub(crate) fn run_checkpoint(conn: &Connection, mode: CheckpointMode) -> Result<CheckpointOutcome> {
    let outcome = conn.query_row(mode.as_sql(), [], |row| {
        let busy: i32 = row.get(0)?;
        Ok(CheckpointOutcome {
            busy: busy != 0,
            wal_pages: row.get(1)?,
            checkpointed_pages: row.get(2)?,
        })
    })?;

    if outcome.busy {
        warn!(
            %mode,
            wal_pages = outcome.wal_pages,
            checkpointed = outcome.checkpointed_pages,
            "checkpoint was busy"
        );
    } else {
        debug!(
            %mode,
            wal_pages = outcome.wal_pages,
            checkpointed = outcome.checkpointed_pages,
            "checkpoint complete"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::pragmas::{apply_pragmas, ConnectionRole};
    use tempfile::TempDir;

    #[test]
    fn truncate_resets_wal() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("test.db")).unwrap();
        apply_pragmas(&conn, ConnectionRole::Writer, &Config::default()).unwrap();

        conn.execute_batch("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1)")
            .unwrap();

        let outcome = run_checkpoint(&conn, CheckpointMode::Truncate).unwrap();
        assert!(!outcome.busy);
        assert_eq!(outcome.wal_pages, 0);

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn passive_reports_pages() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("test.db")).unwrap();
        apply_pragmas(&conn, ConnectionRole::Writer, &Config::default()).unwrap();

        conn.execute_batch("CREATE TABLE t(x INTEGER)").unwrap();
        let outcome = run_checkpoint(&conn, CheckpointMode::Passive).unwrap();
        assert!(outcome.checkpointed_pages >= 0);
    }
}
