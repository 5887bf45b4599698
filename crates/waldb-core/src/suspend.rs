//! Cooperative suspension of writes.
//!
//! Hosts that are about to be frozen by the OS can suspend a database so it
//! stops acquiring write locks; WAL reads stay serviceable throughout. The
//! gate is advisory: an authorizer denies write-class operations at prepare
//! time while the flag is set, and the facades additionally interrupt the
//! writer so a statement already past prepare aborts too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::Connection;
use tracing::debug;

use crate::error::Error;

/// Shared suspended flag for one write-capable connection.
pub(crate) struct SuspensionState {
    suspended: AtomicBool,
}

impl SuspensionState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            suspended: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn suspend(&self) {
        debug!("database writes suspended");
        self.suspended.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        debug!("database writes resumed");
        self.suspended.store(false, Ordering::Release);
    }
}

/// Install the write gate on a freshly opened connection. Runs on the
/// connection's executor.
pub(crate) fn install_write_gate(conn: &Connection, state: Arc<SuspensionState>) {
    conn.authorizer(Some(move |ctx: AuthContext<'_>| {
        if !state.is_suspended() {
            return Authorization::Allow;
        }
        match ctx.action {
            AuthAction::Select
            | AuthAction::Read { .. }
            | AuthAction::Function { .. }
            | AuthAction::Pragma { .. }
            | AuthAction::Transaction { .. }
            | AuthAction::Savepoint { .. }
            | AuthAction::Recursive => Authorization::Allow,
            _ => Authorization::Deny,
        }
    }));
}

/// Normalize an engine abort caused by the write gate (or by the interrupt
/// delivered at suspension time) into `Error::Suspended`.
pub(crate) fn map_suspended(state: &SuspensionState, err: Error) -> Error {
    if state.is_suspended() && err.is_abort() {
        Error::Suspended
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gated_connection() -> (Connection, Arc<SuspensionState>) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER)").unwrap();
        let state = SuspensionState::new();
        install_write_gate(&conn, state.clone());
        (conn, state)
    }

    #[test]
    fn suspended_writes_are_denied() {
        let (conn, state) = gated_connection();

        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();

        state.suspend();
        let err = conn.execute("INSERT INTO t VALUES (2)", []).unwrap_err();
        let err = map_suspended(&state, Error::Sqlite(err));
        assert!(matches!(err, Error::Suspended));

        state.resume();
        conn.execute("INSERT INTO t VALUES (3)", []).unwrap();
    }

    #[test]
    fn suspended_reads_still_work() {
        let (conn, state) = gated_connection();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();

        state.suspend();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn unrelated_errors_pass_through() {
        let state = SuspensionState::new();
        state.suspend();
        let err = map_suspended(&state, Error::Cancelled);
        assert!(matches!(err, Error::Cancelled));
    }
}
