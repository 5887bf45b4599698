//! Per-executor registry of the connections that may legally be touched from
//! the current thread.
//!
//! Every serialized executor thread installs a watchdog listing its own
//! connection. Cross-connection `sync` calls temporarily push the caller's
//! allowed set onto the target executor for the dynamic extent of the body,
//! so helper code may legally call into another database during an access.
//! Violations are programmer errors and panic; they are never error values.
//!
//! Reentrancy is checked explicitly here instead of relying on a reentrant
//! mutex: executors submitted to from user threads could otherwise deadlock.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;

/// Stable identity of an engine connection. Compared by identity, never by
/// structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One allowed connection: identity plus a pointer usable on the thread whose
/// watchdog holds the entry.
#[derive(Clone)]
pub(crate) struct ConnEntry {
    pub(crate) id: ConnectionId,
    conn: NonNull<Connection>,
}

impl ConnEntry {
    /// # Safety contract (upheld by the executor, not checked here)
    ///
    /// `conn` must stay valid, and must not be touched from any other thread,
    /// for as long as this entry is registered with a watchdog.
    pub(crate) fn new(id: ConnectionId, conn: &Connection) -> Self {
        Self {
            id,
            conn: NonNull::from(conn),
        }
    }
}

struct Watchdog {
    allowed: Vec<ConnEntry>,
}

thread_local! {
    static CURRENT: RefCell<Option<Watchdog>> = const { RefCell::new(None) };
}

/// Install the watchdog for a freshly spawned executor thread, pre-populated
/// with that executor's own connection. Uninstalls on drop.
pub(crate) fn install(entry: ConnEntry) -> ExecutorGuard {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        debug_assert!(current.is_none(), "executor thread already has a watchdog");
        *current = Some(Watchdog {
            allowed: vec![entry],
        });
    });
    ExecutorGuard { _priv: () }
}

pub(crate) struct ExecutorGuard {
    _priv: (),
}

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Does the current thread's watchdog allow `id`?
pub(crate) fn current_allows(id: ConnectionId) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|w| w.allowed.iter().any(|e| e.id == id))
    })
}

/// Fatal error unless the current thread is allowed to touch `id`.
pub(crate) fn precondition_allowed(id: ConnectionId, label: &str) {
    if !current_allows(id) {
        panic!("connection `{label}` was used outside its serialized executor");
    }
}

/// Fatal error when the current thread already owns `id`: `sync` must not be
/// called from the connection's own executor.
pub(crate) fn precondition_not_reentrant(id: ConnectionId, label: &str) {
    if current_allows(id) {
        panic!(
            "sync access to connection `{label}` is not reentrant; \
             use a reentrant variant or restructure the access"
        );
    }
}

/// Snapshot of the calling thread's allowed set, taken by `sync` before
/// dispatching to another executor.
pub(crate) struct InheritedConns(Vec<ConnEntry>);

// The entries are only dereferenced on the target executor while every
// originating executor is blocked inside `sync` waiting for the body to
// finish, so each connection is still touched by at most one thread at a
// time.
unsafe impl Send for InheritedConns {}

/// The caller's allowed set, or `None` when the current thread is not a
/// database executor.
pub(crate) fn current_entries() -> Option<InheritedConns> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|w| InheritedConns(w.allowed.clone()))
    })
}

/// Push `inherited` onto the current executor's watchdog for the dynamic
/// extent of the returned guard.
pub(crate) fn inherit(inherited: InheritedConns) -> InheritGuard {
    let restore_len = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let watchdog = current
            .as_mut()
            .expect("allowed-connection inheritance outside an executor thread");
        let restore_len = watchdog.allowed.len();
        for entry in inherited.0 {
            // A connection already allowed here stays listed once.
            if !watchdog.allowed.iter().any(|have| have.id == entry.id) {
                watchdog.allowed.push(entry);
            }
        }
        restore_len
    });
    InheritGuard { restore_len }
}

pub(crate) struct InheritGuard {
    restore_len: usize,
}

impl Drop for InheritGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            if let Some(watchdog) = current.borrow_mut().as_mut() {
                watchdog.allowed.truncate(self.restore_len);
            }
        });
    }
}

/// Run `f` inline against `id`'s connection when the current watchdog allows
/// it. This is the reentrant fast path: no re-dispatch, no new executor
/// capacity.
pub(crate) fn with_allowed_connection<R>(
    id: ConnectionId,
    f: impl FnOnce(&Connection) -> R,
) -> Option<R> {
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let entry = borrowed
            .as_ref()
            .and_then(|w| w.allowed.iter().find(|e| e.id == id))
            .cloned();
        drop(borrowed);
        // The entry was registered by the executor currently pinning this
        // connection to this thread, so the pointer is valid and unaliased by
        // other threads for the duration of `f`.
        entry.map(|e| f(unsafe { e.conn.as_ref() }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry(conn: &Connection) -> ConnEntry {
        ConnEntry::new(ConnectionId::next(), conn)
    }

    #[test]
    fn install_allows_own_connection() {
        let conn = Connection::open_in_memory().unwrap();
        let entry = test_entry(&conn);
        let id = entry.id;

        assert!(!current_allows(id));
        {
            let _guard = install(entry);
            assert!(current_allows(id));
            precondition_allowed(id, "test");
        }
        assert!(!current_allows(id));
    }

    #[test]
    fn inheritance_is_scoped() {
        let own = Connection::open_in_memory().unwrap();
        let other = Connection::open_in_memory().unwrap();
        let own_entry = test_entry(&own);
        let other_entry = test_entry(&other);
        let other_id = other_entry.id;

        let _guard = install(own_entry);
        assert!(!current_allows(other_id));
        {
            let _inherit = inherit(InheritedConns(vec![other_entry]));
            assert!(current_allows(other_id));
        }
        assert!(!current_allows(other_id));
    }

    #[test]
    fn reentrant_access_runs_inline() {
        let conn = Connection::open_in_memory().unwrap();
        let entry = test_entry(&conn);
        let id = entry.id;

        let _guard = install(entry);
        let answer: i64 = with_allowed_connection(id, |conn| {
            conn.query_row("SELECT 41 + 1", [], |r| r.get(0)).unwrap()
        })
        .expect("connection should be allowed");
        assert_eq!(answer, 42);
    }

    #[test]
    fn unknown_connection_is_not_reentrant() {
        let conn = Connection::open_in_memory().unwrap();
        let entry = test_entry(&conn);

        let _guard = install(entry);
        let missing = ConnectionId::next();
        assert!(with_allowed_connection(missing, |_| ()).is_none());
        precondition_not_reentrant(missing, "elsewhere");
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn reentrancy_precondition_panics() {
        let conn = Connection::open_in_memory().unwrap();
        let entry = test_entry(&conn);
        let id = entry.id;

        let _guard = install(entry);
        precondition_not_reentrant(id, "test");
    }

    #[test]
    #[should_panic(expected = "outside its serialized executor")]
    fn wrong_thread_precondition_panics() {
        precondition_allowed(ConnectionId::next(), "test");
    }
}
