//! A single engine connection behind a dedicated serial executor.
//!
//! Each `rusqlite::Connection` is owned by one worker thread for its entire
//! lifetime; every statement on it runs from that thread, which is what the
//! engine's threading contract requires. Work arrives as boxed closures over
//! an mpsc channel and runs to completion in submission order.

pub(crate) mod checkpoint;
pub(crate) mod pool;
pub(crate) mod pragmas;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::cancel::{CancelBridge, CancelOnDrop};
use crate::config::{Config, TransactionKind};
use crate::error::{Error, Result};
use crate::suspend::{self, SuspensionState};
use crate::watchdog::{self, ConnEntry, ConnectionId};

pub(crate) use pragmas::ConnectionRole;

type Job = Box<dyn FnOnce(&Connection) + Send + 'static>;

/// Where to open the database file.
#[derive(Debug, Clone)]
pub(crate) enum OpenTarget {
    Path(PathBuf),
    Memory,
}

/// Everything the worker thread needs to establish its connection.
pub(crate) struct OpenParams {
    pub(crate) target: OpenTarget,
    pub(crate) role: ConnectionRole,
    pub(crate) config: Config,
    pub(crate) thread_name: String,
    pub(crate) label: Arc<str>,
}

struct ConnShared {
    id: ConnectionId,
    label: Arc<str>,
    path: Option<PathBuf>,
    interrupt: InterruptHandle,
    suspension: Arc<SuspensionState>,
    allows_unsafe_transactions: AtomicBool,
}

impl ConnShared {
    fn allows_unsafe(&self) -> bool {
        self.allows_unsafe_transactions.load(Ordering::Acquire)
    }
}

/// One engine connection pinned to one serial executor.
pub(crate) struct SerializedConnection {
    shared: Arc<ConnShared>,
    tx: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SerializedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedConnection")
            .field("label", &self.shared.label)
            .finish_non_exhaustive()
    }
}

impl SerializedConnection {
    /// Spawn the executor thread, open the connection on it, apply per-role
    /// PRAGMAs and run the prepare hooks in order. Any failure closes the
    /// connection and fails the open.
    pub(crate) fn open(params: OpenParams) -> Result<Self> {
        let id = ConnectionId::next();
        let label = params.label.clone();
        let path = match &params.target {
            OpenTarget::Path(p) => Some(p.clone()),
            OpenTarget::Memory => None,
        };
        let allows_unsafe = params.config.allows_unsafe_transactions;
        let suspension = SuspensionState::new();
        let worker_suspension = suspension.clone();

        let (ready_tx, ready_rx) = mpsc::channel();
        let (job_tx, job_rx) = mpsc::channel::<Job>();

        let thread = thread::Builder::new()
            .name(params.thread_name.clone())
            .spawn(move || {
                let conn = match establish(&params, &worker_suspension) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(conn.get_interrupt_handle())).is_err() {
                    return;
                }
                let _watchdog = watchdog::install(ConnEntry::new(id, &conn));
                for job in job_rx {
                    job(&conn);
                }
            })?;

        let interrupt = ready_rx.recv().map_err(|_| Error::ConnectionClosed)??;

        Ok(Self {
            shared: Arc::new(ConnShared {
                id,
                label,
                path,
                interrupt,
                suspension,
                allows_unsafe_transactions: AtomicBool::new(allows_unsafe),
            }),
            tx: Some(job_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.shared.label
    }

    pub(crate) fn path(&self) -> Option<&PathBuf> {
        self.shared.path.as_ref()
    }

    pub(crate) fn suspension(&self) -> &Arc<SuspensionState> {
        &self.shared.suspension
    }

    /// Run `f` on the owning executor and block until it returns.
    ///
    /// Not reentrant: calling this from the connection's own executor is a
    /// programmer error. When called from *another* database executor, that
    /// executor's allowed connections are inherited for the extent of `f`,
    /// so cross-database helper code stays legal.
    pub(crate) fn sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Connection) -> R + Send + 'static,
        R: Send + 'static,
    {
        watchdog::precondition_not_reentrant(self.shared.id, &self.shared.label);
        self.dispatch_sync(f)
    }

    /// Like [`sync`](Self::sync), but runs `f` inline without re-dispatch
    /// when the current executor already owns this connection. Used by
    /// destructors and nested snapshot flows.
    pub(crate) fn reentrant_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Connection) -> R + Send + 'static,
        R: Send + 'static,
    {
        if !watchdog::current_allows(self.shared.id) {
            return self.dispatch_sync(f);
        }
        let shared = self.shared.clone();
        let (out, leak) = watchdog::with_allowed_connection(self.shared.id, |conn| {
            let was_in_transaction = !conn.is_autocommit();
            let out = f(conn);
            // Already-open transactions were opened by an enclosing access
            // which will run its own check.
            let leak = if was_in_transaction {
                None
            } else {
                transaction_leak(conn, &shared)
            };
            (out, leak)
        })
        .expect("allowed connection vanished mid-access");
        if let Some(message) = leak {
            panic!("{message}");
        }
        out
    }

    fn dispatch_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Connection) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inherited = watchdog::current_entries();
        let shared = self.shared.clone();
        let (tx, rx) = mpsc::channel();
        self.submit(Box::new(move |conn| {
            let _inherit = inherited.map(watchdog::inherit);
            let out = f(conn);
            let leak = transaction_leak(conn, &shared);
            let _ = tx.send((out, leak));
        }))
        .unwrap_or_else(|_| self.executor_gone());
        let (out, leak) = rx.recv().unwrap_or_else(|_| self.executor_gone());
        if let Some(message) = leak {
            panic!("{message}");
        }
        out
    }

    /// Schedule `f` on the owning executor and return immediately.
    pub(crate) fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let shared = self.shared.clone();
        let _ = self.submit(Box::new(move |conn| {
            f(conn);
            if let Some(message) = transaction_leak(conn, &shared) {
                error!("{message}");
                panic!("{message}");
            }
        }));
    }

    /// Awaited access. Dropping the returned future, or cancelling `cancel`,
    /// interrupts the engine and surfaces [`Error::Cancelled`].
    pub(crate) async fn with<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch_async(None, f).await
    }

    /// [`with`](Self::with), wired to an external cancellation token.
    pub(crate) async fn with_cancellation<F, R>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch_async(Some(cancel), f).await
    }

    async fn dispatch_async<F, R>(&self, cancel: Option<&CancellationToken>, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        watchdog::precondition_not_reentrant(self.shared.id, &self.shared.label);
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let bridge = CancelBridge::new();
        let job_bridge = bridge.clone();
        let shared = self.shared.clone();
        let (done_tx, mut done_rx) = oneshot::channel::<(Result<R>, Option<String>)>();
        self.submit(Box::new(move |conn| {
            if !job_bridge.connect(conn.get_interrupt_handle()) {
                let _ = done_tx.send((Err(Error::Cancelled), None));
                return;
            }
            let out = f(conn);
            let leak = transaction_leak(conn, &shared);
            let out = if job_bridge.finish() {
                Err(Error::Cancelled)
            } else {
                out
            };
            let _ = done_tx.send((out, leak));
        }))
        .unwrap_or_else(|_| self.executor_gone());

        let mut guard = CancelOnDrop::new(bridge.clone());
        let received = match cancel {
            Some(token) => {
                let cancelled = token.cancelled();
                tokio::pin!(cancelled);
                let mut cancel_sent = false;
                loop {
                    tokio::select! {
                        biased;
                        received = &mut done_rx => break received,
                        _ = &mut cancelled, if !cancel_sent => {
                            bridge.cancel();
                            cancel_sent = true;
                        }
                    }
                }
            }
            None => (&mut done_rx).await,
        };
        guard.disarm();

        match received {
            Ok((out, leak)) => {
                if let Some(message) = leak {
                    panic!("{message}");
                }
                out
            }
            // The job vanished: a programmer-error panic killed the
            // executor. Propagate the crash instead of inventing an error.
            Err(_) => self.executor_gone(),
        }
    }

    /// Scoped override of the unsafe-transaction allowance for nested
    /// accesses on this connection.
    pub(crate) fn allowing_unsafe_transactions<R>(&self, allow: bool, f: impl FnOnce() -> R) -> R {
        let previous = self
            .shared
            .allows_unsafe_transactions
            .swap(allow, Ordering::AcqRel);
        let _restore = RestoreAllowance {
            shared: self.shared.clone(),
            previous,
        };
        f()
    }

    /// Permanently mark this connection as allowed to hold a long-lived
    /// transaction (snapshot connections).
    pub(crate) fn set_allows_unsafe_transactions(&self, allow: bool) {
        self.shared
            .allows_unsafe_transactions
            .store(allow, Ordering::Release);
    }

    /// Abort the currently running statement, if any. Safe from any thread.
    pub(crate) fn interrupt(&self) {
        self.shared.interrupt.interrupt();
    }

    /// Suspend writes on this connection and abort an in-flight statement.
    /// Safe from any thread.
    pub(crate) fn suspend(&self) {
        self.shared.suspension.suspend();
        self.interrupt();
    }

    /// Safe from any thread.
    pub(crate) fn resume(&self) {
        self.shared.suspension.resume();
    }

    fn submit(&self, job: Job) -> std::result::Result<(), mpsc::SendError<Job>> {
        self.tx
            .as_ref()
            .expect("job channel taken before drop")
            .send(job)
    }

    fn executor_gone(&self) -> ! {
        panic!(
            "serialized executor for connection `{}` crashed",
            self.shared.label
        )
    }
}

impl Drop for SerializedConnection {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued jobs and exit;
        // dropping the connection there rolls back any open transaction.
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

struct RestoreAllowance {
    shared: Arc<ConnShared>,
    previous: bool,
}

impl Drop for RestoreAllowance {
    fn drop(&mut self) {
        self.shared
            .allows_unsafe_transactions
            .store(self.previous, Ordering::Release);
    }
}

fn establish(params: &OpenParams, suspension: &Arc<SuspensionState>) -> Result<Connection> {
    let read_only = params.config.read_only || params.role == ConnectionRole::Reader;
    // Multi-thread engine mode: the executor already serializes access, so
    // the engine's own statement mutex would be redundant.
    let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
    if read_only {
        flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
    } else {
        flags |= OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    }

    let conn = match &params.target {
        OpenTarget::Path(path) => Connection::open_with_flags(path, flags)?,
        OpenTarget::Memory => Connection::open_in_memory_with_flags(flags)?,
    };

    pragmas::apply_pragmas(&conn, params.role, &params.config)?;

    if params.config.observes_suspension && !read_only {
        suspend::install_write_gate(&conn, suspension.clone());
    }

    for hook in &params.config.prepare_hooks {
        hook(&conn)?;
    }

    Ok(conn)
}

fn transaction_leak(conn: &Connection, shared: &ConnShared) -> Option<String> {
    if conn.is_autocommit() || shared.allows_unsafe() {
        return None;
    }
    // Roll back so the connection stays usable for whoever catches the
    // panic; the access that leaked is beyond saving either way.
    let _ = conn.execute_batch("ROLLBACK");
    Some(format!(
        "connection `{}` left a transaction open at the end of a database access; \
         wrap the access in allowing_unsafe_transactions or end the transaction",
        shared.label
    ))
}

/// Run `f` inside a `BEGIN <kind>` … `COMMIT` pair, rolling back (and
/// surfacing the original error) when `f` fails.
pub(crate) fn run_in_transaction<R>(
    conn: &Connection,
    kind: TransactionKind,
    f: impl FnOnce(&Connection) -> Result<R>,
) -> Result<R> {
    conn.execute_batch(kind.begin_sql())?;
    match f(conn) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(err) => {
                rollback_if_open(conn);
                Err(err.into())
            }
        },
        Err(err) => {
            rollback_if_open(conn);
            Err(err)
        }
    }
}

pub(crate) fn rollback_if_open(conn: &Connection) {
    if !conn.is_autocommit() {
        let _ = conn.execute_batch("ROLLBACK");
    }
}
