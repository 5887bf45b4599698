//! WAL-mode database façade: one serialized writer, a pool of concurrent
//! readers.
//!
//! All mutations funnel through the writer connection and are therefore
//! totally ordered. Readers run on their own executors against consistent
//! WAL snapshots, truly concurrent with the writer and with each other.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, TransactionKind};
use crate::connection::checkpoint::{run_checkpoint, CheckpointMode, CheckpointOutcome};
use crate::connection::pool::{PooledReader, ReaderPool};
use crate::connection::{
    rollback_if_open, run_in_transaction, ConnectionRole, OpenParams, OpenTarget,
    SerializedConnection,
};
use crate::error::{Error, Result};
use crate::snapshot::{SchemaCache, SchemaObservations, Snapshot, SnapshotToken};
use crate::suspend;
use crate::watchdog;

/// A database accessed through one writer connection and a bounded pool of
/// read-only connections, in WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    writer: SerializedConnection,
    readers: ReaderPool,
    config: Config,
    path: PathBuf,
    label: Arc<str>,
    runtime: Handle,
    schema_cache: Arc<SchemaCache>,
    live_tokens: Arc<AtomicUsize>,
    /// Numbers dedicated snapshot and pinner connections.
    snapshot_seq: AtomicUsize,
    closed: AtomicBool,
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("path", &self.inner.path)
            .field("label", &self.inner.label)
            .field("max_readers", &self.inner.readers.capacity())
            .finish_non_exhaustive()
    }
}

impl DatabasePool {
    /// Open (creating if missing) the database at `path` and switch it to
    /// WAL mode. Fails with [`Error::NotSupported`] when the engine cannot
    /// provide WAL there.
    pub async fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let label: Arc<str> = match &config.label {
            Some(label) => Arc::from(label.as_str()),
            None => Arc::from(
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("db"),
            ),
        };

        let writer = SerializedConnection::open(OpenParams {
            target: OpenTarget::Path(path.clone()),
            role: ConnectionRole::Writer,
            config: config.clone(),
            thread_name: format!("{label}-writer"),
            label: Arc::from(format!("{label}-writer")),
        })?;

        // Readers open lazily, on first use.
        let readers = ReaderPool::new(config.max_readers, {
            let path = path.clone();
            let config = config.clone();
            let label = label.clone();
            Box::new(move |index| {
                SerializedConnection::open(OpenParams {
                    target: OpenTarget::Path(path.clone()),
                    role: ConnectionRole::Reader,
                    config: config.clone(),
                    thread_name: format!("{label}-reader-{index}"),
                    label: Arc::from(format!("{label}-reader-{index}")),
                })
            })
        });

        info!(
            path = %path.display(),
            label = %label,
            max_readers = config.max_readers,
            "database pool opened"
        );

        Ok(Self {
            inner: Arc::new(PoolShared {
                writer,
                readers,
                config,
                path,
                label,
                runtime: Handle::current(),
                schema_cache: Arc::new(SchemaCache::new()),
                live_tokens: Arc::new(AtomicUsize::new(0)),
                snapshot_seq: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Awaited read inside a deferred transaction: the whole body observes a
    /// single WAL snapshot. Errors roll the transaction back.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let reader = self.inner.readers.acquire().await?;
        reader
            .with(move |conn| run_in_transaction(conn, TransactionKind::Deferred, f))
            .await
    }

    /// Awaited read without a surrounding transaction: statements may
    /// straddle WAL snapshots.
    pub async fn unsafe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let reader = self.inner.readers.acquire().await?;
        reader.with(f).await
    }

    /// Blocking variant of [`read`](Self::read). Must not be called from an
    /// async context.
    pub fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.runtime.block_on(self.read(f))
    }

    /// Push-style read: acquire a reader in the background and deliver the
    /// result through the returned channel.
    pub fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(pool.read(f).await);
        });
        rx
    }

    /// Awaited write inside the configured transaction kind. Rolls back and
    /// surfaces the original error when `f` fails.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.in_transaction(self.inner.config.transaction_kind, f)
            .await
    }

    /// Awaited access inside a `BEGIN <kind>` … `COMMIT` pair.
    pub async fn in_transaction<F, R>(&self, kind: TransactionKind, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.check_open()?;
        self.map_suspended(
            self.inner
                .writer
                .with(move |conn| run_in_transaction(conn, kind, f))
                .await,
        )
    }

    /// Blocking variant of [`write`](Self::write). Must not be called from
    /// an async context.
    pub fn write_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.check_open()?;
        let kind = self.inner.config.transaction_kind;
        self.map_suspended(
            self.inner
                .writer
                .sync(move |conn| run_in_transaction(conn, kind, f)),
        )
    }

    /// Awaited write whose cancellation token interrupts the engine.
    pub async fn write_with_cancellation<F, R>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.check_open()?;
        let kind = self.inner.config.transaction_kind;
        self.map_suspended(
            self.inner
                .writer
                .with_cancellation(cancel, move |conn| run_in_transaction(conn, kind, f))
                .await,
        )
    }

    /// Awaited writer access without a surrounding transaction.
    pub async fn write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.check_open()?;
        self.map_suspended(self.inner.writer.with(f).await)
    }

    /// Writer access that runs with the reader pool drained: no reader runs
    /// concurrently, reads started afterwards observe the completed `f`.
    /// For destructive schema operations and WAL truncation.
    pub async fn barrier_write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.check_open()?;
        let _barrier = self.inner.readers.barrier().await?;
        self.map_suspended(self.inner.writer.with(f).await)
    }

    /// From *inside* a write access, dispatch a read that observes the
    /// database as of now — before the enclosing transaction commits.
    ///
    /// The reader's snapshot is established before this returns, so the
    /// writer may go on mutating and committing without affecting it. The
    /// result is collected through the returned handle.
    ///
    /// # Panics
    ///
    /// Outside a write access (the writer executor is the only legal
    /// caller), or when the writer has no open transaction — the pre-commit
    /// state would be meaningless.
    pub fn concurrent_read<F, R>(&self, f: F) -> ConcurrentReadHandle<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        watchdog::precondition_allowed(self.inner.writer.id(), self.inner.writer.label());
        let in_transaction =
            watchdog::with_allowed_connection(self.inner.writer.id(), |conn| !conn.is_autocommit())
                .unwrap_or(false);
        if !in_transaction {
            panic!("concurrent_read requires an open writer transaction");
        }

        let (tx, rx) = oneshot::channel();

        let reader = match self.inner.runtime.block_on(self.inner.readers.acquire()) {
            Ok(reader) => reader,
            Err(err) => {
                let _ = tx.send(Err(err));
                return ConcurrentReadHandle { rx, _reader: None };
            }
        };

        // Pin the pre-commit snapshot before handing control back to the
        // writer; the deferred transaction materializes on its first read.
        let began = reader.allowing_unsafe_transactions(true, || {
            reader.sync(|conn| -> Result<()> {
                conn.execute_batch("BEGIN DEFERRED")?;
                conn.query_row("SELECT COUNT(*) FROM sqlite_schema", [], |_| Ok(()))?;
                Ok(())
            })
        });
        if let Err(err) = began {
            reader.spawn(rollback_if_open);
            let _ = tx.send(Err(err));
            return ConcurrentReadHandle {
                rx,
                _reader: Some(reader),
            };
        }

        reader.spawn(move |conn| {
            let out = f(conn);
            // End the read transaction whatever the body did.
            if conn.execute_batch("COMMIT").is_err() {
                rollback_if_open(conn);
            }
            let _ = tx.send(out);
        });

        ConcurrentReadHandle {
            rx,
            _reader: Some(reader),
        }
    }

    /// Run a WAL checkpoint on the writer. Truncating kinds drain the reader
    /// pool first, and are downgraded to passive while snapshot tokens are
    /// outstanding.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
        self.check_open()?;
        let mode = if mode.blocks_on_readers() && self.snapshot_token_count() > 0 {
            debug!(%mode, "checkpoint downgraded to passive: snapshot tokens outstanding");
            CheckpointMode::Passive
        } else {
            mode
        };

        let run = move |conn: &Connection| run_checkpoint(conn, mode);
        if mode.blocks_on_readers() {
            let _barrier = self.inner.readers.barrier().await?;
            self.inner.writer.with(run).await
        } else {
            self.inner.writer.with(run).await
        }
    }

    /// Capture a token pinning the current committed state.
    ///
    /// # Panics
    ///
    /// When called from inside an open writer transaction: the half-written
    /// state has no meaningful snapshot.
    pub fn current_snapshot_token(&self) -> Result<SnapshotToken> {
        let in_writer_transaction =
            watchdog::with_allowed_connection(self.inner.writer.id(), |conn| !conn.is_autocommit())
                .unwrap_or(false);
        if in_writer_transaction {
            panic!("current_snapshot_token must not be called from within a writer transaction");
        }
        self.check_open()?;
        let pinner = self.open_dedicated_reader("pinner")?;
        SnapshotToken::capture(
            pinner,
            self.inner.schema_cache.clone(),
            self.inner.live_tokens.clone(),
        )
    }

    /// Read against the state pinned by `token`, regardless of writes since
    /// its capture. The observations view merges into the shared schema
    /// cache when the access ends.
    pub async fn read_from<F, R>(&self, token: &SnapshotToken, f: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut SchemaObservations) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        token.with_pinned(f).await
    }

    /// Number of snapshot tokens currently alive. While non-zero, truncating
    /// checkpoints are downgraded.
    pub fn snapshot_token_count(&self) -> usize {
        self.inner.live_tokens.load(Ordering::Acquire)
    }

    /// Freeze a dedicated read-only connection on the current committed
    /// state. Heavier than a token, but with its own executor.
    pub fn make_snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        Snapshot::create(self.open_dedicated_reader("snapshot")?)
    }

    /// Scoped override of the writer's unsafe-transaction allowance.
    pub fn allowing_unsafe_transactions<R>(&self, allow: bool, f: impl FnOnce() -> R) -> R {
        self.inner.writer.allowing_unsafe_transactions(allow, f)
    }

    /// Discard pooled reader connections; ones currently in use are
    /// discarded when they return.
    pub fn invalidate_read_only_connections(&self) {
        self.inner.readers.clear();
    }

    /// Abort the writer's running statement, if any. Safe from any thread.
    pub fn interrupt(&self) {
        self.inner.writer.interrupt();
    }

    /// Suspend writes until [`resume`](Self::resume). Requires
    /// `observes_suspension` in the configuration; reads stay serviceable.
    pub fn suspend(&self) {
        if !self.inner.config.observes_suspension {
            debug!("suspend ignored: configuration does not observe suspension");
            return;
        }
        self.inner.writer.suspend();
    }

    pub fn resume(&self) {
        if !self.inner.config.observes_suspension {
            return;
        }
        self.inner.writer.resume();
    }

    /// Shut the pool down: drain and close the readers, fail subsequent
    /// accesses with [`Error::PoolShutDown`].
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        // Wait for outstanding readers before closing the pool down.
        let barrier = self.inner.readers.barrier().await;
        self.inner.readers.close();
        drop(barrier);
        info!(path = %self.inner.path.display(), "database pool closed");
        Ok(())
    }

    fn open_dedicated_reader(&self, purpose: &str) -> Result<SerializedConnection> {
        let index = self.inner.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}-{purpose}-{index}", self.inner.label);
        SerializedConnection::open(OpenParams {
            target: OpenTarget::Path(self.inner.path.clone()),
            role: ConnectionRole::Reader,
            config: self.inner.config.clone(),
            thread_name: label.clone(),
            label: Arc::from(label),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolShutDown);
        }
        Ok(())
    }

    fn map_suspended<R>(&self, result: Result<R>) -> Result<R> {
        result.map_err(|err| suspend::map_suspended(self.inner.writer.suspension(), err))
    }
}

/// Pending result of a [`DatabasePool::concurrent_read`]. Holds the reader
/// slot until joined or dropped.
pub struct ConcurrentReadHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
    _reader: Option<PooledReader>,
}

impl<R> ConcurrentReadHandle<R> {
    /// Await the read's result.
    pub async fn join(self) -> Result<R> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Blocking variant of [`join`](Self::join). Must not be called from an
    /// async context.
    pub fn join_blocking(self) -> Result<R> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

impl<R> std::fmt::Debug for ConcurrentReadHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentReadHandle").finish_non_exhaustive()
    }
}
