//! Single-connection database façade.
//!
//! One serialized connection serves every read and write, which makes
//! isolation trivial: a read observes whatever the previous committed write
//! left behind. This is the simplest way to use a database; [`DatabasePool`]
//! adds concurrent readers on top of WAL mode.
//!
//! [`DatabasePool`]: crate::DatabasePool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, TransactionKind};
use crate::connection::checkpoint::{run_checkpoint, CheckpointMode, CheckpointOutcome};
use crate::connection::{
    run_in_transaction, ConnectionRole, OpenParams, OpenTarget, SerializedConnection,
};
use crate::error::Result;
use crate::suspend;

/// A database accessed through a single serialized connection.
#[derive(Clone, Debug)]
pub struct DatabaseQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    conn: SerializedConnection,
    config: Config,
}

impl DatabaseQueue {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let label = queue_label(&config, Some(path.as_path()));
        Self::open_target(OpenTarget::Path(path), config, label)
    }

    /// Open a private in-memory database. Useful for tests and caches.
    pub async fn in_memory(config: Config) -> Result<Self> {
        let label = queue_label(&config, None);
        Self::open_target(OpenTarget::Memory, config, label)
    }

    fn open_target(target: OpenTarget, config: Config, label: Arc<str>) -> Result<Self> {
        let conn = SerializedConnection::open(OpenParams {
            target,
            role: ConnectionRole::Single,
            config: config.clone(),
            thread_name: label.to_string(),
            label,
        })?;
        info!(label = conn.label(), "database queue opened");
        Ok(Self {
            inner: Arc::new(QueueInner { conn, config }),
        })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.inner.conn.path()
    }

    pub fn label(&self) -> &str {
        self.inner.conn.label()
    }

    /// Awaited read access. Isolation is implicit: the single connection
    /// serializes every access.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.map_suspended(self.inner.conn.with(f).await)
    }

    /// Blocking read access. Must not be called from an async context.
    pub fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.map_suspended(self.inner.conn.sync(f))
    }

    /// Awaited write access wrapped in the configured transaction kind.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.in_transaction(self.inner.config.transaction_kind, f)
            .await
    }

    /// Blocking variant of [`write`](Self::write).
    pub fn write_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let kind = self.inner.config.transaction_kind;
        self.map_suspended(
            self.inner
                .conn
                .sync(move |conn| run_in_transaction(conn, kind, f)),
        )
    }

    /// Awaited write access without a surrounding transaction.
    pub async fn write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.map_suspended(self.inner.conn.with(f).await)
    }

    /// Awaited access inside a `BEGIN <kind>` … `COMMIT` pair; rolls back and
    /// surfaces the original error when `f` fails.
    pub async fn in_transaction<F, R>(&self, kind: TransactionKind, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.map_suspended(
            self.inner
                .conn
                .with(move |conn| run_in_transaction(conn, kind, f))
                .await,
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
        let kind = self.inner.config.transaction_kind;
        self.map_suspended(
            self.inner
                .conn
                .with_cancellation(cancel, move |conn| run_in_transaction(conn, kind, f))
                .await,
        )
    }

    /// Blocking write that runs inline when already on the owning executor.
    /// Used from destructors and nested flows; regular code wants
    /// [`write_blocking`](Self::write_blocking).
    pub fn reentrant_write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.map_suspended(self.inner.conn.reentrant_sync(f))
    }

    /// Push-style read: schedule `f` and deliver its result through the
    /// returned channel once it ran.
    pub fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.conn.spawn(move |conn| {
            let _ = tx.send(f(conn));
        });
        rx
    }

    /// Scoped override of the unsafe-transaction allowance.
    pub fn allowing_unsafe_transactions<R>(&self, allow: bool, f: impl FnOnce() -> R) -> R {
        self.inner.conn.allowing_unsafe_transactions(allow, f)
    }

    /// Run a WAL checkpoint. A no-op report on non-WAL databases.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
        self.inner
            .conn
            .with(move |conn| run_checkpoint(conn, mode))
            .await
    }

    /// Abort the statement currently running, if any. Safe from any thread.
    pub fn interrupt(&self) {
        self.inner.conn.interrupt();
    }

    /// Suspend writes until [`resume`](Self::resume). Requires
    /// `observes_suspension` in the configuration.
    pub fn suspend(&self) {
        if !self.inner.config.observes_suspension {
            debug!("suspend ignored: configuration does not observe suspension");
            return;
        }
        self.inner.conn.suspend();
    }

    pub fn resume(&self) {
        if !self.inner.config.observes_suspension {
            return;
        }
        self.inner.conn.resume();
    }

    fn map_suspended<R>(&self, result: Result<R>) -> Result<R> {
        result.map_err(|err| suspend::map_suspended(self.inner.conn.suspension(), err))
    }
}

fn queue_label(config: &Config, path: Option<&Path>) -> Arc<str> {
    if let Some(label) = &config.label {
        return Arc::from(label.as_str());
    }
    let stem = path
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .unwrap_or("memory");
    Arc::from(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    async fn test_queue() -> (DatabaseQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = DatabaseQueue::open(dir.path().join("test.db"), Config::default())
            .await
            .unwrap();
        queue
            .write(|conn| {
                conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")?;
                Ok(())
            })
            .await
            .unwrap();
        (queue, dir)
    }

    #[tokio::test]
    async fn write_then_read() {
        let (queue, _dir) = test_queue().await;

        queue
            .write(|conn| {
                conn.execute("INSERT INTO t VALUES (1, 'a')", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let rows: Vec<(i64, String)> = queue
            .read(|conn| {
                let mut stmt = conn.prepare("SELECT id, v FROM t ORDER BY id")?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(rows, vec![(1, "a".to_string())]);
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let (queue, _dir) = test_queue().await;

        let result: Result<()> = queue
            .write(|conn| {
                conn.execute("INSERT INTO t VALUES (1, 'a')", [])?;
                Err(Error::NotSupported("boom"))
            })
            .await;
        assert!(result.is_err());

        let n: i64 = queue
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn reentrant_write_from_inside_a_write() {
        let (queue, _dir) = test_queue().await;
        let nested = queue.clone();

        queue
            .write_without_transaction(move |conn| {
                conn.execute("INSERT INTO t VALUES (1, 'outer')", [])?;
                nested.reentrant_write(|conn| {
                    conn.execute("INSERT INTO t VALUES (2, 'inner')", [])?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let n: i64 = queue
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn in_memory_database() {
        let queue = DatabaseQueue::in_memory(Config::default()).await.unwrap();
        let value: i64 = queue
            .read(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert!(queue.path().is_none());
    }

    #[tokio::test]
    async fn spawn_read_delivers_result() {
        let (queue, _dir) = test_queue().await;
        let rx = queue.spawn_read(|conn| Ok(conn.query_row("SELECT 9", [], |r| r.get::<_, i64>(0))?));
        assert_eq!(rx.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn suspended_queue_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder().observes_suspension(true).build();
        let queue = DatabaseQueue::open(dir.path().join("test.db"), config)
            .await
            .unwrap();
        queue
            .write(|conn| {
                conn.execute_batch("CREATE TABLE t(x INTEGER)")?;
                Ok(())
            })
            .await
            .unwrap();

        queue.suspend();
        let result: Result<()> = queue
            .write(|conn| {
                conn.execute("INSERT INTO t VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Suspended)));

        queue.resume();
        queue
            .write(|conn| {
                conn.execute("INSERT INTO t VALUES (2)", [])?;
                Ok(())
            })
            .await
            .unwrap();
    }
}
