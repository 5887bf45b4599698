//! Reader and writer capability traits implemented by the database façades.
//!
//! Code that only needs reads can take a [`DatabaseReader`]; code performing
//! mutations takes a [`DatabaseWriter`]. [`DatabaseQueue`] and
//! [`DatabasePool`] implement both; [`Snapshot`] is reader-only. The
//! connection handle passed to closures is valid only within the closure.

use rusqlite::Connection;
use tokio::sync::oneshot;

use crate::connection::checkpoint::{CheckpointMode, CheckpointOutcome};
use crate::error::Result;
use crate::pool::DatabasePool;
use crate::queue::DatabaseQueue;
use crate::snapshot::Snapshot;

/// Read access to a database.
#[allow(async_fn_in_trait)]
pub trait DatabaseReader: Send + Sync {
    /// Awaited read observing a single consistent view for the whole body.
    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Awaited read without a consistency guarantee across statements.
    async fn unsafe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Blocking read. Must not be called from an async context.
    fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Push-style read: the result is delivered through the returned channel
    /// once the access ran.
    fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;
}

/// Write access to a database, on top of read access.
#[allow(async_fn_in_trait)]
pub trait DatabaseWriter: DatabaseReader {
    /// Awaited write inside the configured transaction kind; rolls back and
    /// surfaces the original error on failure.
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Awaited writer access without a surrounding transaction.
    async fn write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Writer access guaranteed to run with no concurrent reader.
    async fn barrier_write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Run a WAL checkpoint.
    async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome>;
}

impl DatabaseReader for DatabaseQueue {
    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::read(self, f).await
    }

    // The single connection serializes everything, so there is no weaker
    // read to offer.
    async fn unsafe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::read(self, f).await
    }

    fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::read_blocking(self, f)
    }

    fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::spawn_read(self, f)
    }
}

impl DatabaseWriter for DatabaseQueue {
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::write(self, f).await
    }

    async fn write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::write_without_transaction(self, f).await
    }

    // Without a reader pool there is nothing to exclude.
    async fn barrier_write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabaseQueue::write_without_transaction(self, f).await
    }

    async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
        DatabaseQueue::checkpoint(self, mode).await
    }
}

impl DatabaseReader for DatabasePool {
    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::read(self, f).await
    }

    async fn unsafe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::unsafe_read(self, f).await
    }

    fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::read_blocking(self, f)
    }

    fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::spawn_read(self, f)
    }
}

impl DatabaseWriter for DatabasePool {
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::write(self, f).await
    }

    async fn write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::write_without_transaction(self, f).await
    }

    async fn barrier_write_without_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        DatabasePool::barrier_write_without_transaction(self, f).await
    }

    async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
        DatabasePool::checkpoint(self, mode).await
    }
}

impl DatabaseReader for Snapshot {
    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Snapshot::read(self, f).await
    }

    // Every snapshot read observes the same frozen state; there is no
    // weaker variant.
    async fn unsafe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Snapshot::read(self, f).await
    }

    fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Snapshot::read_blocking(self, f)
    }

    fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Snapshot::spawn_read(self, f)
    }
}
