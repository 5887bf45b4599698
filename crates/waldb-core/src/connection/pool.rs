//! Bounded pool of serialized read-only connections.
//!
//! Connections are created lazily by a factory, handed out one at a time,
//! and returned on guard drop. A semaphore counts availability; a barrier
//! drains every permit to run exclusively of all readers.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::SerializedConnection;
use crate::error::{Error, Result};

type Factory = Box<dyn Fn(usize) -> Result<SerializedConnection> + Send + Sync>;

pub(crate) struct ReaderPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<SerializedConnection>>,
    semaphore: Arc<Semaphore>,
    factory: Factory,
    capacity: usize,
    /// Total connections ever opened; used to number executor threads.
    opened: AtomicUsize,
    /// Bumped by `clear`; guards from older generations are discarded on
    /// return instead of rejoining the pool.
    generation: AtomicU64,
}

impl ReaderPool {
    pub(crate) fn new(capacity: usize, factory: Factory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                semaphore: Arc::new(Semaphore::new(capacity)),
                factory,
                capacity,
                opened: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wait for a free slot, then hand out an idle connection or open a new
    /// one through the factory.
    pub(crate) async fn acquire(&self) -> Result<PooledReader> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolShutDown)?;

        let idle = self.inner.idle.lock().unwrap().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let index = self.inner.opened.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)(index)?
            }
        };

        Ok(PooledReader {
            conn: Some(conn),
            generation: self.inner.generation.load(Ordering::Acquire),
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Acquire every permit: no reader runs while the guard is held, and
    /// readers released earlier have fully returned.
    pub(crate) async fn barrier(&self) -> Result<BarrierGuard> {
        let permits = self
            .inner
            .semaphore
            .clone()
            .acquire_many_owned(self.inner.capacity as u32)
            .await
            .map_err(|_| Error::PoolShutDown)?;
        debug!("reader pool drained for barrier");
        Ok(BarrierGuard { _permits: permits })
    }

    /// Drop idle connections; connections currently in use are discarded
    /// when their guards return.
    pub(crate) fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.idle.lock().unwrap().clear();
    }

    /// Shut the pool down: pending and future acquisitions fail with
    /// [`Error::PoolShutDown`] and pooled connections are closed.
    pub(crate) fn close(&self) {
        self.inner.semaphore.close();
        self.clear();
    }

    #[cfg(test)]
    fn opened_count(&self) -> usize {
        self.inner.opened.load(Ordering::Relaxed)
    }
}

/// Exclusive hold on the whole reader pool.
pub(crate) struct BarrierGuard {
    _permits: OwnedSemaphorePermit,
}

/// A reader borrowed from the pool; returns on drop.
pub(crate) struct PooledReader {
    conn: Option<SerializedConnection>,
    generation: u64,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledReader {
    type Target = SerializedConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.generation == self.inner.generation.load(Ordering::Acquire) {
                self.inner.idle.lock().unwrap().push(conn);
            }
            // Stale generation: drop the connection here instead.
        }
    }
}
