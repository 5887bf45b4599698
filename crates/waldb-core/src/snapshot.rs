//! Point-in-time views of a WAL database.
//!
//! A [`SnapshotToken`] is a cheap, cloneable handle that pins the committed
//! state of the database at capture time: a dedicated read-only *pinner*
//! connection holds an open deferred transaction, which keeps the WAL
//! snapshot alive and blocks truncating checkpoints. A [`Snapshot`] is the
//! heavyweight variant: a whole serialized connection frozen on its creation
//! state until dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::SerializedConnection;
use crate::error::Result;

/// Forces the engine to actually acquire the read snapshot: a deferred
/// transaction pins nothing until its first real read.
const MATERIALIZE_SNAPSHOT_SQL: &str = "SELECT COUNT(*) FROM sqlite_schema";

/// Schema entries observed by readers, shared across snapshot tokens.
///
/// Readers work against a private seed and union what they learned back in
/// one merge when the access ends, so the lock is never taken per statement.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<String, String>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries.read().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    fn seed(&self) -> HashMap<String, String> {
        self.entries.read().unwrap().clone()
    }

    pub(crate) fn merge(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut guard = self.entries.write().unwrap();
        for (name, info) in entries {
            guard.entry(name).or_insert(info);
        }
    }
}

/// Per-access view of the schema cache handed to token reads. Lookups hit a
/// private seed; recordings are merged into the shared cache on release.
#[derive(Debug)]
pub struct SchemaObservations {
    seed: HashMap<String, String>,
    recorded: HashMap<String, String>,
}

impl SchemaObservations {
    fn seeded(cache: &SchemaCache) -> Self {
        Self {
            seed: cache.seed(),
            recorded: HashMap::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&String> {
        self.recorded.get(name).or_else(|| self.seed.get(name))
    }

    pub fn record(&mut self, name: impl Into<String>, info: impl Into<String>) {
        self.recorded.insert(name.into(), info.into());
    }
}

struct TokenInner {
    pinner: SerializedConnection,
    schema_version: i64,
    cache: Arc<SchemaCache>,
    live_tokens: Arc<AtomicUsize>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        // The pinner closes with this drop, releasing the pinned snapshot.
        self.live_tokens.fetch_sub(1, Ordering::AcqRel);
        debug!(label = self.pinner.label(), "snapshot token released");
    }
}

/// A cheap handle pinning the committed database state at capture time.
///
/// Cloning shares the pin; the snapshot is released when the last clone
/// drops. Obtain one with [`DatabasePool::current_snapshot_token`] and read
/// through [`DatabasePool::read_from`].
///
/// [`DatabasePool::current_snapshot_token`]: crate::DatabasePool::current_snapshot_token
/// [`DatabasePool::read_from`]: crate::DatabasePool::read_from
#[derive(Clone)]
pub struct SnapshotToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for SnapshotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotToken")
            .field("schema_version", &self.inner.schema_version)
            .finish_non_exhaustive()
    }
}

impl SnapshotToken {
    /// Begin the pinning transaction on a freshly opened read-only
    /// connection and capture the schema version.
    pub(crate) fn capture(
        pinner: SerializedConnection,
        cache: Arc<SchemaCache>,
        live_tokens: Arc<AtomicUsize>,
    ) -> Result<Self> {
        pinner.set_allows_unsafe_transactions(true);
        let schema_version = pinner.sync(|conn| -> Result<i64> {
            conn.execute_batch("BEGIN DEFERRED")?;
            conn.query_row(MATERIALIZE_SNAPSHOT_SQL, [], |_| Ok(()))?;
            Ok(conn.query_row("PRAGMA schema_version", [], |r| r.get(0))?)
        })?;
        live_tokens.fetch_add(1, Ordering::AcqRel);
        debug!(label = pinner.label(), schema_version, "snapshot token captured");
        Ok(Self {
            inner: Arc::new(TokenInner {
                pinner,
                schema_version,
                cache,
                live_tokens,
            }),
        })
    }

    /// Schema version of the database at capture time.
    pub fn schema_version(&self) -> i64 {
        self.inner.schema_version
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.inner.cache
    }

    /// Run `f` against the pinned state. The observations view merges back
    /// into the shared cache when `f` returns.
    pub(crate) async fn with_pinned<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut SchemaObservations) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.inner.cache.clone();
        self.inner
            .pinner
            .with(move |conn| {
                let mut observations = SchemaObservations::seeded(&cache);
                let out = f(conn, &mut observations);
                cache.merge(observations.recorded);
                out
            })
            .await
    }
}

/// A read-only connection frozen on the database state at creation time.
///
/// All reads observe that state until the snapshot drops; the underlying
/// transaction never commits.
pub struct Snapshot {
    conn: SerializedConnection,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("label", &self.conn.label())
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    pub(crate) fn create(conn: SerializedConnection) -> Result<Self> {
        conn.set_allows_unsafe_transactions(true);
        conn.sync(|conn| -> Result<()> {
            conn.execute_batch("BEGIN DEFERRED")?;
            conn.query_row(MATERIALIZE_SNAPSHOT_SQL, [], |_| Ok(()))?;
            Ok(())
        })?;
        debug!(label = conn.label(), "database snapshot created");
        Ok(Self { conn })
    }

    /// Awaited read against the frozen state.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.with(f).await
    }

    /// Blocking read against the frozen state.
    pub fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.sync(f)
    }

    /// Push-style read: schedule `f` and deliver its result when it ran.
    pub fn spawn_read<F, R>(&self, f: F) -> oneshot::Receiver<Result<R>>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.conn.spawn(move |conn| {
            let _ = tx.send(f(conn));
        });
        rx
    }

    pub fn label(&self) -> &str {
        self.conn.label()
    }
}
