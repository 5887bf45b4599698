//! Concurrency core for SQLite databases.
//!
//! waldb-core owns the engine connections and the threading rules around
//! them, so applications can read and write from many tasks without knowing
//! those rules:
//!
//! - [`DatabaseQueue`] serializes every access through a single connection.
//! - [`DatabasePool`] combines one serialized writer with a bounded pool of
//!   read-only connections on top of WAL mode: writes are totally ordered,
//!   reads run concurrently against consistent snapshots.
//! - [`SnapshotToken`] and [`Snapshot`] pin points in time so later reads
//!   observe exactly that state.
//! - Awaited accesses cancel cooperatively (engine-level interruption), and
//!   whole databases can be suspended while the host process is about to be
//!   frozen.
//!
//! Every connection is pinned to a dedicated serial executor; touching one
//! from the wrong executor, reentering `sync`, or leaking a transaction is a
//! programmer error and panics.
//!
//! ```no_run
//! use waldb_core::{Config, DatabasePool};
//!
//! # async fn demo() -> waldb_core::Result<()> {
//! let pool = DatabasePool::open("app.db", Config::default()).await?;
//! pool.write(|conn| {
//!     conn.execute_batch("CREATE TABLE IF NOT EXISTS t(v TEXT)")?;
//!     conn.execute("INSERT INTO t(v) VALUES (?1)", ["a"])?;
//!     Ok(())
//! })
//! .await?;
//! let n: i64 = pool
//!     .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
//!     .await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

mod cancel;
mod connection;
mod suspend;
mod watchdog;

pub mod access;
pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod snapshot;

pub use access::{DatabaseReader, DatabaseWriter};
pub use config::{BusyMode, Config, ConfigBuilder, PrepareHook, TransactionKind};
pub use connection::checkpoint::{CheckpointMode, CheckpointOutcome};
pub use error::{Error, Result};
pub use pool::{ConcurrentReadHandle, DatabasePool};
pub use queue::DatabaseQueue;
pub use snapshot::{SchemaCache, SchemaObservations, Snapshot, SnapshotToken};

// The connection type handed to access closures comes from rusqlite;
// re-export it so downstream crates need no version dance.
pub use rusqlite;

pub use tokio_util::sync::CancellationToken;
