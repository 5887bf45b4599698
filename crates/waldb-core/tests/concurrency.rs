//! End-to-end concurrency behavior of the writer/reader pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use waldb_core::{CheckpointMode, Config, DatabasePool, Error};

async fn seeded_pool(dir: &TempDir, config: Config) -> DatabasePool {
    let pool = DatabasePool::open(dir.path().join("test.db"), config)
        .await
        .unwrap();
    pool.write(|conn| {
        conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")?;
        conn.execute("INSERT INTO t VALUES (1, 'a')", [])?;
        Ok(())
    })
    .await
    .unwrap();
    pool
}

async fn count(pool: &DatabasePool) -> i64 {
    pool.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn read_observes_committed_write() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let rows: Vec<(i64, String)> = pool
        .read(|conn| {
            let mut stmt = conn.prepare("SELECT id, v FROM t ORDER BY id")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .unwrap();
    assert_eq!(rows, vec![(1, "a".to_string())]);
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_pool_enforces_strict_concurrency_bound() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder().max_readers(2).build();
    let pool = seeded_pool(&dir, config).await;

    const SLEEP: Duration = Duration::from_millis(150);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            pool.unsafe_read(move |conn| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(SLEEP);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get::<_, i64>(0))?)
            })
            .await
            .unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 1);
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "third reader must wait");
    assert!(
        started.elapsed() >= SLEEP + SLEEP / 2,
        "three readers at bound 2 cannot all overlap"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_read_sees_pre_commit_snapshot() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let inner = pool.clone();
    let handle = pool
        .write(move |conn| {
            conn.execute("INSERT INTO t VALUES (2, 'b')", [])?;
            Ok(inner.concurrent_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get::<_, i64>(0))?)
            }))
        })
        .await
        .unwrap();

    assert_eq!(handle.join().await.unwrap(), 1, "uncommitted row invisible");
    assert_eq!(count(&pool).await, 2, "committed row visible afterwards");
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_token_pins_state_across_writes() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;
    pool.write(|conn| {
        conn.execute("INSERT INTO t VALUES (2, 'b')", [])?;
        Ok(())
    })
    .await
    .unwrap();

    let token = pool.current_snapshot_token().unwrap();

    pool.write(|conn| {
        conn.execute("INSERT INTO t VALUES (3, 'c')", [])?;
        Ok(())
    })
    .await
    .unwrap();

    let pinned: i64 = pool
        .read_from(&token, |conn, _schema| {
            Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert_eq!(pinned, 2, "token read ignores later writes");
    assert_eq!(count(&pool).await, 3, "fresh read observes them");

    // The pinned view holds for repeated reads on the same token.
    let clone = token.clone();
    let pinned_again: i64 = pool
        .read_from(&clone, |conn, _schema| {
            Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert_eq!(pinned_again, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn heavy_snapshot_pins_state_until_dropped() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let snapshot = pool.make_snapshot().unwrap();
    pool.write(|conn| {
        conn.execute("INSERT INTO t VALUES (2, 'b')", [])?;
        Ok(())
    })
    .await
    .unwrap();

    let frozen: i64 = snapshot
        .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(frozen, 1);
    assert_eq!(count(&pool).await, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_long_write_frees_the_writer() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let token = CancellationToken::new();
    let long_write = {
        let pool = pool.clone();
        let token = token.clone();
        tokio::spawn(async move {
            pool.write_with_cancellation(&token, |conn| {
                // Effectively unbounded; only an interrupt stops it.
                let n: i64 = conn.query_row(
                    "WITH RECURSIVE c(x) AS (VALUES(1) UNION ALL SELECT x + 1 FROM c) \
                     SELECT COUNT(*) FROM c",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    let result = long_write.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // The writer is immediately available again.
    let next_write = tokio::time::timeout(
        Duration::from_secs(1),
        pool.write(|conn| {
            conn.execute("INSERT INTO t VALUES (2, 'b')", [])?;
            Ok(())
        }),
    )
    .await
    .expect("writer must be free after cancellation");
    next_write.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn barrier_excludes_readers_for_truncation() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let active_readers = Arc::new(AtomicUsize::new(0));
    let mut reads = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        let active = active_readers.clone();
        reads.push(tokio::spawn(async move {
            pool.unsafe_read(move |conn| {
                active.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get::<_, i64>(0))?)
            })
            .await
            .unwrap()
        }));
    }

    // Let the readers get going before the barrier queues up.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let active = active_readers.clone();
    pool.barrier_write_without_transaction(move |conn| {
        assert_eq!(
            active.load(Ordering::SeqCst),
            0,
            "barrier must exclude all readers"
        );
        let wal_pages: i64 =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |r| r.get(1))?;
        assert_eq!(wal_pages, 0);
        Ok(())
    })
    .await
    .unwrap();

    for read in reads {
        assert_eq!(read.await.unwrap(), 1, "outstanding reads complete first");
    }

    // Readers resume after the barrier.
    assert_eq!(count(&pool).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reopening_preserves_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    {
        let pool = DatabasePool::open(&path, Config::default()).await.unwrap();
        pool.write(|conn| {
            conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")?;
            conn.execute("INSERT INTO t VALUES (1, 'a')", [])?;
            Ok(())
        })
        .await
        .unwrap();
        pool.checkpoint(CheckpointMode::Truncate).await.unwrap();
        pool.close().await.unwrap();
    }

    let pool = DatabasePool::open(&path, Config::default()).await.unwrap();
    let row: (i64, String) = pool
        .read(|conn| Ok(conn.query_row("SELECT id, v FROM t", [], |r| Ok((r.get(0)?, r.get(1)?)))?))
        .await
        .unwrap();
    assert_eq!(row, (1, "a".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_are_totally_ordered() {
    let dir = TempDir::new().unwrap();
    let pool = seeded_pool(&dir, Config::default()).await;

    let mut writes = Vec::new();
    for i in 2..=20 {
        let pool = pool.clone();
        writes.push(tokio::spawn(async move {
            pool.write(move |conn| {
                conn.execute(
                    "INSERT INTO t VALUES (?1, 'x')",
                    [i],
                )?;
                Ok(())
            })
            .await
        }));
    }
    for write in writes {
        write.await.unwrap().unwrap();
    }

    assert_eq!(count(&pool).await, 20);
}
