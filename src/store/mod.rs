//! Durable relational store for trajectories, call logs, training batches and
//! trained models.
//!
//! Writes go through a single SQLite connection behind a mutex. Reads use a
//! small pool of read-only connections, so in WAL mode status and readiness
//! queries never queue behind a write. An in-memory store has one connection
//! serving both roles. The store is cheap to clone; clones share connections.
//!
//! Every call runs on the blocking pool and is bounded by the operation
//! timeout. A call that times out before reaching its connection is
//! abandoned and never runs; a call already running is awaited, so a reported
//! `Timeout` always means "nothing happened".
//!
//! Queries are split by table family:
//! - [`trajectories`] -- trajectory upserts, call logs and collection aggregates.
//! - [`batches`] -- training batches and the single-flight lane.
//! - [`models`] -- trained models and version allocation.

pub mod batches;
pub mod models;
pub mod records;
mod schema;
pub mod trajectories;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

pub use records::{
    BatchManifest, BatchStatus, ModelStatus, TrainedModel, TrainingBatch, TrainingOutcome,
    WindowStats,
};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_POOL_SIZE: usize = 4;

// Lifecycle of one store call.
const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

type SharedConnection = Arc<Mutex<Connection>>;

/// Round-robin pool of read connections.
struct ReadPool {
    connections: Vec<SharedConnection>,
    next: AtomicUsize,
}

impl ReadPool {
    fn open(path: &Path, size: usize, timeout: Duration) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size.max(1) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(timeout)?;
            connections.push(Arc::new(Mutex::new(conn)));
        }
        Ok(Self::from_connections(connections))
    }

    fn from_connections(connections: Vec<SharedConnection>) -> Self {
        Self {
            connections,
            next: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> SharedConnection {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        Arc::clone(&self.connections[idx])
    }
}

/// Handle to the durable store.
#[derive(Clone)]
pub struct TrajectoryStore {
    writer: SharedConnection,
    readers: Arc<ReadPool>,
    timeout: Duration,
    location: Option<PathBuf>,
}

impl std::fmt::Debug for TrajectoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryStore")
            .field("location", &self.location)
            .field("timeout", &self.timeout)
            .field("readers", &self.readers.connections.len())
            .finish()
    }
}

impl TrajectoryStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        Self::open_with_readers(path, timeout, DEFAULT_READ_POOL_SIZE)
    }

    /// Open the database file at `path` with `readers` read connections.
    pub fn open_with_readers(
        path: impl AsRef<Path>,
        timeout: Duration,
        readers: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Persistence(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::init(&conn)?;
        let readers = ReadPool::open(&path, readers, timeout)?;

        info!(
            path = %path.display(),
            readers = readers.connections.len(),
            "trajectory store opened"
        );
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(readers),
            timeout,
            location: Some(path),
        })
    }

    /// Open the store described by `config`.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::open_with_readers(
            &config.database_path,
            config.operation_timeout(),
            config.read_pool_size,
        )
    }

    /// A private in-memory store. Its single connection serves reads too.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        let writer = Arc::new(Mutex::new(conn));
        Ok(Self {
            readers: Arc::new(ReadPool::from_connections(vec![Arc::clone(&writer)])),
            writer,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            location: None,
        })
    }

    /// Replace the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connectivity check, answered by a read connection.
    pub async fn ping(&self) -> Result<()> {
        self.read("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    /// Run `f` against the write connection.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.execute(Arc::clone(&self.writer), operation, f).await
    }

    /// Run `f` against a pooled read connection.
    pub(crate) async fn read<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.execute(self.readers.acquire(), operation, f).await
    }

    /// Run `f` on the blocking pool, bounded by the store timeout.
    ///
    /// `f` runs at most once, and only if it reaches the connection before
    /// the caller gives up waiting for it.
    async fn execute<T, F>(&self, conn: SharedConnection, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let claim = Arc::clone(&state);
        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if claim
                .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
            Some(f(&mut *guard))
        });

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if state
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(
                        operation,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "store call timed out before it started"
                    );
                    return Err(self.timeout_error(operation));
                }
                warn!(operation, "store call overran its timeout; awaiting its result");
                task.await
            }
        };

        match joined {
            Ok(Some(result)) => result,
            Ok(None) => Err(self.timeout_error(operation)),
            Err(join_err) => Err(Error::Persistence(format!(
                "{operation} task failed: {join_err}"
            ))),
        }
    }

    fn timeout_error(&self, operation: &'static str) -> Error {
        Error::Timeout {
            operation: operation.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

/// Canonical timestamp encoding: RFC 3339, UTC, millisecond precision.
/// Encoded values sort lexicographically in time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("corrupt timestamp {raw:?}: {e}")))
}

pub(crate) fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn ping_in_memory() {
        let store = TrajectoryStore::in_memory().unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tidepool.db");
        let store = TrajectoryStore::open(&path, Duration::from_secs(2)).unwrap();
        store.ping().await.unwrap();
        assert!(path.exists());
    }

    /// Holds the write connection for `hold` on a background task.
    async fn occupy_writer(store: &TrajectoryStore, hold: Duration) -> tokio::task::JoinHandle<()> {
        let blocker = store.clone();
        let handle = tokio::spawn(async move {
            blocker
                .run("hold", move |_| {
                    std::thread::sleep(hold);
                    Ok(())
                })
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle
    }

    fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    #[tokio::test]
    async fn queued_call_that_times_out_never_runs() {
        let store = TrajectoryStore::in_memory()
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let hold = occupy_writer(&store, Duration::from_millis(200)).await;

        let err = store
            .run("late", |conn| {
                conn.execute_batch("CREATE TABLE late_marker (x INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref operation, .. } if operation == "late"));
        assert!(err.is_transient());

        hold.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let created = store
            .run("check", |conn| table_exists(conn, "late_marker"))
            .await
            .unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn running_call_is_awaited_past_the_timeout() {
        let store = TrajectoryStore::in_memory()
            .unwrap()
            .with_timeout(Duration::from_millis(20));

        let value = store
            .run("slow", |conn| {
                std::thread::sleep(Duration::from_millis(100));
                conn.execute_batch("CREATE TABLE slow_marker (x INTEGER);")?;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(store
            .run("check", |conn| table_exists(conn, "slow_marker"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::open(dir.path().join("t.db"), Duration::from_millis(100))
            .unwrap();

        let writer = store.clone();
        let long_write = tokio::spawn(async move {
            writer
                .run("long_write", |conn| {
                    let tx = conn.transaction()?;
                    tx.execute_batch("DELETE FROM llm_call_logs;")?;
                    std::thread::sleep(Duration::from_millis(400));
                    tx.commit()?;
                    Ok(())
                })
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        store.ping().await.unwrap();
        assert_eq!(store.count_trajectories().await.unwrap(), 0);
        long_write.await.unwrap();
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2025, 1, 15, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        assert!(encode_ts(early) < encode_ts(late));
        assert_eq!(decode_ts(&encode_ts(late)).unwrap(), late);
        assert!(decode_ts("yesterday").is_err());
    }
}
