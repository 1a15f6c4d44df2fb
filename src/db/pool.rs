use std::{
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rusqlite::Connection;

use crate::error::PoolError;

/// Tuning knobs for [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// How long `acquire` waits for a released connection before
    /// giving up with [`PoolError::Exhausted`].
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Reaper wake-up cadence.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}

struct IdleConn {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleConn>,
    in_use: usize,
    closed: bool,
}

impl PoolState {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use
    }
}

struct PoolInner {
    db_path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled when a connection returns to the idle list or the
    /// pool closes.
    available: Condvar,
    reaper_stop: Mutex<bool>,
    reaper_cv: Condvar,
}

/// Bounded pool of reusable SQLite connections.
///
/// Invariant at every observation point: `in_use + idle == size <= max_size`.
/// A background reaper closes connections idle longer than the idle
/// timeout; `close_all` checkpoints and closes everything and rejects
/// further acquires.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(db_path: PathBuf, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let inner = Arc::new(PoolInner {
            db_path,
            config: config.clone(),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                in_use: 0,
                closed: false,
            }),
            available: Condvar::new(),
            reaper_stop: Mutex::new(false),
            reaper_cv: Condvar::new(),
        });

        let reaper = spawn_reaper(Arc::clone(&inner))?;

        info!(
            "connection pool ready: max_size={}, acquire_timeout={:?}, idle_timeout={:?}",
            config.max_size, config.acquire_timeout, config.idle_timeout
        );

        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Returns an idle connection, creates one while below `max_size`,
    /// or waits until a release. Times out with [`PoolError::Exhausted`].
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(idle) = state.idle.pop() {
                state.in_use += 1;
                debug!("reusing pooled connection (size={})", state.size());
                return Ok(PooledConnection {
                    conn: Some(idle.conn),
                    pool: Arc::clone(&self.inner),
                });
            }

            if state.size() < self.inner.config.max_size {
                let conn = open_connection(&self.inner.db_path)?;
                state.in_use += 1;
                debug!("opened new pooled connection (size={})", state.size());
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Exhausted {
                    waited: self.inner.config.acquire_timeout,
                    max_size: self.inner.config.max_size,
                });
            }

            let (guard, timeout) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;

            if timeout.timed_out() && state.idle.is_empty() && !state.closed {
                return Err(PoolError::Exhausted {
                    waited: self.inner.config.acquire_timeout,
                    max_size: self.inner.config.max_size,
                });
            }
        }
    }

    /// Stops the reaper, checkpoints and closes every idle connection,
    /// and rejects subsequent acquires. Connections still checked out
    /// are closed when their guard drops.
    pub fn close_all(&self) {
        {
            let mut stop = self
                .inner
                .reaper_stop
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *stop = true;
            self.inner.reaper_cv.notify_all();
        }
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            if handle.join().is_err() {
                error!("pool reaper thread panicked");
            }
        }

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        for idle in state.idle.drain(..) {
            checkpoint_and_close(idle.conn);
        }
        self.inner.available.notify_all();
        info!("connection pool closed");
    }

    /// Total connections currently owned by the pool.
    pub fn size(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .size()
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .idle
            .len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_use
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let already_closed = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed
        };
        if !already_closed {
            self.close_all();
        }
    }
}

/// RAII guard over a checked-out connection; returns it to the idle
/// list on drop, or closes it if the pool has shut down.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut state = self.pool.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed {
            drop(state);
            checkpoint_and_close(conn);
            return;
        }
        state.idle.push(IdleConn {
            conn,
            since: Instant::now(),
        });
        self.pool.available.notify_one();
    }
}

fn open_connection(db_path: &PathBuf) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(conn)
}

fn checkpoint_and_close(conn: Connection) {
    if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        warn!("WAL checkpoint failed during close: {err}");
    }
    if let Err((_, err)) = conn.close() {
        warn!("failed to close pooled connection: {err}");
    }
}

fn spawn_reaper(inner: Arc<PoolInner>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("timelens-pool-reaper".into())
        .spawn(move || loop {
            let stop = inner
                .reaper_stop
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let (stop, _) = inner
                .reaper_cv
                .wait_timeout(stop, inner.config.reap_interval)
                .unwrap_or_else(|e| e.into_inner());
            if *stop {
                break;
            }
            drop(stop);
            reap_idle(&inner);
        })
        .context("failed to spawn pool reaper thread")
}

fn reap_idle(inner: &PoolInner) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.closed {
        return;
    }
    let idle_timeout = inner.config.idle_timeout;
    let expired: Vec<IdleConn> = {
        let (expired, kept) = state
            .idle
            .drain(..)
            .partition(|c| c.since.elapsed() > idle_timeout);
        state.idle = kept;
        expired
    };
    if !expired.is_empty() {
        debug!(
            "reaped {} idle connection(s), pool size now {}",
            expired.len(),
            state.size()
        );
    }
    drop(state);
    for idle in expired {
        if let Err((_, err)) = idle.conn.close() {
            warn!("failed to close reaped connection: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(max_size: usize, acquire_timeout: Duration) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(
            dir.path().join("pool.sqlite3"),
            PoolConfig {
                max_size,
                acquire_timeout,
                idle_timeout: Duration::from_secs(300),
                reap_interval: Duration::from_secs(60),
            },
        )
        .unwrap();
        (dir, pool)
    }

    #[test]
    fn acquire_reuses_released_connections() {
        let (_dir, pool) = test_pool(2, Duration::from_millis(200));

        let first = pool.acquire().unwrap();
        assert_eq!(pool.in_use_count(), 1);
        drop(first);
        assert_eq!(pool.idle_count(), 1);

        let _second = pool.acquire().unwrap();
        // Reused, not grown.
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn exhausted_after_timeout_and_unblocked_by_release() {
        let (_dir, pool) = test_pool(1, Duration::from_millis(100));
        let pool = std::sync::Arc::new(pool);

        let held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted { .. })));

        // A release while another thread waits lets the waiter through.
        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn close_all_rejects_new_acquires() {
        let (_dir, pool) = test_pool(2, Duration::from_millis(100));
        drop(pool.acquire().unwrap());
        pool.close_all();
        assert!(matches!(pool.acquire(), Err(PoolError::Closed)));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn reaper_shrinks_idle_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(
            dir.path().join("pool.sqlite3"),
            PoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_millis(20),
                reap_interval: Duration::from_millis(10),
            },
        )
        .unwrap();

        drop(pool.acquire().unwrap());
        assert_eq!(pool.size(), 1);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn in_use_plus_idle_never_exceeds_max() {
        let (_dir, pool) = test_pool(3, Duration::from_millis(100));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.in_use_count(), 3);
        drop(a);
        drop(b);
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.size(), 3);
        drop(c);
    }
}
