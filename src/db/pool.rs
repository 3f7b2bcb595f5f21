//! Fixed-size SQLite connection pool.
//!
//! Handles are opened once at startup and recycled through a checkout /
//! checkin cycle. Checkout blocks up to a bounded wait when the pool is
//! drained, then fails with a retryable error instead of deadlocking.

use super::store::StoreError;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default bound on how long a caller waits for a free handle.
pub const CHECKOUT_WAIT: Duration = Duration::from_secs(5);

struct PoolState {
    idle: Vec<Connection>,
    checked_out: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
}

/// Shared pool of reusable connections to one database file.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open `capacity` connections to the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StoreError> {
        let capacity = capacity.max(1);
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let conn = Connection::open(&path)?;
            // WAL keeps readers unblocked while workers write.
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.busy_timeout(Duration::from_secs(30))?;
            idle.push(conn);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle,
                    checked_out: 0,
                }),
                available: Condvar::new(),
                capacity,
            }),
        })
    }

    /// Check out a connection, waiting up to `CHECKOUT_WAIT` for one to free.
    pub fn checkout(&self) -> Result<PooledConn, StoreError> {
        self.checkout_timeout(CHECKOUT_WAIT)
    }

    pub fn checkout_timeout(&self, wait: Duration) -> Result<PooledConn, StoreError> {
        let deadline = Instant::now() + wait;
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if let Some(conn) = state.idle.pop() {
                state.checked_out += 1;
                return Ok(PooledConn {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::PoolExhausted);
            }
            let (next, timed_out) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if timed_out.timed_out() && state.idle.is_empty() {
                return Err(StoreError::PoolExhausted);
            }
        }
    }

    /// Number of handles currently lent out. Never exceeds capacity.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().unwrap().checked_out
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A connection on loan from the pool; returns itself when dropped.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("checked_out", &self.conn.is_some())
            .finish()
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.state.lock().unwrap();
            state.idle.push(conn);
            state.checked_out = state.checked_out.saturating_sub(1);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_checkout_checkin_cycle() {
        let tmp = NamedTempFile::new().unwrap();
        let pool = ConnectionPool::open(tmp.path(), 2).unwrap();

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_eq!(pool.checked_out(), 2);

        drop(a);
        assert_eq!(pool.checked_out(), 1);
        drop(b);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn test_exhausted_pool_fails_with_bounded_wait() {
        let tmp = NamedTempFile::new().unwrap();
        let pool = ConnectionPool::open(tmp.path(), 1).unwrap();

        let _held = pool.checkout().unwrap();
        let start = Instant::now();
        let err = pool.checkout_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_checked_out_never_exceeds_capacity() {
        let tmp = NamedTempFile::new().unwrap();
        let pool = ConnectionPool::open(tmp.path(), 3).unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
        assert_eq!(pool.checked_out(), pool.capacity());
        assert!(pool.checkout_timeout(Duration::from_millis(10)).is_err());
        drop(held);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn test_waiter_wakes_on_checkin() {
        let tmp = NamedTempFile::new().unwrap();
        let pool = ConnectionPool::open(tmp.path(), 1).unwrap();

        let held = pool.checkout().unwrap();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            pool2.checkout_timeout(Duration::from_secs(5)).map(|_| ())
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }
}
