//! Process-wide synchronized connection pool.
//!
//! Created once during server init and shared by handle with every worker.
//! `acquire` blocks while all slots are checked out; connections are created
//! lazily up to the capacity and returned on guard drop. A connection whose
//! wire state broke mid-task is discarded so its slot can be refilled.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use crate::connection::{PgConfig, PgConnection};
use crate::error::PgResult;

struct PoolInner {
    idle: Vec<PgConnection>,
    total: usize,
}

pub struct PgPool {
    config: PgConfig,
    capacity: usize,
    inner: Mutex<PoolInner>,
    available: Condvar,
}

impl PgPool {
    pub fn new(config: PgConfig, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            config,
            capacity,
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(capacity),
                total: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    /// Check out a connection, blocking while the pool is exhausted.
    pub fn acquire(&self) -> PgResult<PgGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(conn) = inner.idle.pop() {
                return Ok(PgGuard {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if inner.total < self.capacity {
                inner.total += 1;
                drop(inner);
                return match PgConnection::connect(&self.config) {
                    Ok(conn) => Ok(PgGuard {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(e) => {
                        self.inner.lock().unwrap().total -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    fn release(&self, conn: PgConnection) {
        let mut inner = self.inner.lock().unwrap();
        if conn.is_broken() {
            inner.total -= 1;
        } else {
            inner.idle.push(conn);
        }
        drop(inner);
        self.available.notify_one();
    }
}

/// RAII checkout; the connection returns to the pool on drop.
pub struct PgGuard<'a> {
    pool: &'a PgPool,
    conn: Option<PgConnection>,
}

impl Deref for PgGuard<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        self.conn.as_ref().expect("guard holds a connection")
    }
}

impl DerefMut for PgGuard<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("guard holds a connection")
    }
}

impl Drop for PgGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fails_cleanly_when_server_is_absent() {
        // Nothing listens on a closed loopback port; the slot must be
        // returned so capacity is not leaked by failed connects.
        let cfg = PgConfig::new("127.0.0.1", 1, "u", "p", "db");
        let pool = PgPool::new(cfg, 2);
        assert!(pool.acquire().is_err());
        assert!(pool.acquire().is_err());
        assert_eq!(pool.idle_count(), 0);
    }
}
