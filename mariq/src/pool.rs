//! Database connection pooling.
//!
//! A pool owns a bounded set of [`Connection`]s split across a free list
//! and a locked list, both under one mutex together with the closing
//! bit. Producers claim a free connection, queue work on it, and the
//! drive loop returns it when the connection parks or closes.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tokio::{runtime::Handle, sync::Notify};

use crate::{
    Result,
    common::{ByteStr, verbose},
    connection::Connection,
    driver::DriverFactory,
    error::ConfigError,
};

mod config;
mod map;

pub use config::{DriverSelect, PoolConfig};
pub use map::PoolMap;

/// Bounded pool of connections to one database destination.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    pub(crate) cfg: PoolConfig,
    pub(crate) factory: Arc<dyn DriverFactory>,
    state: Mutex<PoolState>,
    resized: Notify,
}

struct PoolState {
    free: VecDeque<Arc<Connection>>,
    locked: Vec<Arc<Connection>>,
    closing: bool,
    /// Capacity the pool converges to; shrinks drain lazily.
    target: usize,
}

impl Pool {
    /// Validate `cfg`, resolve its driver, and materialize the
    /// connections. Sessions are established lazily, on first demand.
    pub fn new(cfg: PoolConfig) -> Result<Pool> {
        cfg.validate()?;
        let factory = match &cfg.driver {
            DriverSelect::Name(name) => crate::driver::by_name(name)?,
            DriverSelect::Factory(factory) => Arc::clone(factory),
        };
        factory.global_init()?;

        let capacity = cfg.capacity;
        let inner = Arc::new_cyclic(|weak: &Weak<PoolShared>| {
            let free = (0..capacity).map(|_| Connection::new(weak.clone())).collect();
            PoolShared {
                cfg,
                factory,
                state: Mutex::new(PoolState {
                    free,
                    locked: Vec::new(),
                    closing: false,
                    target: capacity,
                }),
                resized: Notify::new(),
            }
        });
        Ok(Pool { inner })
    }

    /// Move the head of the free list to the locked list and return it.
    ///
    /// `None` when the free list is empty or the pool is closing.
    pub fn acquire_free_conn(&self) -> Option<Arc<Connection>> {
        let mut state = self.inner.lock_state();
        if state.closing {
            return None;
        }
        let conn = state.free.pop_front()?;
        state.locked.push(Arc::clone(&conn));
        verbose!("acquired, free={} locked={}", state.free.len(), state.locked.len());
        Some(conn)
    }

    /// Return a locked connection to the free list.
    pub fn release_used_conn(&self, conn: &Arc<Connection>) {
        self.inner.release_conn(conn);
    }

    /// Grow eagerly, shrink by draining.
    ///
    /// Resolves once the observed size equals `new_capacity`. Busy
    /// connections above the target are closed as they are released.
    pub async fn set_capacity(&self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 {
            return Err(ConfigError::new("capacity must be positive").into());
        }
        let handle = Handle::current();

        let to_close = {
            let mut state = self.inner.lock_state();
            state.target = new_capacity;
            while state.free.len() + state.locked.len() < new_capacity {
                state.free.push_back(Connection::new(Arc::downgrade(&self.inner)));
            }
            let mut out = Vec::new();
            while state.free.len() + state.locked.len() > new_capacity {
                let Some(conn) = state.free.pop_front() else { break };
                out.push(conn);
            }
            out
        };
        for conn in to_close {
            let _ = conn.try_close(&handle);
        }
        self.inner.resized.notify_waiters();

        loop {
            if self.size() == new_capacity {
                return Ok(());
            }
            let notified = self.inner.resized.notified();
            if self.size() == new_capacity {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Refuse new connections and queries from now on. Idempotent.
    pub fn signal_closing(&self) {
        self.inner.lock_state().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    /// Ask every connection to close once drained, driving idle ones on
    /// `handle`.
    pub fn close_all_conns(&self, handle: &Handle) {
        for conn in self.inner.all_conns() {
            let _ = conn.try_close(handle);
        }
    }

    /// Non-blocking predicate for the shutdown coordinator to spin on.
    pub fn check_all_conns_closed(&self) -> bool {
        self.inner.all_conns().iter().all(|conn| conn.is_closed())
    }

    /// Number of connections currently preserved.
    pub fn size(&self) -> usize {
        let state = self.inner.lock_state();
        state.free.len() + state.locked.len()
    }

    /// Number of connections on the free list.
    pub fn free_len(&self) -> usize {
        self.inner.lock_state().free.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.cfg
    }

    pub fn alias(&self) -> &ByteStr {
        &self.inner.cfg.alias
    }

    pub(crate) fn factory(&self) -> &Arc<dyn DriverFactory> {
        &self.inner.factory
    }
}

impl PoolShared {
    pub(crate) fn is_closing(&self) -> bool {
        self.lock_state().closing
    }

    pub(crate) fn release_conn(&self, conn: &Arc<Connection>) {
        let excess = {
            let mut state = self.lock_state();
            match state.locked.iter().position(|c| Arc::ptr_eq(c, conn)) {
                Some(pos) => {
                    let conn = state.locked.swap_remove(pos);
                    if state.free.len() + state.locked.len() >= state.target {
                        Some(conn)
                    } else {
                        state.free.push_back(conn);
                        None
                    }
                }
                // idle-close drives never left the free list
                None => None,
            }
        };
        if let Some(conn) = excess {
            verbose!("draining connection above target capacity");
            if let Ok(handle) = Handle::try_current() {
                let _ = conn.try_close(&handle);
            }
        }
        self.resized.notify_waiters();
    }

    fn all_conns(&self) -> Vec<Arc<Connection>> {
        let state = self.lock_state();
        state.free.iter().chain(state.locked.iter()).cloned().collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state poisoned")
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Pool")
            .field("alias", &self.inner.cfg.alias)
            .field("free", &state.free.len())
            .field("locked", &state.locked.len())
            .field("closing", &state.closing)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnConfig;

    fn pool(capacity: usize) -> Pool {
        let mut cfg = PoolConfig::new(
            "pool-test",
            ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap(),
        );
        cfg.capacity = capacity;
        Pool::new(cfg).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let conn = ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap();

        let mut cfg = PoolConfig::new("", conn.clone());
        assert!(Pool::new(cfg).is_err());

        cfg = PoolConfig::new("x", conn.clone());
        cfg.capacity = 0;
        assert!(Pool::new(cfg).is_err());

        cfg = PoolConfig::new("x", conn.clone());
        cfg.bulk_query_limit_kb = 0;
        assert!(Pool::new(cfg).is_err());

        cfg = PoolConfig::new("x", conn);
        cfg.driver = DriverSelect::Name(ByteStr::from_static("oracle"));
        assert!(Pool::new(cfg).is_err());
    }

    #[test]
    fn every_conn_is_on_exactly_one_list() {
        let pool = pool(2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_len(), 2);

        let a = pool.acquire_free_conn().unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_len(), 1);

        let b = pool.acquire_free_conn().unwrap();
        assert_eq!(pool.free_len(), 0);
        assert!(pool.acquire_free_conn().is_none());

        pool.release_used_conn(&a);
        pool.release_used_conn(&b);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn closing_pool_refuses_acquisition() {
        let pool = pool(1);
        pool.signal_closing();
        pool.signal_closing(); // idempotent
        assert!(pool.is_closing());
        assert!(pool.acquire_free_conn().is_none());
    }

    #[tokio::test]
    async fn capacity_grows_eagerly() {
        let pool = pool(1);
        pool.set_capacity(3).await.unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.free_len(), 3);
    }

    #[tokio::test]
    async fn capacity_shrinks_by_draining_idle_conns() {
        let pool = pool(3);
        pool.set_capacity(1).await.unwrap();
        assert_eq!(pool.size(), 1);
    }
}
