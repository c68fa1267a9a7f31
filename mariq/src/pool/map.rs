//! The process-wide alias → pool map.
//!
//! Owned by a single administrative task, typically the shutdown
//! coordinator: registration at startup, capacity changes at runtime,
//! and the two-phase drain at shutdown all go through it. It is not
//! shared mutable state; hand out [`Pool`] clones instead.
use std::collections::HashMap;

use tokio::runtime::Handle;

use crate::{
    Result,
    common::{ByteStr, verbose},
    error::ConfigError,
    pool::{Pool, PoolConfig},
};

/// Alias → [`Pool`] registry.
#[derive(Default)]
pub struct PoolMap {
    pools: HashMap<ByteStr, Pool>,
}

impl PoolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and materialize a new pool.
    ///
    /// A duplicate alias or an unknown driver name is a configuration
    /// error and leaves the map unchanged.
    pub fn register(&mut self, cfg: PoolConfig) -> Result<Pool> {
        if self.pools.contains_key(cfg.alias.as_str()) {
            return Err(ConfigError::new(format!("duplicate pool alias {:?}", cfg.alias.as_str())).into());
        }
        let alias = cfg.alias.clone();
        let pool = Pool::new(cfg)?;
        verbose!("registered pool {alias}");
        self.pools.insert(alias, pool.clone());
        Ok(pool)
    }

    /// Look a pool up by its alias.
    pub fn pool(&self, alias: &str) -> Option<&Pool> {
        self.pools.get(alias)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Phase one of shutdown: every pool stops admitting connections and
    /// queries. Idempotent.
    pub fn signal_closing(&self) {
        for pool in self.pools.values() {
            pool.signal_closing();
        }
    }

    /// Phase two of shutdown: ask every connection of every pool to close
    /// once drained, driving idle ones on `handle`.
    pub fn close_all_conns(&self, handle: &Handle) {
        for pool in self.pools.values() {
            pool.close_all_conns(handle);
        }
    }

    /// Non-blocking predicate for the shutdown coordinator to spin on.
    pub fn check_all_conns_closed(&self) -> bool {
        self.pools.values().all(Pool::check_all_conns_closed)
    }

    /// Unregister one pool and run its driver's global teardown.
    pub fn deinit(&mut self, alias: &str) -> Result<()> {
        let pool = self
            .pools
            .remove(alias)
            .ok_or_else(|| ConfigError::new(format!("no pool registered as {alias:?}")))?;
        pool.factory().global_deinit();
        Ok(())
    }

    /// Tear the whole map down.
    pub fn deinit_all(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.factory().global_deinit();
        }
    }
}

impl std::fmt::Debug for PoolMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMap").field("pools", &self.pools.len()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnConfig;

    fn cfg(alias: &'static str) -> PoolConfig {
        PoolConfig::new(alias, ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap())
            .capacity(1)
    }

    #[test]
    fn registers_and_looks_up() {
        let mut map = PoolMap::new();
        map.register(cfg("primary")).unwrap();
        map.register(cfg("replica")).unwrap();

        assert_eq!(map.len(), 2);
        assert!(map.pool("primary").is_some());
        assert!(map.pool("absent").is_none());
    }

    #[test]
    fn rejects_duplicate_alias() {
        let mut map = PoolMap::new();
        map.register(cfg("primary")).unwrap();
        assert!(map.register(cfg("primary")).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn rejects_unknown_driver_name() {
        let mut map = PoolMap::new();
        let mut bad = cfg("primary");
        bad.driver = crate::pool::DriverSelect::Name(ByteStr::from_static("mssql"));
        assert!(map.register(bad).is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn deinit_unregisters() {
        let mut map = PoolMap::new();
        map.register(cfg("primary")).unwrap();
        map.deinit("primary").unwrap();
        assert!(map.deinit("primary").is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn closing_signal_reaches_every_pool() {
        let mut map = PoolMap::new();
        map.register(cfg("a")).unwrap();
        map.register(cfg("b")).unwrap();
        map.signal_closing();
        assert!(map.pool("a").unwrap().is_closing());
        assert!(map.pool("b").unwrap().is_closing());
    }
}
