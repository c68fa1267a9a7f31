//! Pool configuration.
use std::{sync::Arc, time::Duration};

use crate::{
    Result,
    common::ByteStr,
    connection::ConnConfig,
    driver::DriverFactory,
    error::ConfigError,
};

/// Configuration of one pool, as an external config loader provides it.
#[derive(Clone)]
pub struct PoolConfig {
    /// Unique label within a [`PoolMap`][crate::pool::PoolMap].
    pub alias: ByteStr,
    /// Maximum number of connections to preserve.
    pub capacity: usize,
    /// Per-protocol-step deadline.
    pub idle_timeout: Duration,
    /// Byte cap of one bulk batch, in KB.
    pub bulk_query_limit_kb: usize,
    /// Credentials of the database destination.
    pub conn: ConnConfig,
    /// Connect in plain text. Setting this to `false` is a connect-time
    /// configuration error until TLS is supported.
    pub skip_tls: bool,
    /// Byte inserted between the statements of distinct queries when they
    /// are concatenated into one batch.
    pub delimiter: u8,
    /// The protocol adapter connections are built with.
    pub driver: DriverSelect,
}

/// How a pool picks its driver implementation.
#[derive(Clone)]
pub enum DriverSelect {
    /// Resolved through [`driver::by_name`][crate::driver::by_name] at
    /// pool registration.
    Name(ByteStr),
    /// An injected factory, e.g. a scripted driver in tests.
    Factory(Arc<dyn DriverFactory>),
}

impl PoolConfig {
    pub fn new(alias: impl Into<ByteStr>, conn: ConnConfig) -> Self {
        Self {
            alias: alias.into(),
            capacity: 10,
            idle_timeout: Duration::from_secs(30),
            bulk_query_limit_kb: 64,
            conn,
            skip_tls: true,
            delimiter: b';',
            driver: DriverSelect::Name(ByteStr::from_static("mariadb")),
        }
    }

    /// Set the connection capacity.
    pub fn capacity(mut self, value: usize) -> Self {
        self.capacity = value;
        self
    }

    /// Set the per-step deadline.
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Set the bulk batch cap, in KB.
    pub fn bulk_query_limit_kb(mut self, value: usize) -> Self {
        self.bulk_query_limit_kb = value;
        self
    }

    /// Use an injected driver factory instead of a named one.
    pub fn driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.driver = DriverSelect::Factory(factory);
        self
    }

    pub(crate) fn bulk_limit_bytes(&self) -> usize {
        self.bulk_query_limit_kb << 10
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.alias.is_empty() {
            return Err(ConfigError::new("pool alias must not be empty").into());
        }
        if self.capacity == 0 {
            return Err(ConfigError::new("pool capacity must be positive").into());
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::new("idle timeout must be positive").into());
        }
        if self.bulk_query_limit_kb == 0 {
            return Err(ConfigError::new("bulk query limit must be positive").into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("alias", &self.alias)
            .field("capacity", &self.capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("bulk_query_limit_kb", &self.bulk_query_limit_kb)
            .field("skip_tls", &self.skip_tls)
            .finish()
    }
}
