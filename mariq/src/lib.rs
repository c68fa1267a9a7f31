//! Asynchronous MariaDB connection pool with bulk query batching.
//!
//! `mariq` brokers SQL work from many concurrent producers onto a
//! bounded set of long-lived connections. Each connection advances the
//! server's non-blocking protocol one step at a time, waiting on socket
//! readiness bounded by a deadline, and fans completed result sets back
//! to the runtime each query came from.
//!
//! # Examples
//!
//! ```no_run
//! use mariq::{ConnConfig, PoolConfig, PoolMap, QueryCallbacks, QueryConfig};
//!
//! # fn app() -> mariq::Result<()> {
//! let mut pools = PoolMap::new();
//! let pool = pools.register(PoolConfig::new("primary", ConnConfig::from_env()))?;
//!
//! mariq::query_start(QueryConfig {
//!     pool: pool.clone(),
//!     handle: tokio::runtime::Handle::current(),
//!     statements: "SELECT `id`, `title` FROM `upload_req`".into(),
//!     num_rs: 1,
//!     callbacks: QueryCallbacks {
//!         row_fetched: Box::new(|_, result| println!("{result:?}")),
//!         ..Default::default()
//!     },
//!     user_data: Vec::new(),
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Shutdown is a two-phase drain:
//!
//! ```no_run
//! # async fn app(pools: mariq::PoolMap) {
//! pools.signal_closing();
//! pools.close_all_conns(&tokio::runtime::Handle::current());
//! while !pools.check_all_conns_closed() {
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//! }
//! # }
//! ```

pub mod common;

// Protocol
pub mod mariadb;

// Component
pub mod timer_poll;
pub mod driver;
pub mod result;

// Operation
pub mod query;

// Connection
pub mod connection;
pub mod pool;

pub mod error;

pub use connection::{ConnConfig, Connection};
pub use driver::{ConnState, Driver, DriverFactory};
pub use pool::{Pool, PoolConfig, PoolMap};
#[doc(inline)]
pub use query::{Query, QueryCallbacks, QueryConfig, query_start};
pub use result::{QueryResult, ResultPayload};
pub use error::{Error, ErrorKind, Result};
