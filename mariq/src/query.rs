//! Query API: the work item producers hand to the pool.
//!
//! A query carries concatenated SQL text, the number of result sets it
//! expects back, four delivery callbacks, and opaque user-data slots.
//! Results cross from whichever runtime drives the connection to the
//! producer's runtime over the query's own channel; the consumer task
//! spawned on the producer's runtime invokes the callbacks there, in
//! posting order, until the terminal result.
use std::{any::Any, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::{
    ErrorKind, Pool, Result,
    common::{ByteStr, verbose},
    error::{BadArg, PoolBusy},
    result::{QueryResult, ResultPayload},
};

/// A delivery callback. Receives the query's mutable context and the
/// posted result.
pub type QueryCb = Box<dyn FnMut(&mut QueryCtx, &QueryResult) + Send>;

/// The four delivery callbacks of one query.
///
/// The payload of each [`QueryResult`] selects which one runs:
/// result-set headers to `result_ready`, rows to `row_fetched`, set
/// releases to `result_free`, failures to `error`.
pub struct QueryCallbacks {
    pub result_ready: QueryCb,
    pub row_fetched: QueryCb,
    pub result_free: QueryCb,
    pub error: QueryCb,
}

impl Default for QueryCallbacks {
    /// All four callbacks do nothing.
    fn default() -> Self {
        Self {
            result_ready: Box::new(|_, _| {}),
            row_fetched: Box::new(|_, _| {}),
            result_free: Box::new(|_, _| {}),
            error: Box::new(|_, _| {}),
        }
    }
}

impl std::fmt::Debug for QueryCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("QueryCallbacks")
    }
}

/// Mutable state handed to every callback invocation.
pub struct QueryCtx {
    /// Opaque slots the producer attached at start.
    pub user_data: Vec<Box<dyn Any + Send>>,
}

/// Everything needed to start one query.
pub struct QueryConfig {
    /// Pool the query is brokered through.
    pub pool: Pool,
    /// Runtime that must observe the callbacks.
    pub handle: Handle,
    /// One or more statements, delimiters included between them.
    pub statements: ByteStr,
    /// Result sets the statements are expected to produce, in total.
    pub num_rs: usize,
    pub callbacks: QueryCallbacks,
    pub user_data: Vec<Box<dyn Any + Send>>,
}

/// The queued work item.
///
/// Immutable after construction; owners observe progress exclusively
/// through their callbacks.
pub struct Query {
    statements: ByteStr,
    num_rs: usize,
    tx: UnboundedSender<QueryResult>,
}

impl Query {
    /// Validate `cfg` and materialize the work item.
    ///
    /// The consumer task is spawned on the configured runtime handle
    /// immediately; it exits silently if the query is dropped without
    /// ever being queued.
    pub fn new(cfg: QueryConfig) -> Result<Arc<Query>> {
        if cfg.statements.trim().is_empty() || cfg.num_rs == 0 {
            return Err(BadArg.into());
        }
        if cfg.statements.len() >= cfg.pool.config().bulk_limit_bytes() {
            return Err(BadArg.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        cfg.handle.spawn(consume(rx, cfg.callbacks, cfg.user_data));
        Ok(Arc::new(Query {
            statements: cfg.statements,
            num_rs: cfg.num_rs,
            tx,
        }))
    }

    /// The statements, as the producer supplied them.
    pub fn statements(&self) -> &ByteStr {
        &self.statements
    }

    /// Declared result-set count.
    pub fn num_rs(&self) -> usize {
        self.num_rs
    }

    /// Post one result toward the owner. Returns whether it was the
    /// terminal one.
    pub(crate) fn post(&self, result: QueryResult) -> bool {
        let terminal = result.terminal;
        // the owner dropping early only makes delivery a no-op
        let _ = self.tx.send(result);
        terminal
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("statements", &self.statements)
            .field("num_rs", &self.num_rs)
            .finish()
    }
}

/// Owner-side delivery: runs on the producer's runtime, dispatches each
/// result to its callback, stops after the terminal one.
async fn consume(
    mut rx: UnboundedReceiver<QueryResult>,
    callbacks: QueryCallbacks,
    user_data: Vec<Box<dyn Any + Send>>,
) {
    let mut callbacks = callbacks;
    let mut ctx = QueryCtx { user_data };
    while let Some(result) = rx.recv().await {
        let terminal = result.terminal;
        let callback = match &result.payload {
            ResultPayload::ResultSet(_) => &mut callbacks.result_ready,
            ResultPayload::Row(_) => &mut callbacks.row_fetched,
            ResultPayload::Freed => &mut callbacks.result_free,
            ResultPayload::Error(_) => &mut callbacks.error,
        };
        callback(&mut ctx, &result);
        if terminal {
            break;
        }
    }
}

/// Start a new query.
///
/// Synchronously validates the configuration, claims a free connection
/// from the pool, queues the query on it, and schedules processing on the
/// producer's runtime. Everything after that arrives through the
/// callbacks.
///
/// [`PoolBusy`] is returned, and nothing is queued, when the pool is
/// closing or every connection is claimed; the caller may retry.
pub fn query_start(cfg: QueryConfig) -> Result<()> {
    let pool = cfg.pool.clone();
    let handle = cfg.handle.clone();

    if pool.is_closing() {
        return Err(PoolBusy.into());
    }
    let Some(conn) = pool.acquire_free_conn() else {
        return Err(PoolBusy.into());
    };

    let query = match Query::new(cfg) {
        Ok(query) => query,
        Err(err) => {
            pool.release_used_conn(&conn);
            return Err(err);
        }
    };

    verbose!("queueing {} result sets on pool {}", query.num_rs(), pool.alias());

    let first = match conn.add_new_query(query) {
        Ok(first) => first,
        Err(err) => {
            pool.release_used_conn(&conn);
            return Err(err);
        }
    };

    if first {
        if let Err(err) = conn.try_process_queries(&handle) {
            // someone else already drives this connection; the pending
            // queue is theirs to drain
            if !matches!(err.kind(), ErrorKind::ConnectionBusy(_)) {
                return Err(err);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnConfig;
    use crate::pool::PoolConfig;

    fn small_pool() -> Pool {
        let mut cfg = PoolConfig::new(
            "query-test",
            ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap(),
        );
        cfg.capacity = 1;
        cfg.bulk_query_limit_kb = 1;
        crate::pool::Pool::new(cfg).unwrap()
    }

    fn cfg(pool: &Pool, statements: &'static str, num_rs: usize) -> QueryConfig {
        QueryConfig {
            pool: pool.clone(),
            handle: Handle::current(),
            statements: ByteStr::from_static(statements),
            num_rs,
            callbacks: QueryCallbacks::default(),
            user_data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn admission_rejects_empty_statements() {
        let pool = small_pool();
        assert!(matches!(
            Query::new(cfg(&pool, "", 1)).unwrap_err().kind(),
            ErrorKind::BadArg(_)
        ));
        assert!(matches!(
            Query::new(cfg(&pool, "   ", 1)).unwrap_err().kind(),
            ErrorKind::BadArg(_)
        ));
    }

    #[tokio::test]
    async fn admission_rejects_zero_result_sets() {
        let pool = small_pool();
        assert!(Query::new(cfg(&pool, "SELECT 1", 0)).is_err());
    }

    #[tokio::test]
    async fn admission_rejects_statements_beyond_the_bulk_cap() {
        let pool = small_pool();
        let sql: &'static str = format!("SELECT '{}'", "x".repeat(2000)).leak();
        assert!(Query::new(cfg(&pool, sql, 1)).is_err());
    }

    #[tokio::test]
    async fn admitted_query_keeps_its_text_and_count() {
        let pool = small_pool();
        let query = Query::new(cfg(&pool, "SELECT 1; SELECT 2", 2)).unwrap();
        assert_eq!(query.statements(), &"SELECT 1; SELECT 2");
        assert_eq!(query.num_rs(), 2);
    }
}
