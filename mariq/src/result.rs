//! Result payloads delivered to query callbacks.
use std::sync::Arc;

use crate::{Error, common::ByteStr, driver::ConnState};

/// One delivery to a query owner: a result-set header, a row, a release
/// notice, or an error.
///
/// Exactly one result per query carries [`terminal`][QueryResult::terminal];
/// nothing follows it.
#[derive(Debug)]
pub struct QueryResult {
    /// Protocol state of the producing connection when this was posted.
    pub conn_state: ConnState,
    /// Alias of the owning pool.
    pub conn_alias: ByteStr,
    /// Whether the post crossed from a driving task, as opposed to being
    /// delivered synchronously by an administrative call such as eviction.
    pub async_post: bool,
    /// The last delivery this query will ever receive.
    pub terminal: bool,
    /// Declared result sets not yet fully delivered, after this one.
    pub num_rs_remain: usize,
    pub payload: ResultPayload,
}

/// What a [`QueryResult`] carries. Selects the callback it is routed to.
#[derive(Debug)]
pub enum ResultPayload {
    /// Routed to `result_ready`.
    ResultSet(RsInfo),
    /// Routed to `row_fetched`.
    Row(RowInfo),
    /// Routed to `result_free`.
    Freed,
    /// Routed to `error`. Shared because a batch failure is delivered to
    /// every query still in flight.
    Error(Arc<Error>),
}

/// Header of one completed result set.
#[derive(Debug, Clone)]
pub struct RsInfo {
    /// Number of columns; `0` for statements without row data.
    pub columns: u64,
    /// Rows affected, as reported by the server for no-row statements.
    pub affected_rows: u64,
}

/// One row, columns in server order, in opaque string form.
///
/// `None` is SQL NULL.
#[derive(Debug, Clone)]
pub struct RowInfo {
    pub values: Vec<Option<ByteStr>>,
}
