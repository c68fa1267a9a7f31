//! Connection: owns one driver, its pending-query queue, and the batch
//! drive loop.
//!
//! A connection is driven by at most one task at a time, guarded by an
//! atomic state-change flag. The driving task assembles pending queries
//! into bulk batches, steps the driver's protocol machine, parks the
//! timer-poll at every waiting state, and fans completed result sets back
//! to each query's owner.
pub mod config;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{io::Interest, runtime::Handle};

use crate::{
    Error, Result,
    common::{ByteStr, span, verbose},
    driver::{BatchEvent, ConnState, Driver, Phase, Step, Wake},
    error::{ConnectionBusy, EndOfRsets, QueryStillProcessing, Skipped},
    mariadb::protocol::ProtocolError,
    pool::PoolShared,
    query::Query,
    result::{QueryResult, ResultPayload},
    timer_poll::{PollOutcome, TimerPoll},
};

pub use config::ConnConfig;

const COARSE_INITED: u8 = 0;
const COARSE_LIVE: u8 = 1;
const COARSE_CLOSED: u8 = 2;

/// One pooled database connection.
pub struct Connection {
    pool: Weak<PoolShared>,
    queues: Mutex<Queues>,
    /// Exclusive one-shot guarding driver mutation, timer-poll arming,
    /// and pending → in-flight moves.
    state_changing: AtomicBool,
    /// Set by the producer that turned the pending queue non-empty; that
    /// producer schedules processing.
    has_ready_query: AtomicBool,
    /// Protocol position for observers that do not hold the driver.
    coarse: AtomicU8,
}

struct Queues {
    pending: VecDeque<Arc<Query>>,
    /// Queries moved out of pending into the in-flight batch.
    inflight: usize,
    closing: bool,
    /// Parked driver; taken by the driving task for the whole drive.
    driver: Option<Box<dyn Driver>>,
}

/// Pending queries concatenated into one multi-statement request.
struct Batch {
    queries: Vec<Arc<Query>>,
    sql: ByteStr,
}

impl Connection {
    pub(crate) fn new(pool: Weak<PoolShared>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queues: Mutex::new(Queues {
                pending: VecDeque::new(),
                inflight: 0,
                closing: false,
                driver: None,
            }),
            state_changing: AtomicBool::new(false),
            has_ready_query: AtomicBool::new(false),
            coarse: AtomicU8::new(COARSE_INITED),
        })
    }

    /// Append a query to the pending queue.
    ///
    /// Returns whether the queue was empty: the producer that flipped it
    /// non-empty is the one responsible for scheduling
    /// [`try_process_queries`][Connection::try_process_queries].
    pub fn add_new_query(&self, query: Arc<Query>) -> Result<bool> {
        let mut queues = self.lock_queues();
        if queues.closing {
            return Err(ConnectionBusy.into());
        }
        let was_empty = queues.pending.is_empty();
        queues.pending.push_back(query);
        if was_empty {
            self.has_ready_query.store(true, Ordering::Release);
        }
        Ok(was_empty)
    }

    /// Spawn the drive loop on `handle` if no other task is driving.
    ///
    /// [`ConnectionBusy`] means another task holds the state-change flag;
    /// the pending queue will be drained by it.
    pub fn try_process_queries(self: &Arc<Self>, handle: &Handle) -> Result<()> {
        if self
            .state_changing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConnectionBusy.into());
        }
        handle.spawn(drive(Arc::clone(self)));
        Ok(())
    }

    /// Ask the connection to close once drained. Idempotent.
    ///
    /// If no task is driving, the close sequence is driven on `handle`;
    /// otherwise the driving task picks the request up when its current
    /// batch completes.
    pub fn try_close(self: &Arc<Self>, handle: &Handle) -> Result<()> {
        self.lock_queues().closing = true;
        match self.try_process_queries(handle) {
            Ok(()) => Ok(()),
            Err(err) if matches!(err.kind(), crate::ErrorKind::ConnectionBusy(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Whether the session holds no live socket.
    pub fn is_closed(&self) -> bool {
        self.coarse.load(Ordering::Acquire) != COARSE_LIVE
    }

    /// Whether a producer turned the pending queue non-empty and
    /// processing has not picked it up yet.
    pub fn has_ready_query(&self) -> bool {
        self.has_ready_query.load(Ordering::Acquire)
    }

    /// Peek the head of the pending queue.
    pub fn first_pending_query(&self) -> Option<Arc<Query>> {
        self.lock_queues().pending.front().cloned()
    }

    /// Remove the head of the pending queue before it is batched.
    ///
    /// The evicted query receives a terminal [`Skipped`] error. Queries
    /// already moved into the in-flight batch cannot be evicted; they
    /// must receive their terminal event first.
    pub fn try_evict_pending_query(&self) -> Result<()> {
        let evicted = {
            let mut queues = self.lock_queues();
            match queues.pending.pop_front() {
                Some(query) => query,
                None if queues.inflight > 0 => return Err(QueryStillProcessing.into()),
                None => return Err(Skipped.into()),
            }
        };
        let remain = evicted.num_rs();
        evicted.post(QueryResult {
            conn_state: self.coarse_state(),
            conn_alias: self.alias(),
            async_post: false,
            terminal: true,
            num_rs_remain: remain,
            payload: ResultPayload::Error(Arc::new(Skipped.into())),
        });
        Ok(())
    }

    /// Protocol position for observers that do not hold the driver.
    pub fn coarse_state(&self) -> ConnState {
        match self.coarse.load(Ordering::Acquire) {
            COARSE_LIVE => ConnState::Query(Phase::Done),
            COARSE_CLOSED => ConnState::Close(Phase::Done),
            _ => ConnState::Inited,
        }
    }

    fn alias(&self) -> ByteStr {
        self.pool
            .upgrade()
            .map(|p| p.cfg.alias.clone())
            .unwrap_or_default()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().expect("connection queues poisoned")
    }

    /// Drain pending queries into a new batch, bounded by the pool's bulk
    /// byte cap, concatenating statements with the configured delimiter.
    fn update_ready_queries(&self, scratch: &mut BytesMut, limit: usize, delimiter: u8) -> Option<Batch> {
        span!("update_ready_queries");

        let mut queues = self.lock_queues();
        if queues.pending.is_empty() {
            return None;
        }

        scratch.clear();
        scratch.reserve(limit);
        let mut queries = Vec::new();
        while let Some(query) = queues.pending.front() {
            let stmt = query.statements().as_bytes();
            let sep = usize::from(!scratch.is_empty() && scratch.last() != Some(&delimiter));
            if !queries.is_empty() && scratch.len() + sep + stmt.len() > limit {
                break;
            }
            if sep == 1 {
                scratch.extend_from_slice(&[delimiter]);
            }
            scratch.extend_from_slice(stmt);
            queries.push(queues.pending.pop_front().expect("front just observed"));
        }

        queues.inflight = queries.len();
        if queues.pending.is_empty() {
            self.has_ready_query.store(false, Ordering::Release);
        }

        let sql = ByteStr::from_utf8(scratch.split().freeze())
            .expect("statements are utf-8");
        verbose!("batched {} queries, {} bytes", queries.len(), sql.len());
        Some(Batch { queries, sql })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.coarse_state())
            .field("driving", &self.state_changing.load(Ordering::Relaxed))
            .finish()
    }
}

/// Tracks which query of the in-flight batch the driver's events belong
/// to, and posts them to the owners.
struct BatchCursor<'a> {
    queries: &'a [Arc<Query>],
    alias: ByteStr,
    idx: usize,
    /// Declared result sets the current query still expects.
    remain: usize,
}

impl<'a> BatchCursor<'a> {
    fn new(batch: &'a Batch, alias: ByteStr) -> Self {
        Self {
            queries: &batch.queries,
            alias,
            idx: 0,
            remain: batch.queries.first().map(|q| q.num_rs()).unwrap_or(0),
        }
    }

    fn advance(&mut self) {
        self.idx += 1;
        self.remain = self.queries.get(self.idx).map(|q| q.num_rs()).unwrap_or(0);
    }

    fn post(&self, terminal: bool, state: ConnState, payload: ResultPayload) {
        self.queries[self.idx].post(QueryResult {
            conn_state: state,
            conn_alias: self.alias.clone(),
            async_post: true,
            terminal,
            num_rs_remain: self.remain,
            payload,
        });
    }

    fn dispatch(&mut self, event: BatchEvent, state: ConnState) {
        if self.idx >= self.queries.len() {
            // the server produced more result sets than were declared
            #[cfg(feature = "log")]
            log::debug!("dropping result set beyond the declared count");
            return;
        }
        match event {
            BatchEvent::ResultReady(info) => {
                if info.columns == 0 {
                    // no rows follow, this header is the whole result set
                    self.remain -= 1;
                    let terminal = self.remain == 0;
                    self.post(terminal, state, ResultPayload::ResultSet(info));
                    if terminal {
                        self.advance();
                    }
                } else {
                    self.post(false, state, ResultPayload::ResultSet(info));
                }
            }
            BatchEvent::Row(row) => {
                self.post(false, state, ResultPayload::Row(row));
            }
            BatchEvent::ResultFreed => {
                self.remain -= 1;
                let terminal = self.remain == 0;
                self.post(terminal, state, ResultPayload::Freed);
                if terminal {
                    self.advance();
                }
            }
        }
    }

    /// The batch ended; queries the server shortchanged get a terminal
    /// end-of-result-sets error.
    fn finish(&mut self, state: ConnState) {
        while self.idx < self.queries.len() {
            self.post(true, state, ResultPayload::Error(Arc::new(EndOfRsets.into())));
            self.advance();
        }
    }

    /// The batch died; every query without a terminal event yet receives
    /// the error.
    fn fail(&mut self, err: &Arc<Error>, state: ConnState) {
        while self.idx < self.queries.len() {
            self.post(true, state, ResultPayload::Error(Arc::clone(err)));
            self.advance();
        }
    }
}

/// The drive loop. Runs with the state-change flag held; releases it and
/// returns the connection to the pool when parked or closed.
async fn drive(conn: Arc<Connection>) {
    let Some(pool) = conn.pool.upgrade() else {
        conn.state_changing.store(false, Ordering::Release);
        return;
    };

    let limit = pool.cfg.bulk_limit_bytes();
    let delimiter = pool.cfg.delimiter;
    let mut scratch = BytesMut::with_capacity(limit);
    let mut tp: Option<(TimerPoll, std::os::fd::RawFd)> = None;

    'session: loop {
        let mut driver = conn
            .lock_queues()
            .driver
            .take()
            .unwrap_or_else(|| pool.factory.driver(&pool.cfg));

        loop {
            let Some(batch) = conn.update_ready_queries(&mut scratch, limit, delimiter) else {
                let closing = conn.lock_queues().closing || pool.is_closing();
                if closing && !driver.is_closed() {
                    run_close(&mut driver, &mut tp).await;
                }
                break;
            };

            let mut cursor = BatchCursor::new(&batch, pool.cfg.alias.clone());
            match run_batch(&mut *driver, &mut tp, &batch, &mut cursor).await {
                Ok(()) => {
                    conn.lock_queues().inflight = 0;
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!("batch failed on pool {}: {err:#?}", pool.cfg.alias);
                    cursor.fail(&Arc::new(err), driver.state());
                    conn.lock_queues().inflight = 0;
                    // the session is unrecoverable; close it and let the
                    // next batch re-establish
                    run_close(&mut driver, &mut tp).await;
                }
            }
        }

        // park: publish the snapshot, hand the driver back, release the
        // flag, then reclaim if a producer slipped work in meanwhile
        let coarse = if driver.is_closed() { COARSE_CLOSED } else { COARSE_LIVE };
        conn.coarse.store(coarse, Ordering::Release);
        conn.lock_queues().driver = Some(driver);
        conn.state_changing.store(false, Ordering::Release);

        let unfinished = {
            let queues = conn.lock_queues();
            !queues.pending.is_empty() || (queues.closing && coarse == COARSE_LIVE)
        };
        if unfinished
            && conn
                .state_changing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            continue 'session;
        }
        break;
    }

    pool.release_conn(&conn);
}

/// Drive one batch through the protocol machine.
async fn run_batch(
    driver: &mut dyn Driver,
    tp: &mut Option<(TimerPoll, std::os::fd::RawFd)>,
    batch: &Batch,
    cursor: &mut BatchCursor<'_>,
) -> Result<()> {
    driver.begin_batch(batch.sql.clone())?;

    let mut wake = Wake::Resume;
    let mut armed: Option<Interest> = None;
    loop {
        let step = driver.step(wake);
        if !matches!(&step, Ok(Step::Wait(_))) {
            if armed.take().is_some() {
                if let Some((tp, _)) = tp.as_mut() {
                    tp.stop();
                }
            }
        }
        match step? {
            Step::Continue => wake = Wake::Resume,
            Step::Event(event) => {
                cursor.dispatch(event, driver.state());
                wake = Wake::Resume;
            }
            Step::Wait(interest) => {
                if armed == Some(interest) {
                    let (tp, _) = tp.as_mut().expect("armed without a timer poll");
                    wake = match tp.wait().await? {
                        PollOutcome::Ready(ready) => Wake::Ready(ready),
                        PollOutcome::TimedOut => Wake::TimedOut,
                    };
                    armed = None;
                } else {
                    wake = arm(driver, tp, interest)?;
                    armed = Some(interest);
                }
            }
            Step::BatchDone => {
                cursor.finish(driver.state());
                return Ok(());
            }
            Step::Closed => {
                return Err(ProtocolError::new("driver closed mid-batch").into());
            }
        }
    }
}

/// Bind the timer-poll to the driver's current socket and arm it.
///
/// The caller then retries the driver once before actually waiting, to
/// cover readiness that landed between the would-block and the arm.
fn arm(
    driver: &mut dyn Driver,
    tp: &mut Option<(TimerPoll, std::os::fd::RawFd)>,
    interest: Interest,
) -> Result<Wake> {
    let fd = driver
        .sock_fd()
        .ok_or_else(|| ProtocolError::new("driver waits without a socket"))?;
    let timeout = Duration::from_millis(driver.timeout_ms().max(1));

    match tp {
        Some((_, bound)) if *bound == fd => {}
        Some((handle, bound)) => {
            handle.change_fd(fd)?;
            *bound = fd;
        }
        None => *tp = Some((TimerPoll::new(fd)?, fd)),
    }

    let (handle, _) = tp.as_mut().expect("just bound");
    handle.start(timeout, interest)?;
    Ok(Wake::Ready(tokio::io::Ready::EMPTY))
}

/// Run the driver's close sequence to completion, best effort.
async fn run_close(
    driver: &mut Box<dyn Driver>,
    tp: &mut Option<(TimerPoll, std::os::fd::RawFd)>,
) {
    driver.start_close();

    let mut wake = Wake::Resume;
    let mut armed: Option<Interest> = None;
    for _ in 0..1024 {
        match driver.step(wake) {
            Ok(Step::Closed) => break,
            Ok(Step::Wait(interest)) => {
                if armed == Some(interest) {
                    let Some((handle, _)) = tp.as_mut() else { break };
                    wake = match handle.wait().await {
                        Ok(PollOutcome::Ready(ready)) => Wake::Ready(ready),
                        Ok(PollOutcome::TimedOut) => Wake::TimedOut,
                        Err(_) => break,
                    };
                    armed = None;
                } else {
                    match arm(&mut **driver, tp, interest) {
                        Ok(w) => {
                            wake = w;
                            armed = Some(interest);
                        }
                        Err(_) => break,
                    }
                }
            }
            Ok(_) => wake = Wake::Resume,
            Err(_err) => {
                #[cfg(feature = "log")]
                log::error!("close error: {_err:#?}");
                break;
            }
        }
    }

    if let Some((handle, _)) = tp.as_mut() {
        handle.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::{Pool, PoolConfig};
    use crate::query::{QueryCallbacks, QueryConfig};

    fn test_pool(capacity: usize, bulk_kb: usize) -> Pool {
        let mut cfg = PoolConfig::new(
            "conn-test",
            ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap(),
        );
        cfg.capacity = capacity;
        cfg.bulk_query_limit_kb = bulk_kb;
        Pool::new(cfg).unwrap()
    }

    fn noop_query(pool: &Pool, sql: &'static str, num_rs: usize) -> Arc<Query> {
        Query::new(QueryConfig {
            pool: pool.clone(),
            handle: Handle::current(),
            statements: ByteStr::from_static(sql),
            num_rs,
            callbacks: QueryCallbacks::default(),
            user_data: Vec::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn batches_respect_the_byte_cap() {
        let pool = test_pool(1, 1);
        let conn = pool.acquire_free_conn().unwrap();

        // 597 + 1 + 597 > 1024: the second statement starts the next batch
        let a: &'static str = format!("SELECT '{}'", "a".repeat(588)).leak();
        let b: &'static str = format!("SELECT '{}'", "b".repeat(588)).leak();
        conn.add_new_query(noop_query(&pool, a, 1)).unwrap();
        conn.add_new_query(noop_query(&pool, b, 1)).unwrap();

        let mut scratch = BytesMut::new();
        let batch = conn.update_ready_queries(&mut scratch, 1024, b';').unwrap();
        assert_eq!(batch.queries.len(), 1);
        assert_eq!(batch.sql, *a);

        let batch = conn.update_ready_queries(&mut scratch, 1024, b';').unwrap();
        assert_eq!(batch.queries.len(), 1);
        assert_eq!(batch.sql, *b);

        assert!(conn.update_ready_queries(&mut scratch, 1024, b';').is_none());
    }

    #[tokio::test]
    async fn batch_joins_statements_without_doubling_delimiters() {
        let pool = test_pool(1, 64);
        let conn = pool.acquire_free_conn().unwrap();

        conn.add_new_query(noop_query(&pool, "INSERT INTO t VALUES (1);", 1)).unwrap();
        conn.add_new_query(noop_query(&pool, "SELECT count(*) FROM t", 1)).unwrap();

        let mut scratch = BytesMut::new();
        let batch = conn.update_ready_queries(&mut scratch, 64 << 10, b';').unwrap();
        assert_eq!(batch.queries.len(), 2);
        assert_eq!(batch.sql, "INSERT INTO t VALUES (1);SELECT count(*) FROM t");
    }

    #[tokio::test]
    async fn first_producer_owns_the_ready_flag() {
        let pool = test_pool(1, 64);
        let conn = pool.acquire_free_conn().unwrap();

        assert!(conn.add_new_query(noop_query(&pool, "SELECT 1", 1)).unwrap());
        assert!(!conn.add_new_query(noop_query(&pool, "SELECT 2", 1)).unwrap());
    }

    #[tokio::test]
    async fn eviction_only_touches_unbatched_queries() {
        let pool = test_pool(1, 64);
        let conn = pool.acquire_free_conn().unwrap();

        assert!(matches!(
            conn.try_evict_pending_query().unwrap_err().kind(),
            crate::ErrorKind::Skipped(_)
        ));

        conn.add_new_query(noop_query(&pool, "SELECT 1", 1)).unwrap();
        assert!(conn.first_pending_query().is_some());
        conn.try_evict_pending_query().unwrap();
        assert!(conn.first_pending_query().is_none());

        // simulate an in-flight batch
        conn.add_new_query(noop_query(&pool, "SELECT 2", 1)).unwrap();
        let mut scratch = BytesMut::new();
        let _batch = conn.update_ready_queries(&mut scratch, 64 << 10, b';').unwrap();
        assert!(matches!(
            conn.try_evict_pending_query().unwrap_err().kind(),
            crate::ErrorKind::QueryStillProcessing(_)
        ));
    }
}
