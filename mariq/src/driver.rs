//! The [`Driver`] trait and protocol state vocabulary.
//!
//! A driver adapts one SQL dialect's non-blocking client discipline to the
//! connection layer: it owns the socket, advances its protocol machine one
//! transition per [`step`][Driver::step], and reports when it must wait
//! for readiness so the caller can arm a [`TimerPoll`][crate::timer_poll::TimerPoll].
use std::{os::fd::RawFd, sync::Arc};

use tokio::io::{Interest, Ready};

use crate::{
    Result,
    common::ByteStr,
    error::ConfigError,
    pool::PoolConfig,
    result::{RowInfo, RsInfo},
};

/// Coarse protocol state of a connection, published in query results and
/// shutdown predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, never connected.
    Inited,
    /// Establishing the session.
    Connect(Phase),
    /// Sending a batch and reading the first response header.
    Query(Phase),
    /// Inspecting a completed result-set header.
    CheckResultSet,
    /// Advancing to the next result set of a multi-statement batch.
    NextRs(Phase),
    /// Streaming rows of the current result set.
    FetchRow(Phase),
    /// Releasing the current result set.
    FreeRs(Phase),
    /// Tearing the session down.
    Close(Phase),
}

/// Sub-state of one [`ConnState`] group.
///
/// `Done` doubles as the original's `READY` for the query and row-fetch
/// groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Waiting,
    Done,
}

impl ConnState {
    /// Whether the machine is parked between protocol steps, awaiting
    /// readiness.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::Connect(Phase::Waiting)
                | Self::Query(Phase::Waiting)
                | Self::NextRs(Phase::Waiting)
                | Self::FetchRow(Phase::Waiting)
                | Self::FreeRs(Phase::Waiting)
                | Self::Close(Phase::Waiting)
        )
    }

    /// Whether the session holds no live socket.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Inited | Self::Close(Phase::Done))
    }
}

/// What woke the state machine for this step.
#[derive(Debug, Clone, Copy)]
pub enum Wake {
    /// Continue from the previous step, nothing was awaited.
    Resume,
    /// The watched descriptor reported readiness. May be
    /// [`Ready::EMPTY`] when the caller retries an attempt right after
    /// arming.
    Ready(Ready),
    /// The deadline elapsed before readiness. The machine still advances
    /// once so the protocol layer can surface its own timeout.
    TimedOut,
}

/// Outcome of one state transition.
#[derive(Debug)]
pub enum Step {
    /// Advance again immediately.
    Continue,
    /// Arm readiness + deadline and call [`step`][Driver::step] back with
    /// the observation.
    Wait(Interest),
    /// A protocol event for the query layer; step again once delivered.
    Event(BatchEvent),
    /// The in-flight batch is fully processed; the machine parks in its
    /// query-ready state.
    BatchDone,
    /// The close sequence finished; the socket is gone.
    Closed,
}

/// Protocol events attributed, in order, to the result sets of the
/// in-flight batch.
#[derive(Debug)]
pub enum BatchEvent {
    /// A result-set header completed. `columns == 0` means the statement
    /// produced no row data (e.g. INSERT/UPDATE).
    ResultReady(RsInfo),
    /// One row of the current result set.
    Row(RowInfo),
    /// The current result set has been released.
    ResultFreed,
}

/// Non-blocking protocol adapter for one SQL dialect.
///
/// At most one task drives a given instance at a time; the connection
/// layer guarantees this with its state-change flag.
pub trait Driver: Send {
    /// Accept a batch of concatenated statements to drive next.
    ///
    /// Legal only while parked ([`ConnState::Inited`] or
    /// `Query(Done)`); connecting is performed lazily by subsequent
    /// [`step`][Driver::step] calls when no session exists yet.
    fn begin_batch(&mut self, sql: ByteStr) -> Result<()>;

    /// Advance the machine one transition.
    fn step(&mut self, wake: Wake) -> Result<Step>;

    /// Redirect the machine into its close sequence, from any state.
    /// Stepping afterwards runs the teardown to [`Step::Closed`].
    fn start_close(&mut self);

    /// The descriptor to watch while a step reported [`Step::Wait`].
    fn sock_fd(&self) -> Option<RawFd>;

    /// Deadline for the next waiting period, in milliseconds.
    fn timeout_ms(&self) -> u64;

    /// Snapshot of the current protocol state.
    fn state(&self) -> ConnState;

    /// Whether the session holds no live socket.
    fn is_closed(&self) -> bool {
        self.state().is_closed()
    }
}

/// Builds [`Driver`] instances for a pool's connections.
pub trait DriverFactory: Send + Sync {
    /// Invoked once when the owning pool is registered.
    fn global_init(&self) -> Result<()> {
        Ok(())
    }

    /// Invoked once when the owning pool is torn down.
    fn global_deinit(&self) {}

    /// Build a driver for one connection.
    fn driver(&self, cfg: &PoolConfig) -> Box<dyn Driver>;
}

/// Resolve a driver implementation by its configured name.
///
/// An unknown name is a configuration error, reported at pool
/// registration.
pub fn by_name(name: &str) -> Result<Arc<dyn DriverFactory>> {
    match name {
        "mariadb" => Ok(Arc::new(crate::mariadb::MariaDbFactory)),
        _ => Err(ConfigError::new(format!("unknown driver {name:?}")).into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn waiting_predicate_tracks_sub_state() {
        assert!(ConnState::Query(Phase::Waiting).is_waiting());
        assert!(ConnState::FetchRow(Phase::Waiting).is_waiting());
        assert!(!ConnState::Query(Phase::Done).is_waiting());
        assert!(!ConnState::Inited.is_waiting());
    }

    #[test]
    fn closed_predicate() {
        assert!(ConnState::Inited.is_closed());
        assert!(ConnState::Close(Phase::Done).is_closed());
        assert!(!ConnState::Close(Phase::Waiting).is_closed());
        assert!(!ConnState::Query(Phase::Done).is_closed());
    }

    #[test]
    fn unknown_driver_name_is_a_config_error() {
        assert!(by_name("oracle").is_err());
        assert!(by_name("mariadb").is_ok());
    }
}
