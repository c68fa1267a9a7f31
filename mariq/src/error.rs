//! `mariq` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::config::ParseError,
    mariadb::protocol::{ProtocolError, ServerError},
};

/// A specialized [`Result`] type for `mariq` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `mariq` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach context shown ahead of the error message.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kind from `mariq` library.
pub enum ErrorKind {
    /// Invalid pool, connection, or query configuration.
    Config(ConfigError),
    /// Failed to parse a connection url.
    Parse(ParseError),
    /// Operating system level failure.
    Io(io::Error),
    /// The server sent something the protocol layer cannot make sense of.
    Protocol(ProtocolError),
    /// The server rejected a statement or the session.
    Server(ServerError),
    /// A protocol step did not complete within the configured timeout.
    Network(TimedOut),
    /// Caller passed an argument the operation cannot accept.
    BadArg(BadArg),
    /// No free connection, or the pool is closing. Transient.
    PoolBusy(PoolBusy),
    /// The connection is closing, or another task holds its state flag. Transient.
    ConnectionBusy(ConnectionBusy),
    /// A batch is still being driven through the connection.
    QueryStillProcessing(QueryStillProcessing),
    /// The current result set has not finished loading.
    RsetStillLoading(RsetStillLoading),
    /// A row fetch is still in flight.
    RowStillFetching(RowStillFetching),
    /// The current result set is being released.
    RsetReleasing(RsetReleasing),
    /// The server produced fewer result sets than the query declared.
    EndOfRsets(EndOfRsets),
    /// No more rows in the current result set.
    EndOfRows(EndOfRows),
    /// The operation was skipped; e.g. the query was evicted before it was sent.
    Skipped(Skipped),
}

crate::common::unit_error! {
    /// A protocol step did not complete within the configured timeout.
    pub struct TimedOut("timed out waiting for the server");
}

crate::common::unit_error! {
    /// Caller passed an argument the operation cannot accept.
    pub struct BadArg("invalid argument");
}

crate::common::unit_error! {
    /// No free connection available, or the pool is closing.
    pub struct PoolBusy("pool is busy or closing");
}

crate::common::unit_error! {
    /// The connection is closing, or another task holds its state flag.
    pub struct ConnectionBusy("connection is busy or closing");
}

crate::common::unit_error! {
    /// A batch is still being driven through the connection.
    pub struct QueryStillProcessing("a query batch is still processing");
}

crate::common::unit_error! {
    /// The current result set has not finished loading.
    pub struct RsetStillLoading("result set is still loading");
}

crate::common::unit_error! {
    /// A row fetch is still in flight.
    pub struct RowStillFetching("a row is still being fetched");
}

crate::common::unit_error! {
    /// The current result set is being released.
    pub struct RsetReleasing("result set is being released");
}

crate::common::unit_error! {
    /// The server produced fewer result sets than the query declared.
    pub struct EndOfRsets("no more result sets");
}

crate::common::unit_error! {
    /// No more rows in the current result set.
    pub struct EndOfRows("no more rows");
}

crate::common::unit_error! {
    /// The operation was skipped before reaching the server.
    pub struct Skipped("operation skipped");
}

/// Invalid pool, connection, or query configuration.
pub struct ConfigError {
    pub(crate) reason: std::borrow::Cow<'static, str>,
}

impl ConfigError {
    pub(crate) fn new(reason: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ConfigError { }

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ParseError>e => ErrorKind::Parse(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<TimedOut>e => ErrorKind::Network(e));
from!(<BadArg>e => ErrorKind::BadArg(e));
from!(<PoolBusy>e => ErrorKind::PoolBusy(e));
from!(<ConnectionBusy>e => ErrorKind::ConnectionBusy(e));
from!(<QueryStillProcessing>e => ErrorKind::QueryStillProcessing(e));
from!(<RsetStillLoading>e => ErrorKind::RsetStillLoading(e));
from!(<RowStillFetching>e => ErrorKind::RowStillFetching(e));
from!(<RsetReleasing>e => ErrorKind::RsetReleasing(e));
from!(<EndOfRsets>e => ErrorKind::EndOfRsets(e));
from!(<EndOfRows>e => ErrorKind::EndOfRows(e));
from!(<Skipped>e => ErrorKind::Skipped(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Parse(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Network(e) => e.fmt(f),
            Self::BadArg(e) => e.fmt(f),
            Self::PoolBusy(e) => e.fmt(f),
            Self::ConnectionBusy(e) => e.fmt(f),
            Self::QueryStillProcessing(e) => e.fmt(f),
            Self::RsetStillLoading(e) => e.fmt(f),
            Self::RowStillFetching(e) => e.fmt(f),
            Self::RsetReleasing(e) => e.fmt(f),
            Self::EndOfRsets(e) => e.fmt(f),
            Self::EndOfRows(e) => e.fmt(f),
            Self::Skipped(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
