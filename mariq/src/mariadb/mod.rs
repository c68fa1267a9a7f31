//! MariaDB driver: the protocol state machine over a non-blocking wire
//! client.
//!
//! One [`step`][crate::driver::Driver::step] performs at most one
//! would-block-able protocol action. Where the machine must wait it
//! reports the readiness it needs; the connection layer arms the
//! timer-poll and steps again with the observation.
pub mod protocol;
mod stream;

use bytes::BytesMut;
use tokio::io::Interest;

use crate::{
    Result,
    common::{ByteStr, verbose},
    connection::config::ConnConfig,
    driver::{BatchEvent, ConnState, Driver, DriverFactory, Phase, Step, Wake},
    error::{ConfigError, QueryStillProcessing, TimedOut},
    pool::PoolConfig,
    result::{RowInfo, RsInfo},
};
use protocol::{ProtocolError, QueryResponse};
use stream::NbStream;

/// Builds [`MariaDb`] drivers.
pub struct MariaDbFactory;

impl DriverFactory for MariaDbFactory {
    fn driver(&self, cfg: &PoolConfig) -> Box<dyn Driver> {
        Box::new(MariaDb::new(cfg))
    }
}

#[derive(Clone, Copy)]
enum State {
    Inited,
    Connect(Connecting),
    Query(Querying),
    CheckResultSet,
    NextRs(NextingRs),
    FetchRow(Fetching),
    FreeRs(Freeing),
    Close(Closing),
}

#[derive(Clone, Copy)]
enum Connecting {
    Start,
    /// TCP handshake in flight; resolved by writability + `SO_ERROR`.
    Tcp,
    ReadGreeting,
    SendAuth,
    ReadAuthResult,
    Done,
}

#[derive(Clone, Copy)]
enum Querying {
    Start,
    Flush,
    ReadHeader,
    /// Parked between batches with a live session.
    Ready,
}

#[derive(Clone, Copy)]
enum NextingRs {
    Start,
    ReadHeader,
}

#[derive(Clone, Copy)]
enum Fetching {
    /// Draining column definitions ahead of the rows.
    Columns { remaining: u64 },
    ColumnsEof,
    Rows,
}

#[derive(Clone, Copy)]
enum Freeing {
    Start,
}

#[derive(Clone, Copy)]
enum Closing {
    Start,
    Flush,
    Done,
}

/// Per-connection MariaDB session.
pub struct MariaDb {
    cfg: ConnConfig,
    skip_tls: bool,
    timeout_ms: u64,
    state: State,
    stream: Option<NbStream>,
    seq: u8,
    /// Concatenated statements accepted but not yet sent.
    batch: Option<ByteStr>,
    /// Header of the result set being checked, not yet announced.
    rs_header: Option<RsInfo>,
    /// Column count of the current result set.
    columns: u64,
    /// The server flagged another result set after the current one.
    more_results: bool,
}

impl MariaDb {
    pub fn new(cfg: &PoolConfig) -> Self {
        Self {
            cfg: cfg.conn.clone(),
            skip_tls: cfg.skip_tls,
            timeout_ms: cfg.idle_timeout.as_millis() as u64,
            state: State::Inited,
            stream: None,
            seq: 0,
            batch: None,
            rs_header: None,
            columns: 0,
            more_results: false,
        }
    }

    fn stream(&mut self) -> Result<&mut NbStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ProtocolError::new("no live session").into())
    }

    /// Read one framed payload, pulling from the socket as needed.
    fn read_packet(&mut self) -> Result<Option<bytes::Bytes>> {
        let stream = self.stream()?;
        if let Some(payload) = stream.take_packet() {
            return Ok(Some(payload));
        }
        stream.fill()?;
        Ok(stream.take_packet())
    }

    /// Handle the first packet of a result-set stream, shared by the
    /// query and next-result-set paths.
    fn on_response_header(&mut self, payload: bytes::Bytes) -> Result<Step> {
        match protocol::decode_query_response(payload)? {
            QueryResponse::Ok(ok) => {
                self.columns = 0;
                self.more_results = ok.more_results();
                self.rs_header = Some(RsInfo {
                    columns: 0,
                    affected_rows: ok.affected_rows,
                });
            }
            QueryResponse::ResultSet { columns } => {
                self.columns = columns;
                self.more_results = false;
                self.rs_header = Some(RsInfo {
                    columns,
                    affected_rows: 0,
                });
            }
            QueryResponse::Err(err) => return Err(err.into()),
        }
        self.state = State::CheckResultSet;
        Ok(Step::Continue)
    }

    fn force_close(&mut self) -> Step {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
        self.state = State::Close(Closing::Done);
        Step::Closed
    }
}

impl Driver for MariaDb {
    fn begin_batch(&mut self, sql: ByteStr) -> Result<()> {
        match self.state {
            // lazy (re-)establish
            State::Inited | State::Close(Closing::Done) => {
                self.batch = Some(sql);
                self.state = State::Connect(Connecting::Start);
                Ok(())
            }
            State::Query(Querying::Ready) => {
                self.batch = Some(sql);
                self.state = State::Query(Querying::Start);
                Ok(())
            }
            _ => Err(QueryStillProcessing.into()),
        }
    }

    fn step(&mut self, wake: Wake) -> Result<Step> {
        if let Wake::TimedOut = wake {
            // a close that cannot flush in time is abandoned; anywhere
            // else the deadline is fatal for the session
            return match self.state {
                State::Close(_) => Ok(self.force_close()),
                _ => Err(TimedOut.into()),
            };
        }

        match self.state {
            State::Inited => Ok(Step::BatchDone),

            State::Connect(Connecting::Start) => {
                if !self.skip_tls {
                    return Err(ConfigError::new(
                        "tls is not supported, set skip_tls to connect in plain text",
                    )
                    .into());
                }
                verbose!("connecting to {}:{}", self.cfg.host, self.cfg.port);
                self.stream = Some(NbStream::connect_start(&self.cfg.host, self.cfg.port)?);
                self.state = State::Connect(Connecting::Tcp);
                Ok(Step::Wait(Interest::WRITABLE))
            }
            State::Connect(Connecting::Tcp) => {
                // SO_ERROR reads zero while the handshake is still in
                // flight, so only consult it once writability arrived
                match wake {
                    Wake::Ready(ready) if ready.is_writable() => {
                        self.stream()?.connect_check()?;
                        self.state = State::Connect(Connecting::ReadGreeting);
                        Ok(Step::Continue)
                    }
                    _ => Ok(Step::Wait(Interest::WRITABLE)),
                }
            }
            State::Connect(Connecting::ReadGreeting) => {
                let Some(payload) = self.read_packet()? else {
                    return Ok(Step::Wait(Interest::READABLE));
                };
                let hs = protocol::decode_handshake(payload)?;
                verbose!("server {} ({})", hs.server_version, hs.connection_id);

                let caps = protocol::client_capabilities(
                    hs.capabilities,
                    !self.cfg.dbname.is_empty(),
                )?;
                let scramble = protocol::scramble_native(&self.cfg.pass, &hs.seed);

                let mut payload = BytesMut::new();
                protocol::encode_handshake_response(
                    &mut payload,
                    caps,
                    &self.cfg.user,
                    &scramble,
                    Some(self.cfg.dbname.as_str()),
                );
                self.seq = 1;
                let stream = self
                    .stream
                    .as_mut()
                    .ok_or_else(|| ProtocolError::new("no live session"))?;
                stream.push_packet(&mut self.seq, &payload);

                self.state = State::Connect(Connecting::SendAuth);
                Ok(Step::Continue)
            }
            State::Connect(Connecting::SendAuth) => {
                if !self.stream()?.flush()? {
                    return Ok(Step::Wait(Interest::WRITABLE));
                }
                self.state = State::Connect(Connecting::ReadAuthResult);
                Ok(Step::Continue)
            }
            State::Connect(Connecting::ReadAuthResult) => {
                let Some(payload) = self.read_packet()? else {
                    return Ok(Step::Wait(Interest::READABLE));
                };
                match payload.first() {
                    Some(0x00) => {
                        protocol::decode_ok(payload)?;
                        self.state = State::Connect(Connecting::Done);
                        Ok(Step::Continue)
                    }
                    Some(0xFF) => Err(protocol::decode_err(payload)?.into()),
                    _ => Err(ProtocolError::new("auth plugin switch is not supported").into()),
                }
            }
            State::Connect(Connecting::Done) => {
                self.state = match self.batch {
                    Some(_) => State::Query(Querying::Start),
                    None => State::Query(Querying::Ready),
                };
                Ok(Step::Continue)
            }

            State::Query(Querying::Start) => {
                let sql = self
                    .batch
                    .take()
                    .ok_or_else(|| ProtocolError::new("no batch to send"))?;
                let mut payload = BytesMut::new();
                protocol::encode_com_query(&mut payload, sql.as_bytes());
                self.seq = 0;
                let stream = self
                    .stream
                    .as_mut()
                    .ok_or_else(|| ProtocolError::new("no live session"))?;
                stream.push_packet(&mut self.seq, &payload);

                self.state = State::Query(Querying::Flush);
                Ok(Step::Continue)
            }
            State::Query(Querying::Flush) => {
                if !self.stream()?.flush()? {
                    return Ok(Step::Wait(Interest::WRITABLE));
                }
                self.state = State::Query(Querying::ReadHeader);
                Ok(Step::Continue)
            }
            State::Query(Querying::ReadHeader) | State::NextRs(NextingRs::ReadHeader) => {
                let Some(payload) = self.read_packet()? else {
                    return Ok(Step::Wait(Interest::READABLE));
                };
                self.on_response_header(payload)
            }
            State::Query(Querying::Ready) => Ok(Step::BatchDone),

            State::CheckResultSet => {
                let info = self
                    .rs_header
                    .take()
                    .ok_or_else(|| ProtocolError::new("no result set to check"))?;
                self.state = match info.columns {
                    0 => State::NextRs(NextingRs::Start),
                    n => State::FetchRow(Fetching::Columns { remaining: n }),
                };
                Ok(Step::Event(BatchEvent::ResultReady(info)))
            }

            State::FetchRow(Fetching::Columns { remaining }) => {
                let mut remaining = remaining;
                while remaining > 0 {
                    // definitions carry type metadata this opaque-string
                    // client does not use
                    match self.read_packet()? {
                        Some(_) => remaining -= 1,
                        None => {
                            self.state =
                                State::FetchRow(Fetching::Columns { remaining });
                            return Ok(Step::Wait(Interest::READABLE));
                        }
                    }
                }
                self.state = State::FetchRow(Fetching::ColumnsEof);
                Ok(Step::Continue)
            }
            State::FetchRow(Fetching::ColumnsEof) => {
                let Some(payload) = self.read_packet()? else {
                    return Ok(Step::Wait(Interest::READABLE));
                };
                if !protocol::is_eof(&payload) {
                    return Err(
                        ProtocolError::new("expected EOF after column definitions").into()
                    );
                }
                self.state = State::FetchRow(Fetching::Rows);
                Ok(Step::Continue)
            }
            State::FetchRow(Fetching::Rows) => {
                let Some(payload) = self.read_packet()? else {
                    return Ok(Step::Wait(Interest::READABLE));
                };
                if protocol::is_eof(&payload) {
                    let eof = protocol::decode_eof(payload)?;
                    self.more_results = eof.more_results();
                    self.state = State::FreeRs(Freeing::Start);
                    return Ok(Step::Continue);
                }
                if payload.first() == Some(&0xFF) {
                    return Err(protocol::decode_err(payload)?.into());
                }
                let values = protocol::decode_text_row(payload, self.columns)?;
                Ok(Step::Event(BatchEvent::Row(RowInfo { values })))
            }

            State::FreeRs(Freeing::Start) => {
                // the text protocol streams; reaching end-of-rows already
                // released the set server-side
                self.state = State::NextRs(NextingRs::Start);
                Ok(Step::Event(BatchEvent::ResultFreed))
            }

            State::NextRs(NextingRs::Start) => {
                if self.more_results {
                    self.state = State::NextRs(NextingRs::ReadHeader);
                    Ok(Step::Continue)
                } else {
                    self.state = State::Query(Querying::Ready);
                    Ok(Step::BatchDone)
                }
            }

            State::Close(Closing::Start) => {
                let Some(stream) = self.stream.as_mut() else {
                    self.state = State::Close(Closing::Done);
                    return Ok(Step::Closed);
                };
                self.seq = 0;
                stream.push_packet(&mut self.seq, &[protocol::COM_QUIT]);
                self.state = State::Close(Closing::Flush);
                Ok(Step::Continue)
            }
            State::Close(Closing::Flush) => match self.stream()?.flush() {
                Ok(false) => Ok(Step::Wait(Interest::WRITABLE)),
                // quit is best effort; a dead peer closes all the same
                Ok(true) | Err(_) => Ok(self.force_close()),
            },
            State::Close(Closing::Done) => Ok(Step::Closed),
        }
    }

    fn start_close(&mut self) {
        if !matches!(self.state, State::Close(_)) {
            self.state = State::Close(Closing::Start);
        }
    }

    fn sock_fd(&self) -> Option<std::os::fd::RawFd> {
        self.stream.as_ref().map(NbStream::fd)
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn state(&self) -> ConnState {
        match &self.state {
            State::Inited => ConnState::Inited,
            State::Connect(Connecting::Start) => ConnState::Connect(Phase::Start),
            State::Connect(Connecting::Done) => ConnState::Connect(Phase::Done),
            State::Connect(_) => ConnState::Connect(Phase::Waiting),
            State::Query(Querying::Start) => ConnState::Query(Phase::Start),
            State::Query(Querying::Ready) => ConnState::Query(Phase::Done),
            State::Query(_) => ConnState::Query(Phase::Waiting),
            State::CheckResultSet => ConnState::CheckResultSet,
            State::NextRs(NextingRs::Start) => ConnState::NextRs(Phase::Start),
            State::NextRs(NextingRs::ReadHeader) => ConnState::NextRs(Phase::Waiting),
            State::FetchRow(Fetching::Columns { .. } | Fetching::ColumnsEof) => {
                ConnState::FetchRow(Phase::Start)
            }
            State::FetchRow(Fetching::Rows) => ConnState::FetchRow(Phase::Waiting),
            State::FreeRs(Freeing::Start) => ConnState::FreeRs(Phase::Start),
            State::Close(Closing::Start) => ConnState::Close(Phase::Start),
            State::Close(Closing::Flush) => ConnState::Close(Phase::Waiting),
            State::Close(Closing::Done) => ConnState::Close(Phase::Done),
        }
    }
}

impl std::fmt::Debug for MariaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MariaDb")
            .field("state", &self.state())
            .field("host", &self.cfg.host)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    use tokio::io::Ready;

    use super::*;
    use crate::pool::DriverSelect;

    const GREETING: &[u8] = b"\
        \n\
        5.5.5-10.4.6-MariaDB\0\
        \x13\0\0\0\
        ?~~|vZAu\
        \0\
        \xfe\xf7\
        \x08\
        \x02\0\
        \xff\x81\
        \x15\
        \0\0\0\0\0\0\
        \x07\0\0\0\
        JQ8cihP4Q}Dx\
        \0\
        mysql_native_password\0";

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    fn read_frame(sock: &mut std::net::TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        sock.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).unwrap();
        payload
    }

    /// Scripted server: greeting, auth OK, then one single-column result
    /// set with two rows for whatever COM_QUERY arrives.
    fn scripted_server(listener: TcpListener) {
        let (mut sock, _) = listener.accept().unwrap();

        sock.write_all(&frame(0, GREETING)).unwrap();
        let auth = read_frame(&mut sock);
        assert!(auth.len() > 32, "handshake response too short");
        sock.write_all(&frame(2, b"\x00\x00\x00\x02\x00\x00\x00")).unwrap();

        let query = read_frame(&mut sock);
        assert_eq!(query[0], protocol::COM_QUERY);

        sock.write_all(&frame(1, b"\x01")).unwrap(); // one column
        sock.write_all(&frame(2, b"\x03def")).unwrap(); // definition, unread
        sock.write_all(&frame(3, b"\xfe\x00\x00\x00\x00")).unwrap();
        sock.write_all(&frame(4, b"\x01a")).unwrap();
        sock.write_all(&frame(5, b"\x01b")).unwrap();
        sock.write_all(&frame(6, b"\xfe\x00\x00\x00\x00")).unwrap();

        // COM_QUIT, then the peer goes away
        let quit = read_frame(&mut sock);
        assert_eq!(quit[0], protocol::COM_QUIT);
    }

    fn drive_until_done(drv: &mut MariaDb) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        let mut wake = Wake::Resume;
        for _ in 0..10_000 {
            match drv.step(wake).unwrap() {
                Step::Continue => wake = Wake::Resume,
                Step::Wait(_) => {
                    std::thread::sleep(Duration::from_millis(1));
                    wake = Wake::Ready(Ready::READABLE | Ready::WRITABLE);
                }
                Step::Event(ev) => {
                    events.push(ev);
                    wake = Wake::Resume;
                }
                Step::BatchDone => return events,
                Step::Closed => panic!("closed mid-batch"),
            }
        }
        panic!("state machine did not settle");
    }

    #[test]
    fn connects_queries_and_closes_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || scripted_server(listener));

        let mut cfg = PoolConfig::new("t", ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap());
        cfg.conn.port = port;
        cfg.driver = DriverSelect::Name(ByteStr::from_static("mariadb"));

        let mut drv = MariaDb::new(&cfg);
        assert!(drv.is_closed());

        drv.begin_batch(ByteStr::from_static("SELECT x FROM t")).unwrap();
        let events = drive_until_done(&mut drv);

        assert!(matches!(drv.state(), ConnState::Query(Phase::Done)));
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], BatchEvent::ResultReady(rs) if rs.columns == 1));
        assert!(matches!(&events[1], BatchEvent::Row(r) if r.values[0].as_deref() == Some("a")));
        assert!(matches!(&events[2], BatchEvent::Row(r) if r.values[0].as_deref() == Some("b")));
        assert!(matches!(&events[3], BatchEvent::ResultFreed));

        drv.start_close();
        let mut wake = Wake::Resume;
        for _ in 0..10_000 {
            match drv.step(wake).unwrap() {
                Step::Closed => break,
                Step::Wait(_) => {
                    std::thread::sleep(Duration::from_millis(1));
                    wake = Wake::Ready(Ready::READABLE | Ready::WRITABLE);
                }
                _ => wake = Wake::Resume,
            }
        }
        assert!(drv.is_closed());

        server.join().unwrap();
    }

    #[test]
    fn refusing_tls_downgrade_is_a_config_error() {
        let mut cfg =
            PoolConfig::new("t", ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap());
        cfg.skip_tls = false;

        let mut drv = MariaDb::new(&cfg);
        drv.begin_batch(ByteStr::from_static("SELECT 1")).unwrap();
        assert!(drv.step(Wake::Resume).is_err());
    }

    #[test]
    fn timeout_mid_protocol_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut cfg =
            PoolConfig::new("t", ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap());
        cfg.conn.port = port;

        let mut drv = MariaDb::new(&cfg);
        drv.begin_batch(ByteStr::from_static("SELECT 1")).unwrap();

        // connect start wants writability; a deadline instead is fatal
        assert!(matches!(drv.step(Wake::Resume).unwrap(), Step::Wait(_)));
        assert!(drv.step(Wake::TimedOut).is_err());
    }

    #[test]
    fn begin_batch_rejected_mid_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut cfg =
            PoolConfig::new("t", ConnConfig::parse("mariadb://u:p@127.0.0.1:3306/d").unwrap());
        cfg.conn.port = port;

        let mut drv = MariaDb::new(&cfg);
        drv.begin_batch(ByteStr::from_static("SELECT 1")).unwrap();
        drv.step(Wake::Resume).unwrap();
        assert!(drv.begin_batch(ByteStr::from_static("SELECT 2")).is_err());
    }
}
