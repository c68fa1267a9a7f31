//! MariaDB client/server packet codecs.
//!
//! Text protocol only: handshake + `mysql_native_password`, `COM_QUERY`
//! with multi-statement result streams, `COM_QUIT`. Layouts follow
//! <https://mariadb.com/kb/en/clientserver-protocol/>.
use std::{borrow::Cow, fmt};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::common::ByteStr;

// Client capability bits.
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

/// Server status bit: another result set follows the current one.
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

const MAX_PACKET_SIZE: u32 = 0x0100_0000;
const UTF8MB4_GENERAL_CI: u8 = 45;
const NATIVE_AUTH_PLUGIN: &str = "mysql_native_password";

/// The server sent something the protocol layer cannot make sense of.
pub struct ProtocolError {
    reason: Cow<'static, str>,
}

impl ProtocolError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.reason)
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An `ERR` packet: the server rejected a statement or the session.
pub struct ServerError {
    pub code: u16,
    pub sqlstate: ByteStr,
    pub message: ByteStr,
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}", self.code)?;
        if !self.sqlstate.is_empty() {
            write!(f, " ({})", self.sqlstate)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

type Result<T, E = ProtocolError> = std::result::Result<T, E>;

// ===== primitive readers =====

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::new("unexpected end of packet"));
    }
    Ok(buf.get_u8())
}

fn get_u16_le(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::new("unexpected end of packet"));
    }
    Ok(buf.get_u16_le())
}

fn get_u32_le(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::new("unexpected end of packet"));
    }
    Ok(buf.get_u32_le())
}

fn get_bytes(buf: &mut Bytes, n: usize) -> Result<Bytes> {
    if buf.remaining() < n {
        return Err(ProtocolError::new("unexpected end of packet"));
    }
    Ok(buf.split_to(n))
}

fn skip(buf: &mut Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::new("unexpected end of packet"));
    }
    buf.advance(n);
    Ok(())
}

fn get_nul_bytestr(buf: &mut Bytes) -> Result<ByteStr> {
    let end = buf
        .iter()
        .position(|b| *b == b'\0')
        .ok_or_else(|| ProtocolError::new("string not nul terminated"))?;
    let raw = buf.split_to(end);
    buf.advance(1); // nul
    ByteStr::from_utf8(raw).map_err(|_| ProtocolError::new("string not utf-8"))
}

/// Length-encoded integer.
pub fn get_lenenc_int(buf: &mut Bytes) -> Result<u64> {
    match get_u8(buf)? {
        v @ 0..=0xFA => Ok(v as u64),
        0xFC => Ok(get_u16_le(buf)? as u64),
        0xFD => {
            let raw = get_bytes(buf, 3)?;
            Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) as u64)
        }
        0xFE => {
            let raw = get_bytes(buf, 8)?;
            Ok(u64::from_le_bytes(raw[..].try_into().expect("length checked")))
        }
        _ => Err(ProtocolError::new("invalid length-encoded integer")),
    }
}

// ===== handshake =====

/// Decoded initial handshake (server greeting).
#[derive(Debug)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: ByteStr,
    pub connection_id: u32,
    pub seed: Vec<u8>,
    pub capabilities: u32,
    pub auth_plugin: Option<ByteStr>,
}

pub fn decode_handshake(mut payload: Bytes) -> Result<Handshake> {
    let protocol_version = get_u8(&mut payload)?;
    if protocol_version != 10 {
        return Err(ProtocolError::new("unsupported handshake protocol version"));
    }
    let server_version = get_nul_bytestr(&mut payload)?;
    let connection_id = get_u32_le(&mut payload)?;

    let mut seed = get_bytes(&mut payload, 8)?.to_vec();
    skip(&mut payload, 1)?; // filler

    let mut capabilities = get_u16_le(&mut payload)? as u32;
    let _collation = get_u8(&mut payload)?;
    let _status = get_u16_le(&mut payload)?;
    capabilities |= (get_u16_le(&mut payload)? as u32) << 16;

    let plugin_data_len = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        get_u8(&mut payload)?
    } else {
        skip(&mut payload, 1)?;
        0
    };

    // 6 reserved bytes, then 4 the server uses for its extended
    // capability bits, which this client does not negotiate
    skip(&mut payload, 6)?;
    skip(&mut payload, 4)?;

    if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let len = usize::max(12, (plugin_data_len as usize).saturating_sub(9));
        seed.extend_from_slice(&get_bytes(&mut payload, len)?);
        skip(&mut payload, 1)?; // reserved
    }

    let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        Some(get_nul_bytestr(&mut payload)?)
    } else {
        None
    };

    Ok(Handshake {
        protocol_version,
        server_version,
        connection_id,
        seed,
        capabilities,
        auth_plugin,
    })
}

/// `mysql_native_password` scramble:
/// `SHA1(pass) XOR SHA1(seed + SHA1(SHA1(pass)))`.
///
/// Empty for an empty password, per the protocol.
pub fn scramble_native(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let pass_hash = Sha1::digest(password.as_bytes());
    let pass_hash_hash = Sha1::digest(pass_hash);

    let mut salted = Sha1::new();
    salted.update(seed);
    salted.update(pass_hash_hash);
    let salted = salted.finalize();

    pass_hash
        .iter()
        .zip(salted.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Capabilities this client asks for, given the server's offer.
pub fn client_capabilities(server: u32, with_db: bool) -> Result<u32> {
    if server & CLIENT_PROTOCOL_41 == 0 {
        return Err(ProtocolError::new("server does not speak protocol 4.1"));
    }
    if server & CLIENT_SECURE_CONNECTION == 0 {
        return Err(ProtocolError::new("server does not offer secure auth"));
    }
    let mut caps = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS;
    if server & CLIENT_PLUGIN_AUTH != 0 {
        caps |= CLIENT_PLUGIN_AUTH;
    }
    if with_db {
        caps |= CLIENT_CONNECT_WITH_DB;
    }
    Ok(caps)
}

/// Encode the `HandshakeResponse41` payload.
pub fn encode_handshake_response(
    buf: &mut BytesMut,
    capabilities: u32,
    user: &str,
    scramble: &[u8],
    db: Option<&str>,
) {
    buf.put_u32_le(capabilities);
    buf.put_u32_le(MAX_PACKET_SIZE);
    buf.put_u8(UTF8MB4_GENERAL_CI);
    buf.put_bytes(0, 23);

    buf.put(user.as_bytes());
    buf.put_u8(0);

    buf.put_u8(scramble.len() as u8);
    buf.put(scramble);

    if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        buf.put(db.unwrap_or_default().as_bytes());
        buf.put_u8(0);
    }
    if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        buf.put(NATIVE_AUTH_PLUGIN.as_bytes());
        buf.put_u8(0);
    }
}

// ===== command responses =====

/// Decoded `OK` packet.
#[derive(Debug, Clone, Copy)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn more_results(&self) -> bool {
        self.status & SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Decode an `OK` packet, header byte included.
pub fn decode_ok(mut payload: Bytes) -> Result<OkPacket> {
    let header = get_u8(&mut payload)?;
    if header != 0x00 && header != 0xFE {
        return Err(ProtocolError::new("not an OK packet"));
    }
    Ok(OkPacket {
        affected_rows: get_lenenc_int(&mut payload)?,
        last_insert_id: get_lenenc_int(&mut payload)?,
        status: get_u16_le(&mut payload)?,
        warnings: get_u16_le(&mut payload)?,
    })
}

/// Decode an `ERR` packet, header byte included.
pub fn decode_err(mut payload: Bytes) -> Result<ServerError> {
    let header = get_u8(&mut payload)?;
    if header != 0xFF {
        return Err(ProtocolError::new("not an ERR packet"));
    }
    let code = get_u16_le(&mut payload)?;
    let sqlstate = if payload.first() == Some(&b'#') {
        skip(&mut payload, 1)?;
        let raw = get_bytes(&mut payload, 5)?;
        ByteStr::from_utf8(raw).map_err(|_| ProtocolError::new("sqlstate not utf-8"))?
    } else {
        ByteStr::default()
    };
    let message = ByteStr::from_utf8(payload)
        .map_err(|_| ProtocolError::new("error message not utf-8"))?;
    Ok(ServerError { code, sqlstate, message })
}

/// Decoded `EOF` packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: u16,
}

impl EofPacket {
    pub fn more_results(&self) -> bool {
        self.status & SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// An `EOF` packet is a `0xFE` header with fewer than 9 payload bytes.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

pub fn decode_eof(mut payload: Bytes) -> Result<EofPacket> {
    let header = get_u8(&mut payload)?;
    if header != 0xFE {
        return Err(ProtocolError::new("not an EOF packet"));
    }
    Ok(EofPacket {
        warnings: get_u16_le(&mut payload)?,
        status: get_u16_le(&mut payload)?,
    })
}

/// First packet of a `COM_QUERY` response stream.
pub enum QueryResponse {
    /// The statement produced no rows.
    Ok(OkPacket),
    /// A result set follows: this many column definitions, then rows.
    ResultSet { columns: u64 },
    /// The statement was rejected.
    Err(ServerError),
}

pub fn decode_query_response(payload: Bytes) -> Result<QueryResponse> {
    match payload.first() {
        None => Err(ProtocolError::new("empty query response")),
        Some(0x00) => Ok(QueryResponse::Ok(decode_ok(payload)?)),
        Some(0xFF) => Ok(QueryResponse::Err(decode_err(payload)?)),
        Some(0xFB) => Err(ProtocolError::new("LOCAL INFILE is not supported")),
        Some(_) => {
            let mut payload = payload;
            let columns = get_lenenc_int(&mut payload)?;
            if columns == 0 {
                return Err(ProtocolError::new("result set with zero columns"));
            }
            Ok(QueryResponse::ResultSet { columns })
        }
    }
}

/// Decode one text-protocol row; `0xFB` marks SQL NULL.
pub fn decode_text_row(mut payload: Bytes, columns: u64) -> Result<Vec<Option<ByteStr>>> {
    let mut values = Vec::with_capacity(columns as usize);
    for _ in 0..columns {
        if payload.first() == Some(&0xFB) {
            payload.advance(1);
            values.push(None);
            continue;
        }
        let len = get_lenenc_int(&mut payload)? as usize;
        let raw = get_bytes(&mut payload, len)?;
        let value = ByteStr::from_utf8(raw)
            .map_err(|_| ProtocolError::new("column value not utf-8"))?;
        values.push(Some(value));
    }
    Ok(values)
}

/// Encode the `COM_QUERY` payload.
pub fn encode_com_query(buf: &mut BytesMut, sql: &[u8]) {
    buf.reserve(sql.len() + 1);
    buf.put_u8(COM_QUERY);
    buf.put(sql);
}

#[cfg(test)]
mod test {
    use super::*;

    // a genuine 10.4 server greeting
    const GREETING: &[u8] = b"\
        \n\
        5.5.5-10.4.6-MariaDB-1:10.4.6+maria~bionic\0\
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

    #[test]
    fn decodes_initial_handshake() {
        let hs = decode_handshake(Bytes::from_static(GREETING)).unwrap();

        assert_eq!(hs.protocol_version, 10);
        assert!(hs.server_version.starts_with("5.5.5-10.4.6-MariaDB"));
        assert_eq!(hs.connection_id, 0x13);
        assert_eq!(hs.seed.len(), 20);
        assert_eq!(&hs.seed[..8], b"?~~|vZAu");
        assert_eq!(&hs.seed[8..], b"JQ8cihP4Q}Dx");
        assert_eq!(hs.auth_plugin.as_deref(), Some("mysql_native_password"));
        assert!(hs.capabilities & CLIENT_PLUGIN_AUTH != 0);
        assert!(hs.capabilities & CLIENT_SECURE_CONNECTION != 0);
    }

    #[test]
    fn truncated_handshake_is_an_error() {
        assert!(decode_handshake(Bytes::from_static(&GREETING[..30])).is_err());
    }

    #[test]
    fn scramble_shape() {
        let seed: Vec<u8> = (1..=20).collect();

        assert!(scramble_native("", &seed).is_empty());

        let a = scramble_native("secret", &seed);
        assert_eq!(a.len(), 20);
        assert_eq!(a, scramble_native("secret", &seed));
        assert_ne!(a, scramble_native("secret", &seed[1..]));
        assert_ne!(a, scramble_native("Secret", &seed));
    }

    #[test]
    fn decodes_ok_packet() {
        let ok = decode_ok(Bytes::from_static(b"\x00\x03\x00\x08\x00\x01\x00")).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 0);
        assert!(ok.more_results());
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn decodes_err_packet() {
        let err = decode_err(Bytes::from_static(
            b"\xff\x48\x04#42S02Table 'foo.t' doesn't exist",
        ))
        .unwrap();
        assert_eq!(err.code, 0x0448);
        assert_eq!(err.sqlstate, "42S02");
        assert_eq!(err.message, "Table 'foo.t' doesn't exist");
    }

    #[test]
    fn classifies_query_responses() {
        assert!(matches!(
            decode_query_response(Bytes::from_static(b"\x00\x00\x00\x00\x00\x00\x00")).unwrap(),
            QueryResponse::Ok(_)
        ));
        assert!(matches!(
            decode_query_response(Bytes::from_static(b"\x02")).unwrap(),
            QueryResponse::ResultSet { columns: 2 }
        ));
        assert!(matches!(
            decode_query_response(Bytes::from_static(b"\xff\x01\x00msg")).unwrap(),
            QueryResponse::Err(_)
        ));
    }

    #[test]
    fn eof_detection_respects_length_bound() {
        assert!(is_eof(b"\xfe\x00\x00\x02\x00"));
        // a row whose first cell is a 0xFE length prefix is not an EOF
        assert!(!is_eof(b"\xfe\x00\x00\x00\x00\x00\x00\x00\x00\x00"));
    }

    #[test]
    fn decodes_text_row_with_null() {
        let row = decode_text_row(Bytes::from_static(b"\x01a\xfb\x02bc"), 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("a"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("bc"));
    }

    #[test]
    fn lenenc_int_widths() {
        assert_eq!(get_lenenc_int(&mut Bytes::from_static(b"\x20")).unwrap(), 0x20);
        assert_eq!(
            get_lenenc_int(&mut Bytes::from_static(b"\xfc\x34\x12")).unwrap(),
            0x1234
        );
        assert_eq!(
            get_lenenc_int(&mut Bytes::from_static(b"\xfd\x56\x34\x12")).unwrap(),
            0x123456
        );
        assert_eq!(
            get_lenenc_int(&mut Bytes::from_static(b"\xfe\x88\x77\x66\x55\x44\x33\x22\x11"))
                .unwrap(),
            0x1122334455667788
        );
        assert!(get_lenenc_int(&mut Bytes::from_static(b"\xfc\x34")).is_err());
    }
}
