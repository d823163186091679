//! MySQL connection management.
//!
//! `Connector` is the seam the whole pipeline runs against; `TcpConnector`
//! is the real implementation (std TcpStream, hand-rolled handshake with
//! mysql_native_password, COM_QUERY text protocol, raw packet reads for the
//! dump stream). `ConnectorManager` pools connectors; `ConnectorProxy`
//! checks one out and returns it on drop.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use quiver_core::error::{Error, Result};

use crate::packet::{
    self, capability, native_password_scramble, ColumnDefinition, HandshakePacket,
};

/// COM_QUERY command byte.
pub const COM_QUERY: u8 = 0x03;
/// COM_BINLOG_DUMP command byte.
pub const COM_BINLOG_DUMP: u8 = 0x12;

/// Column flag: unsigned integer.
pub const UNSIGNED_FLAG: u32 = 32;
/// Column flag: binary collation.
pub const BINARY_FLAG: u32 = 128;
/// Column flag: ENUM.
pub const ENUM_FLAG: u32 = 256;
/// Column flag: auto-increment.
pub const AUTO_INCREMENT_FLAG: u32 = 512;
/// Column flag: SET.
pub const SET_FLAG: u32 = 2048;

/// Parsed `mysql://host[:port]/database` uri.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MysqlUri {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Database (schema) name
    pub database: String,
}

impl MysqlUri {
    /// Parse the connection uri.
    pub fn parse(uri: &str) -> Result<MysqlUri> {
        let rest = uri
            .strip_prefix("mysql://")
            .ok_or_else(|| Error::InvalidArgument(format!("not a mysql uri: {uri}")))?;
        let (authority, database) = match rest.split_once('/') {
            Some((a, d)) if !d.is_empty() => (a, d),
            _ => return Err(Error::InvalidArgument("uri is missing the database".into())),
        };
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (
                h,
                p.parse::<u16>()
                    .map_err(|_| Error::InvalidArgument(format!("bad port in uri: {uri}")))?,
            ),
            None => (authority, 3306),
        };
        if host.is_empty() {
            return Err(Error::InvalidArgument("uri is missing the host".into()));
        }
        Ok(MysqlUri {
            host: host.to_string(),
            port,
            database: database.to_string(),
        })
    }
}

/// Metadata of one result-set column.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    /// Column name
    pub name: String,
    /// MySQL type code
    pub type_code: u8,
    /// Display length
    pub length: u32,
    /// Decimal digits
    pub decimals: u32,
    /// Column flags
    pub flags: u32,
}

impl FieldMeta {
    /// Unsigned integer column.
    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    /// Auto-increment column.
    pub fn is_auto_increment(&self) -> bool {
        self.flags & AUTO_INCREMENT_FLAG != 0
    }
}

impl From<ColumnDefinition> for FieldMeta {
    fn from(def: ColumnDefinition) -> Self {
        FieldMeta {
            name: def.name,
            type_code: def.type_code,
            length: def.length,
            decimals: def.decimals as u32,
            flags: def.flags as u32,
        }
    }
}

/// One text-protocol row; `None` cells are SQL NULL.
#[derive(Debug, Clone, Default)]
pub struct MysqlRow {
    cells: Vec<Option<Vec<u8>>>,
}

impl MysqlRow {
    /// Row from decoded cells.
    pub fn new(cells: Vec<Option<Vec<u8>>>) -> Self {
        MysqlRow { cells }
    }

    /// Cell bytes; `None` for NULL or out-of-range.
    pub fn field_value(&self, idx: usize) -> Option<&[u8]> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }

    /// Cell length in bytes; 0 for NULL.
    pub fn field_length(&self, idx: usize) -> usize {
        self.field_value(idx).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True for a zero-column row.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Buffered result of one statement.
#[derive(Debug, Default)]
pub struct MysqlResultSet {
    /// Column metadata
    pub fields: Vec<FieldMeta>,
    rows: VecDeque<MysqlRow>,
}

impl MysqlResultSet {
    /// Result set from decoded parts.
    pub fn new(fields: Vec<FieldMeta>, rows: Vec<MysqlRow>) -> Self {
        MysqlResultSet {
            fields,
            rows: rows.into(),
        }
    }

    /// Number of columns.
    pub fn fields_num(&self) -> usize {
        self.fields.len()
    }

    /// Number of buffered rows.
    pub fn rows_num(&self) -> usize {
        self.rows.len()
    }

    /// Column metadata by position.
    pub fn field_meta(&self, idx: usize) -> Option<&FieldMeta> {
        self.fields.get(idx)
    }

    /// Pop the next row.
    pub fn next(&mut self) -> Option<MysqlRow> {
        self.rows.pop_front()
    }
}

/// Connection seam used by every reader.
pub trait Connector: Send {
    /// Establish the connection and authenticate.
    fn connect(&mut self) -> Result<()>;

    /// Drop and re-establish the connection; true on success.
    fn reconnect(&mut self) -> bool;

    /// Run a statement and buffer the whole result.
    fn execute_query(&mut self, sql: &str) -> Result<MysqlResultSet>;

    /// Run a statement and leave the rows on the wire; returns the column
    /// metadata. Rows come from `fetch_stream_row`.
    fn execute_streaming_query(&mut self, sql: &str) -> Result<Vec<FieldMeta>>;

    /// Next streamed row; `None` once the set is drained.
    fn fetch_stream_row(&mut self) -> Result<Option<MysqlRow>>;

    /// Send a raw command packet (e.g. COM_BINLOG_DUMP) and swallow no reply.
    fn execute_simple_command(&mut self, command: u8, payload: &[u8]) -> Result<()>;

    /// Read one raw packet payload off the wire (dump stream).
    fn read_packet(&mut self) -> Result<Vec<u8>>;

    /// Connection uri.
    fn uri(&self) -> &MysqlUri;
}

// ---------------------------------------------------------------------------
// TCP implementation
// ---------------------------------------------------------------------------

struct PacketChannel {
    stream: TcpStream,
    sequence: u8,
}

impl PacketChannel {
    fn connect(host: &str, port: u16) -> Result<PacketChannel> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| Error::ConnectMysql(format!("{host}:{port}: {e}")))?;
        Ok(PacketChannel { stream, sequence: 0 })
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| Error::ConnectMysql(format!("read packet header: {e}")))?;
        let len = (&header[..3]).read_u24::<LittleEndian>().unwrap() as usize;
        self.sequence = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| Error::ConnectMysql(format!("read packet body: {e}")))?;
        Ok(payload)
    }

    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame
            .write_u24::<LittleEndian>(payload.len() as u32)
            .unwrap();
        frame.write_u8(self.sequence).unwrap();
        frame.extend_from_slice(payload);
        self.stream
            .write_all(&frame)
            .map_err(|e| Error::ConnectMysql(format!("write packet: {e}")))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    fn reset_sequence(&mut self) {
        self.sequence = 0;
    }
}

/// Real connector over a TCP stream.
pub struct TcpConnector {
    uri: MysqlUri,
    user: String,
    password: String,
    channel: Option<PacketChannel>,
    stream_columns: usize,
    streaming: bool,
}

impl TcpConnector {
    /// Connector for the given account; call `connect` before use.
    pub fn new(uri: MysqlUri, user: &str, password: &str) -> Self {
        TcpConnector {
            uri,
            user: user.to_string(),
            password: password.to_string(),
            channel: None,
            stream_columns: 0,
            streaming: false,
        }
    }

    fn channel(&mut self) -> Result<&mut PacketChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| Error::ConnectMysql("not connected".into()))
    }

    fn handshake(&mut self) -> Result<()> {
        let user = self.user.clone();
        let password = self.password.clone();
        let database = self.uri.database.clone();

        let channel = self.channel()?;
        let payload = channel.read_packet()?;
        if payload.first() == Some(&packet::ERR_HEADER) {
            return Err(packet::err_to_error(&payload));
        }
        let handshake = HandshakePacket::parse(&payload)?;
        debug!(
            server = handshake.server_version.as_str(),
            "mysql handshake received"
        );

        let caps = capability::LONG_PASSWORD
            | capability::LONG_FLAG
            | capability::CONNECT_WITH_DB
            | capability::PROTOCOL_41
            | capability::TRANSACTIONS
            | capability::SECURE_CONNECTION
            | capability::PLUGIN_AUTH;
        let scramble = native_password_scramble(&password, &handshake.auth_seed);

        let mut response = Vec::with_capacity(128);
        response.write_u32::<LittleEndian>(caps).unwrap();
        response.write_u32::<LittleEndian>(16 * 1024 * 1024).unwrap();
        response.push(33); // utf8_general_ci
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(user.as_bytes());
        response.push(0);
        response.push(scramble.len() as u8);
        response.extend_from_slice(&scramble);
        response.extend_from_slice(database.as_bytes());
        response.push(0);
        response.extend_from_slice(b"mysql_native_password\0");
        channel.write_packet(&response)?;

        let reply = channel.read_packet()?;
        match reply.first() {
            Some(&packet::OK_HEADER) => Ok(()),
            Some(&packet::ERR_HEADER) => Err(packet::err_to_error(&reply)),
            Some(&packet::EOF_HEADER) => {
                // Auth plugin switch: re-scramble against the new seed
                let mut reader = packet::ByteReader::new(&reply[1..]);
                let _plugin = reader.null_terminated()?;
                let seed = reader.rest();
                let seed = seed.strip_suffix(&[0]).unwrap_or(seed);
                let scramble = native_password_scramble(&password, seed);
                channel.write_packet(&scramble)?;
                let reply = channel.read_packet()?;
                match reply.first() {
                    Some(&packet::OK_HEADER) => Ok(()),
                    _ => Err(packet::err_to_error(&reply)),
                }
            }
            _ => Err(Error::ConnectMysql("unexpected auth reply".into())),
        }
    }

    fn send_query(&mut self, sql: &str) -> Result<()> {
        if self.streaming {
            // Drain an abandoned stream before reusing the connection
            while self.fetch_stream_row()?.is_some() {}
        }
        let channel = self.channel()?;
        channel.reset_sequence();
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        channel.write_packet(&payload)
    }

    fn read_result_header(&mut self) -> Result<Vec<FieldMeta>> {
        let channel = self.channel()?;
        let payload = channel.read_packet()?;
        match payload.first() {
            Some(&packet::OK_HEADER) => Ok(Vec::new()),
            Some(&packet::ERR_HEADER) => Err(packet::err_to_error(&payload)),
            _ => {
                let mut reader = packet::ByteReader::new(&payload);
                let column_count = reader.lenenc_int()? as usize;
                let mut fields = Vec::with_capacity(column_count);
                loop {
                    let payload = self.channel()?.read_packet()?;
                    if packet::is_eof_packet(&payload) {
                        break;
                    }
                    fields.push(FieldMeta::from(ColumnDefinition::parse(&payload)?));
                }
                if fields.len() != column_count {
                    return Err(Error::InvalidMysqlResult(format!(
                        "expected {column_count} column definitions, got {}",
                        fields.len()
                    )));
                }
                Ok(fields)
            }
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> Result<()> {
        self.channel = Some(PacketChannel::connect(&self.uri.host, self.uri.port)?);
        self.streaming = false;
        self.handshake()?;
        info!(host = self.uri.host.as_str(), "mysql connection established");
        Ok(())
    }

    fn reconnect(&mut self) -> bool {
        self.channel = None;
        match self.connect() {
            Ok(()) => true,
            Err(err) => {
                warn!(code = err.code(), "mysql reconnect failed");
                false
            }
        }
    }

    fn execute_query(&mut self, sql: &str) -> Result<MysqlResultSet> {
        self.send_query(sql)?;
        let fields = self.read_result_header()?;
        if fields.is_empty() {
            return Ok(MysqlResultSet::default());
        }
        let columns = fields.len();
        let mut rows = Vec::new();
        loop {
            let payload = self.channel()?.read_packet()?;
            if packet::is_eof_packet(&payload) {
                break;
            }
            if payload.first() == Some(&packet::ERR_HEADER) {
                return Err(packet::err_to_error(&payload));
            }
            rows.push(MysqlRow::new(packet::parse_text_row(&payload, columns)?));
        }
        Ok(MysqlResultSet::new(fields, rows))
    }

    fn execute_streaming_query(&mut self, sql: &str) -> Result<Vec<FieldMeta>> {
        self.send_query(sql)?;
        let fields = self.read_result_header()?;
        self.stream_columns = fields.len();
        self.streaming = !fields.is_empty();
        Ok(fields)
    }

    fn fetch_stream_row(&mut self) -> Result<Option<MysqlRow>> {
        if !self.streaming {
            return Ok(None);
        }
        let columns = self.stream_columns;
        let payload = self.channel()?.read_packet()?;
        if packet::is_eof_packet(&payload) {
            self.streaming = false;
            return Ok(None);
        }
        if payload.first() == Some(&packet::ERR_HEADER) {
            self.streaming = false;
            return Err(packet::err_to_error(&payload));
        }
        Ok(Some(MysqlRow::new(packet::parse_text_row(
            &payload, columns,
        )?)))
    }

    fn execute_simple_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        let channel = self.channel()?;
        channel.reset_sequence();
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(command);
        frame.extend_from_slice(payload);
        channel
            .write_packet(&frame)
            .map_err(|e| Error::ExecuteSimpleCommand(e.to_string()))
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let payload = self.channel()?.read_packet()?;
        if payload.first() == Some(&packet::ERR_HEADER) {
            return Err(packet::err_to_error(&payload));
        }
        Ok(payload)
    }

    fn uri(&self) -> &MysqlUri {
        &self.uri
    }
}

// ---------------------------------------------------------------------------
// Pooling
// ---------------------------------------------------------------------------

/// Factory producing connected connectors.
pub type ConnectorFactory = Box<dyn Fn() -> Result<Box<dyn Connector>> + Send + Sync>;

/// Multi-producer/consumer connector pool.
pub struct ConnectorManager {
    factory: ConnectorFactory,
    pool: Mutex<VecDeque<Box<dyn Connector>>>,
}

impl ConnectorManager {
    /// Manager over TCP connectors for one account.
    pub fn new(uri: MysqlUri, user: &str, password: &str) -> Arc<Self> {
        let user = user.to_string();
        let password = password.to_string();
        Self::with_factory(Box::new(move || {
            let mut connector = TcpConnector::new(uri.clone(), &user, &password);
            connector.connect()?;
            Ok(Box::new(connector) as Box<dyn Connector>)
        }))
    }

    /// Manager over an arbitrary factory (tests use scripted connectors).
    pub fn with_factory(factory: ConnectorFactory) -> Arc<Self> {
        Arc::new(ConnectorManager {
            factory,
            pool: Mutex::new(VecDeque::new()),
        })
    }

    /// Check a connector out of the pool, creating one when empty.
    pub fn get(self: &Arc<Self>) -> Result<ConnectorProxy> {
        let connector = match self.pool.lock().pop_front() {
            Some(connector) => connector,
            None => (self.factory)()?,
        };
        Ok(ConnectorProxy {
            manager: self.clone(),
            connector: Some(connector),
        })
    }

    fn put(&self, connector: Box<dyn Connector>) {
        self.pool.lock().push_back(connector);
    }
}

/// Scoped checkout of a pooled connector; returns it on drop.
pub struct ConnectorProxy {
    manager: Arc<ConnectorManager>,
    connector: Option<Box<dyn Connector>>,
}

impl ConnectorProxy {
    /// The checked-out connector.
    pub fn connector(&mut self) -> &mut dyn Connector {
        self.connector
            .as_mut()
            .expect("connector present until drop")
            .as_mut()
    }
}

impl Drop for ConnectorProxy {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            self.manager.put(connector);
        }
    }
}
