//! Low-level MySQL wire decoding.
//!
//! `ByteReader` is a bounds-checked cursor over one packet or event body.
//! The packet parsers cover what the pipeline needs: handshake, OK/ERR/EOF
//! recognition, column definitions, and text-protocol rows.

use quiver_core::error::{Error, Result};

/// End-of-stream / EOF packet header byte.
pub const EOF_HEADER: u8 = 0xfe;
/// Error packet header byte.
pub const ERR_HEADER: u8 = 0xff;
/// OK packet header byte.
pub const OK_HEADER: u8 = 0x00;
/// NULL cell marker in a text-protocol row.
pub const NULL_CELL: u8 = 0xfb;

/// Bounds-checked forward cursor over a byte buffer.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Jump to an absolute offset.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when fully consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated() -> Error {
        Error::InvalidRowData("truncated buffer".into())
    }

    /// Take `n` raw bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Self::truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// One byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Little-endian u16.
    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Little-endian u24.
    pub fn u24_le(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    /// Little-endian u32.
    pub fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Little-endian u48.
    pub fn u48_le(&mut self) -> Result<u64> {
        let b = self.take(6)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0]))
    }

    /// Little-endian u64.
    pub fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Length-encoded integer.
    pub fn lenenc_int(&mut self) -> Result<u64> {
        let first = self.u8()?;
        match first {
            0..=0xfa => Ok(first as u64),
            0xfc => Ok(self.u16_le()? as u64),
            0xfd => Ok(self.u24_le()? as u64),
            0xfe => self.u64_le(),
            _ => Err(Error::InvalidRowData(format!(
                "invalid length-encoded integer prefix {first:#x}"
            ))),
        }
    }

    /// Length-encoded byte string.
    pub fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()? as usize;
        self.take(len)
    }

    /// NUL-terminated byte string (terminator consumed).
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            if self.buf[self.pos] == 0 {
                let slice = &self.buf[start..self.pos];
                self.pos += 1;
                return Ok(slice);
            }
            self.pos += 1;
        }
        Err(Self::truncated())
    }

    /// Everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Big-endian integer of `len` bytes (the "mi_uint" family used by the
/// date/time storage formats).
pub fn be_uint(bytes: &[u8], len: usize) -> u64 {
    let mut value = 0u64;
    for &b in &bytes[..len] {
        value = (value << 8) | b as u64;
    }
    value
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Server's initial handshake.
#[derive(Debug)]
pub struct HandshakePacket {
    /// Always 10 for the servers we speak to
    pub protocol_version: u8,
    /// Human-readable server version
    pub server_version: String,
    /// Connection id
    pub connection_id: u32,
    /// 20-byte auth plugin seed
    pub auth_seed: Vec<u8>,
    /// Advertised capability flags
    pub capabilities: u32,
    /// Auth plugin name, usually `mysql_native_password`
    pub auth_plugin: String,
}

impl HandshakePacket {
    /// Parse the handshake payload.
    pub fn parse(payload: &[u8]) -> Result<HandshakePacket> {
        let mut reader = ByteReader::new(payload);
        let protocol_version = reader.u8()?;
        let server_version = String::from_utf8_lossy(reader.null_terminated()?).into_owned();
        let connection_id = reader.u32_le()?;
        let mut auth_seed = reader.take(8)?.to_vec();
        reader.skip(1)?; // filler
        let cap_low = reader.u16_le()? as u32;
        let mut capabilities = cap_low;
        let mut auth_plugin = String::new();
        if reader.remaining() > 0 {
            reader.skip(1)?; // charset
            reader.skip(2)?; // status flags
            let cap_high = reader.u16_le()? as u32;
            capabilities |= cap_high << 16;
            let auth_data_len = reader.u8()?;
            reader.skip(10)?; // reserved
            if capabilities & capability::SECURE_CONNECTION != 0 {
                let extra = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
                let part = reader.take(extra)?;
                // Trailing NUL is not part of the seed
                let part = part.strip_suffix(&[0]).unwrap_or(part);
                auth_seed.extend_from_slice(part);
            }
            if capabilities & capability::PLUGIN_AUTH != 0 {
                auth_plugin = String::from_utf8_lossy(reader.null_terminated()?).into_owned();
            }
        }
        Ok(HandshakePacket {
            protocol_version,
            server_version,
            connection_id,
            auth_seed,
            capabilities,
            auth_plugin,
        })
    }
}

/// Client capability flags used by the connector.
pub mod capability {
    /// CLIENT_LONG_PASSWORD
    pub const LONG_PASSWORD: u32 = 0x0000_0001;
    /// CLIENT_LONG_FLAG
    pub const LONG_FLAG: u32 = 0x0000_0004;
    /// CLIENT_CONNECT_WITH_DB
    pub const CONNECT_WITH_DB: u32 = 0x0000_0008;
    /// CLIENT_PROTOCOL_41
    pub const PROTOCOL_41: u32 = 0x0000_0200;
    /// CLIENT_TRANSACTIONS
    pub const TRANSACTIONS: u32 = 0x0000_2000;
    /// CLIENT_SECURE_CONNECTION
    pub const SECURE_CONNECTION: u32 = 0x0000_8000;
    /// CLIENT_PLUGIN_AUTH
    pub const PLUGIN_AUTH: u32 = 0x0008_0000;
}

/// Decoded ERR packet.
#[derive(Debug)]
pub struct ErrPacket {
    /// Server error code
    pub code: u16,
    /// Error message
    pub message: String,
}

impl ErrPacket {
    /// Parse an ERR payload (first byte already known to be 0xFF).
    pub fn parse(payload: &[u8]) -> Result<ErrPacket> {
        let mut reader = ByteReader::new(payload);
        reader.skip(1)?;
        let code = reader.u16_le()?;
        let mut rest = reader.rest();
        // Optional SQL-state marker
        if rest.first() == Some(&b'#') && rest.len() >= 6 {
            rest = &rest[6..];
        }
        Ok(ErrPacket {
            code,
            message: String::from_utf8_lossy(rest).into_owned(),
        })
    }
}

/// True for an EOF packet (0xFE with a short payload).
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() < 9
}

/// Map an ERR payload into the unified error.
pub fn err_to_error(payload: &[u8]) -> Error {
    match ErrPacket::parse(payload) {
        Ok(err) => Error::ExecuteMysql(format!("server error {}: {}", err.code, err.message)),
        Err(_) => Error::ExecuteMysql("malformed error packet".into()),
    }
}

/// Column definition of a text-protocol result set.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Column name (alias)
    pub name: String,
    /// Collation id
    pub charset: u16,
    /// Display length
    pub length: u32,
    /// MySQL type code
    pub type_code: u8,
    /// Column flags
    pub flags: u16,
    /// Decimal digits
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Parse a column-definition payload.
    pub fn parse(payload: &[u8]) -> Result<ColumnDefinition> {
        let mut reader = ByteReader::new(payload);
        reader.lenenc_bytes()?; // catalog
        reader.lenenc_bytes()?; // schema
        reader.lenenc_bytes()?; // table
        reader.lenenc_bytes()?; // org_table
        let name = String::from_utf8_lossy(reader.lenenc_bytes()?).into_owned();
        reader.lenenc_bytes()?; // org_name
        reader.lenenc_int()?; // fixed-length fields marker
        let charset = reader.u16_le()?;
        let length = reader.u32_le()?;
        let type_code = reader.u8()?;
        let flags = reader.u16_le()?;
        let decimals = reader.u8()?;
        Ok(ColumnDefinition {
            name,
            charset,
            length,
            type_code,
            flags,
            decimals,
        })
    }
}

/// Parse a text-protocol row into optional cells (NULL = `None`).
pub fn parse_text_row(payload: &[u8], columns: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut reader = ByteReader::new(payload);
    let mut cells = Vec::with_capacity(columns);
    for _ in 0..columns {
        if reader.remaining() == 0 {
            return Err(Error::InvalidMysqlResult("row shorter than column count".into()));
        }
        if reader.buf_peek() == NULL_CELL {
            reader.skip(1)?;
            cells.push(None);
        } else {
            cells.push(Some(reader.lenenc_bytes()?.to_vec()));
        }
    }
    Ok(cells)
}

impl<'a> ByteReader<'a> {
    fn buf_peek(&self) -> u8 {
        self.buf[self.pos]
    }
}

/// mysql_native_password scramble:
/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`.
pub fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    if password.is_empty() {
        return Vec::new();
    }
    let pass_hash = Sha1::digest(password.as_bytes());
    let pass_hash_hash = Sha1::digest(pass_hash);
    let mut seeded = Sha1::new();
    seeded.update(seed);
    seeded.update(pass_hash_hash);
    let rhs = seeded.finalize();
    pass_hash
        .iter()
        .zip(rhs.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}
