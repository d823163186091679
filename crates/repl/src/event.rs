//! Binlog event decoding (ROW format).
//!
//! Every wire buffer starts with the 19-byte v4 header; the concrete
//! decoders cover the events the reader consumes: QUERY, ROTATE, TABLE_MAP
//! and the WRITE/UPDATE/DELETE rows events (V1 and V2). A rows event keeps
//! an in-event cursor so one event emits its rows across successive `parse`
//! calls.

use std::sync::Arc;

use tracing::error;

use quiver_core::error::{Error, Result};

use crate::packet::ByteReader;

/// v4 event header length.
pub const LOG_EVENT_HEADER_LEN: usize = 19;
/// Trailing checksum length (stripped, never verified: the fetcher turns
/// checksums off at the source).
pub const CRC_LEN: usize = 4;

/// MySQL binlog event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Unrecognized
    Unknown = 0,
    /// ALTER/DDL statements travel as query events
    Query = 2,
    /// End of a binlog file
    Rotate = 4,
    /// The first event of a binlog file
    FormatDescription = 15,
    /// Schema layout for a numeric table id
    TableMap = 19,
    /// Insert, V1
    WriteRowsV1 = 23,
    /// Update, V1
    UpdateRowsV1 = 24,
    /// Delete, V1
    DeleteRowsV1 = 25,
    /// Insert, V2
    WriteRows = 30,
    /// Update, V2
    UpdateRows = 31,
    /// Delete, V2
    DeleteRows = 32,
}

impl EventType {
    /// Map the wire code; unknown codes collapse to `Unknown`.
    pub fn from_code(code: u8) -> EventType {
        match code {
            2 => EventType::Query,
            4 => EventType::Rotate,
            15 => EventType::FormatDescription,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            30 => EventType::WriteRows,
            31 => EventType::UpdateRows,
            32 => EventType::DeleteRows,
            _ => EventType::Unknown,
        }
    }

    /// Any of the six rows events.
    pub fn is_rows(self) -> bool {
        matches!(
            self,
            EventType::WriteRows
                | EventType::UpdateRows
                | EventType::DeleteRows
                | EventType::WriteRowsV1
                | EventType::UpdateRowsV1
                | EventType::DeleteRowsV1
        )
    }

    /// V2 rows events carry a variable-length extra header.
    pub fn is_rows_v2(self) -> bool {
        matches!(
            self,
            EventType::WriteRows | EventType::UpdateRows | EventType::DeleteRows
        )
    }

    /// Update events carry a second present-columns bitmap and two row
    /// images per row.
    pub fn is_update(self) -> bool {
        matches!(self, EventType::UpdateRows | EventType::UpdateRowsV1)
    }
}

/// The 19-byte v4 event header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Unix timestamp of the event
    pub timestamp: u32,
    /// Event type
    pub event_type: EventType,
    /// Originating server id
    pub server_id: u32,
    /// Total event size including this header
    pub event_size: u32,
    /// Offset of the next event in the file
    pub log_pos: u32,
    /// Event flags
    pub flags: u16,
}

impl EventHeader {
    /// Parse the header off the front of an event buffer.
    pub fn parse(buf: &[u8]) -> Result<EventHeader> {
        if buf.len() < LOG_EVENT_HEADER_LEN {
            error!(len = buf.len(), "event length check failed");
            return Err(Error::InvalidRowData("event shorter than header".into()));
        }
        let mut reader = ByteReader::new(buf);
        Ok(EventHeader {
            timestamp: reader.u32_le()?,
            event_type: EventType::from_code(reader.u8()?),
            server_id: reader.u32_le()?,
            event_size: reader.u32_le()?,
            log_pos: reader.u32_le()?,
            flags: reader.u16_le()?,
        })
    }
}

/// QUERY_EVENT: DDL statement text.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// Common header
    pub header: EventHeader,
    /// Default database of the session
    pub db_name: String,
    /// Statement text, CRC stripped
    pub query: String,
}

impl QueryEvent {
    /// Decode a QUERY_EVENT buffer.
    pub fn parse(buf: &[u8]) -> Result<QueryEvent> {
        let header = EventHeader::parse(buf)?;
        let mut reader = ByteReader::new(buf);
        reader.seek(LOG_EVENT_HEADER_LEN);
        reader.skip(4)?; // slave_proxy_id
        reader.skip(4)?; // execution time
        let db_len = reader.u8()? as usize;
        reader.skip(2)?; // error code
        let status_vars_len = reader.u16_le()? as usize;
        reader.skip(status_vars_len)?;
        let db_name = String::from_utf8_lossy(reader.take(db_len)?).into_owned();
        reader.skip(1)?; // trailing NUL
        let rest = reader.rest();
        if rest.len() < CRC_LEN {
            return Err(Error::InvalidRowData("query event shorter than crc".into()));
        }
        let query = String::from_utf8_lossy(&rest[..rest.len() - CRC_LEN]).into_owned();
        Ok(QueryEvent {
            header,
            db_name,
            query,
        })
    }
}

/// ROTATE_EVENT: next file and start position.
#[derive(Debug, Clone)]
pub struct RotateEvent {
    /// Common header
    pub header: EventHeader,
    /// Name of the next binlog file
    pub next_file: String,
    /// Position in the next file
    pub position: u64,
}

impl RotateEvent {
    /// Decode a ROTATE_EVENT buffer. The first event of a freshly opened
    /// dump stream has no trailing checksum.
    pub fn parse(buf: &[u8], has_crc: bool) -> Result<RotateEvent> {
        let header = EventHeader::parse(buf)?;
        let mut reader = ByteReader::new(buf);
        reader.seek(LOG_EVENT_HEADER_LEN);
        let position = reader.u64_le()?;
        let mut name_bytes = reader.rest();
        if has_crc {
            if name_bytes.len() < CRC_LEN {
                return Err(Error::InvalidRowData("rotate event shorter than crc".into()));
            }
            name_bytes = &name_bytes[..name_bytes.len() - CRC_LEN];
        }
        Ok(RotateEvent {
            header,
            next_file: String::from_utf8_lossy(name_bytes).into_owned(),
            position,
        })
    }
}

/// Per-column descriptor published by a TABLE_MAP event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnInfo {
    /// MySQL type code
    pub type_code: u8,
    /// Type-specific metadata
    pub meta: u16,
    /// Whether the column is nullable
    pub nullable: bool,
}

/// TABLE_MAP_EVENT: schema layout for the rows events that follow.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    /// Common header
    pub header: EventHeader,
    /// Numeric table id referenced by rows events
    pub table_id: u64,
    /// Database name
    pub database_name: String,
    /// Table name
    pub table_name: String,
    /// Number of columns
    pub column_count: u64,
    /// Per-column type, meta and nullability
    pub column_info: Vec<ColumnInfo>,
}

// 1-byte metadata families
const META_ONE_BYTE: [u8; 11] = [
    field_type::BLOB,
    field_type::TINY_BLOB,
    field_type::MEDIUM_BLOB,
    field_type::LONG_BLOB,
    field_type::DOUBLE,
    field_type::FLOAT,
    field_type::GEOMETRY,
    field_type::JSON,
    field_type::TIME2,
    field_type::DATETIME2,
    field_type::TIMESTAMP2,
];
// 2-byte metadata families
const META_TWO_BYTES: [u8; 5] = [
    field_type::BIT,
    field_type::VARCHAR,
    field_type::NEWDECIMAL,
    field_type::STRING,
    field_type::VAR_STRING,
];

impl TableMapEvent {
    /// Decode a TABLE_MAP_EVENT buffer.
    pub fn parse(buf: &[u8]) -> Result<TableMapEvent> {
        let header = EventHeader::parse(buf)?;
        let mut reader = ByteReader::new(buf);
        reader.seek(LOG_EVENT_HEADER_LEN);

        let table_id = reader.u48_le()?;
        reader.skip(2)?; // flags, reserved
        let db_len = reader.u8()? as usize;
        let database_name = String::from_utf8_lossy(reader.take(db_len)?).into_owned();
        reader.skip(1)?;
        let table_len = reader.u8()? as usize;
        let table_name = String::from_utf8_lossy(reader.take(table_len)?).into_owned();
        reader.skip(1)?;

        let column_count = reader.lenenc_int()?;
        let mut column_info = vec![ColumnInfo::default(); column_count as usize];
        let types = reader.take(column_count as usize)?.to_vec();
        for (info, type_code) in column_info.iter_mut().zip(types.iter()) {
            info.type_code = *type_code;
        }

        let field_metadata_size = reader.lenenc_int()?;
        if field_metadata_size > 2 * column_count {
            error!(
                field_metadata_size,
                column_count, "table map metadata block too large"
            );
            return Err(Error::InvalidRowData(
                "table map metadata block exceeds limit".into(),
            ));
        }
        let meta_start = reader.position();
        for info in column_info.iter_mut() {
            match info.type_code {
                t if META_ONE_BYTE.contains(&t) => {
                    info.meta = reader.u8()? as u16;
                }
                t if META_TWO_BYTES.contains(&t) => {
                    info.meta = match t {
                        // Big-endian pairs: real type / precision in the
                        // high byte, length / scale in the low byte
                        field_type::STRING | field_type::VAR_STRING | field_type::NEWDECIMAL => {
                            ((reader.u8()? as u16) << 8) | reader.u8()? as u16
                        }
                        _ => reader.u16_le()?,
                    };
                }
                _ => {
                    info.meta = 0;
                }
            }
        }
        if reader.position() - meta_start != field_metadata_size as usize {
            return Err(Error::InvalidRowData(
                "table map metadata block length mismatch".into(),
            ));
        }

        let bitmap = reader.take((column_count as usize + 7) / 8)?;
        for (i, info) in column_info.iter_mut().enumerate() {
            info.nullable = bitmap[i / 8] & (1 << (i % 8)) != 0;
        }

        Ok(TableMapEvent {
            header,
            table_id,
            database_name,
            table_name,
            column_count,
            column_info,
        })
    }

    /// Descriptor of column `idx`.
    pub fn column_info(&self, idx: usize) -> &ColumnInfo {
        &self.column_info[idx]
    }

    /// Byte offset of this event's start within its binlog file.
    pub fn start_position(&self) -> u64 {
        (self.header.log_pos - self.header.event_size) as u64
    }
}

/// A WRITE/UPDATE/DELETE rows event with an in-event row cursor.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    /// Common header
    pub header: EventHeader,
    /// Table id; must match the cached table map
    pub table_id: u64,
    /// Number of columns per row image
    pub column_count: u64,
    /// Bytes per bitmap
    pub bits_length: usize,
    /// Present-columns bitmap of the first row image
    pub present_columns: Vec<u8>,
    /// Present-columns bitmap of the after image (UPDATE only)
    pub present_columns_update: Option<Vec<u8>>,
    /// Row payload between the bitmaps and the checksum
    rows_data: Vec<u8>,
    /// Cursor into `rows_data`
    cursor: usize,
    /// Table map cached from the preceding TABLE_MAP event
    table_map: Option<Arc<TableMapEvent>>,
    /// Start offset of that TABLE_MAP event
    start_position: u64,
}

impl RowsEvent {
    /// Decode a rows-event buffer (any of the six type codes).
    pub fn parse(buf: &[u8]) -> Result<RowsEvent> {
        let header = EventHeader::parse(buf)?;
        let mut reader = ByteReader::new(buf);
        reader.seek(LOG_EVENT_HEADER_LEN);

        let table_id = reader.u48_le()?;
        reader.skip(2)?; // flags

        if header.event_type.is_rows_v2() {
            let extra_len = reader.u16_le()? as usize;
            if extra_len < 2 {
                error!(extra_len, "rows event extra header length check failed");
                return Err(Error::InvalidRowData(
                    "rows event extra header shorter than its own length".into(),
                ));
            }
            reader.skip(extra_len - 2)?;
        }

        let column_count = reader.lenenc_int()?;
        let bits_length = (column_count as usize + 7) / 8;
        let present_columns = reader.take(bits_length)?.to_vec();
        let present_columns_update = if header.event_type.is_update() {
            Some(reader.take(bits_length)?.to_vec())
        } else {
            None
        };

        let rest = reader.rest();
        if rest.len() < CRC_LEN {
            return Err(Error::InvalidRowData("rows event shorter than crc".into()));
        }
        let rows_data = rest[..rest.len() - CRC_LEN].to_vec();

        Ok(RowsEvent {
            header,
            table_id,
            column_count,
            bits_length,
            present_columns,
            present_columns_update,
            rows_data,
            cursor: 0,
            table_map: None,
            start_position: 0,
        })
    }

    /// Attach the cached table map; the resumable position of every row of
    /// this event is the map's start offset.
    pub fn fill_table_map(&mut self, table_map: Arc<TableMapEvent>) {
        self.start_position = table_map.start_position();
        self.table_map = Some(table_map);
    }

    /// The attached table map.
    pub fn table_map(&self) -> Option<&Arc<TableMapEvent>> {
        self.table_map.as_ref()
    }

    /// Unconsumed row payload.
    pub fn remaining(&self) -> &[u8] {
        &self.rows_data[self.cursor..]
    }

    /// Advance the cursor by `consumed` bytes of row payload.
    pub fn advance(&mut self, consumed: usize) {
        self.cursor = (self.cursor + consumed).min(self.rows_data.len());
    }

    /// True once the cursor reached the end of the payload.
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.rows_data.len()
    }

    /// Start offset of the preceding TABLE_MAP event.
    pub fn start_position(&self) -> u64 {
        self.start_position
    }
}

/// Wire codes of the MySQL column types.
pub mod field_type {
    #![allow(missing_docs)]
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// A decoded event.
#[derive(Debug, Clone)]
pub enum Event {
    /// QUERY_EVENT
    Query(QueryEvent),
    /// ROTATE_EVENT
    Rotate(RotateEvent),
    /// TABLE_MAP_EVENT
    TableMap(TableMapEvent),
    /// Any rows event
    Rows(RowsEvent),
    /// Everything else, header only
    Other(EventHeader),
}

impl Event {
    /// Decode an event buffer by its type code. `first_in_stream` controls
    /// the checksum handling of ROTATE events.
    pub fn parse(buf: &[u8], first_in_stream: bool) -> Result<Event> {
        let header = EventHeader::parse(buf)?;
        match header.event_type {
            EventType::Query => Ok(Event::Query(QueryEvent::parse(buf)?)),
            EventType::Rotate => Ok(Event::Rotate(RotateEvent::parse(buf, !first_in_stream)?)),
            EventType::TableMap => Ok(Event::TableMap(TableMapEvent::parse(buf)?)),
            t if t.is_rows() => Ok(Event::Rows(RowsEvent::parse(buf)?)),
            _ => Ok(Event::Other(header)),
        }
    }

    /// Common header of any event kind.
    pub fn header(&self) -> &EventHeader {
        match self {
            Event::Query(e) => &e.header,
            Event::Rotate(e) => &e.header,
            Event::TableMap(e) => &e.header,
            Event::Rows(e) => &e.header,
            Event::Other(h) => h,
        }
    }
}
