//! Per-MySQL-type column codecs.
//!
//! Each field decodes two ways: `unpack_binary` walks a rows-event payload,
//! `unpack_text` converts a scan-mode cell (text protocol). Output is the
//! tagged `Value`. Non-UTF-8 text columns are converted through
//! `encoding_rs` keyed by the column collation; a converter error fails the
//! field.
//!
//! Scan-mode quirks: binary columns are selected as `HEX(col)` and arrive
//! hex-encoded, BIT/ENUM/SET as `col+0` and arrive numeric.

use chrono::{Local, TimeZone};
use encoding_rs::Encoding;
use tracing::error;

use quiver_core::error::{Error, Result};
use quiver_core::value::Value;

use crate::connector::{FieldMeta, BINARY_FLAG, ENUM_FLAG, SET_FLAG, UNSIGNED_FLAG};
use crate::event::{field_type, ColumnInfo};
use crate::packet::{be_uint, ByteReader};

const DATETIMEF_INT_OFS: i64 = 0x8000_0000_00;
const TIME_INT_OFS: i64 = 0x80_0000;
const TIME_OFS: i64 = 0x8000_0000_0000;

/// Attributes attached to a field when the table schema is built.
#[derive(Debug, Clone)]
pub struct FieldAttr {
    /// Selected as an index column
    pub is_index: bool,
    /// Selected as a forward column
    pub is_forward: bool,
    /// Collation name from SHOW FULL COLUMNS (empty for non-text columns)
    pub collation: String,
    /// Column metadata from the result set
    pub meta: FieldMeta,
}

/// One table column with its decoding state.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    select_expr: String,
    type_code: u8,
    length: u32,
    flags: u32,
    is_index: bool,
    is_forward: bool,
    // Source encoding when conversion to UTF-8 is required
    encoding: Option<&'static Encoding>,
    is_binary: bool,
    is_enum: bool,
    is_set: bool,
}

impl Field {
    /// Build a field from its schema attributes.
    pub fn new(name: &str, attr: &FieldAttr) -> Field {
        let flags = attr.meta.flags;
        let type_code = attr.meta.type_code;
        let is_binary = flags & BINARY_FLAG != 0 && is_string_family(type_code);
        let is_enum = flags & ENUM_FLAG != 0;
        let is_set = flags & SET_FLAG != 0;

        let encoding = if is_binary || is_enum || is_set {
            None
        } else {
            encoding_for_collation(&attr.collation)
        };

        let select_expr = match type_code {
            field_type::BIT => format!("{name}+0"),
            _ if is_enum || is_set => format!("{name}+0"),
            _ if is_binary => format!("HEX({name})"),
            _ => name.to_string(),
        };

        Field {
            name: name.to_string(),
            select_expr,
            type_code,
            length: attr.meta.length,
            flags,
            is_index: attr.is_index,
            is_forward: attr.is_forward,
            encoding,
            is_binary,
            is_enum,
            is_set,
        }
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expression used in scan-mode SELECT lists.
    pub fn select_expr(&self) -> &str {
        &self.select_expr
    }

    /// MySQL type code.
    pub fn type_code(&self) -> u8 {
        self.type_code
    }

    /// Selected as an index column.
    pub fn is_index(&self) -> bool {
        self.is_index
    }

    /// Selected as a forward column.
    pub fn is_forward(&self) -> bool {
        self.is_forward
    }

    /// Selected at all.
    pub fn is_selected(&self) -> bool {
        self.is_index || self.is_forward
    }

    /// Unsigned integer column.
    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    // ------------------------------------------------------------------
    // Binary (rows event) decoding
    // ------------------------------------------------------------------

    /// Decode this column's payload out of a rows-event row image.
    pub fn unpack_binary(&self, reader: &mut ByteReader, info: &ColumnInfo) -> Result<Value> {
        match self.type_code {
            field_type::TINY => {
                let raw = reader.u8()?;
                self.small_int(raw as i8 as i64, raw as u64)
            }
            field_type::SHORT => {
                let raw = reader.u16_le()?;
                self.small_int(raw as i16 as i64, raw as u64)
            }
            field_type::INT24 => {
                let raw = reader.u24_le()?;
                let signed = ((raw << 8) as i32) >> 8;
                self.small_int(signed as i64, raw as u64)
            }
            field_type::LONG => {
                let raw = reader.u32_le()?;
                self.small_int(raw as i32 as i64, raw as u64)
            }
            field_type::LONGLONG => {
                let raw = reader.u64_le()?;
                if self.is_unsigned() {
                    Ok(Value::UInt64(raw))
                } else {
                    Ok(Value::Int64(raw as i64))
                }
            }
            field_type::FLOAT => {
                let raw = reader.u32_le()?;
                Ok(Value::Float(f32::from_bits(raw)))
            }
            field_type::DOUBLE => {
                let raw = reader.u64_le()?;
                Ok(Value::Double(f64::from_bits(raw)))
            }
            field_type::NEWDECIMAL => {
                let precision = (info.meta >> 8) as u32;
                let scale = (info.meta & 0xff) as u32;
                unpack_decimal(reader, precision, scale)
            }
            field_type::BIT => {
                let bits = ((info.meta >> 8) * 8 + (info.meta & 0xff)) as usize;
                let len = (bits + 7) / 8;
                if len == 0 || len > 8 {
                    return Err(Error::InvalidRowData(format!("bit field of {bits} bits")));
                }
                let bytes = reader.take(len)?;
                Ok(Value::UInt64(be_uint(bytes, len)))
            }
            field_type::DATETIME | field_type::DATETIME2 => unpack_datetime2(reader, info.meta),
            field_type::TIMESTAMP | field_type::TIMESTAMP2 => unpack_timestamp2(reader, info.meta),
            field_type::TIME | field_type::TIME2 => unpack_time2(reader, info.meta),
            field_type::DATE => unpack_date(reader),
            field_type::YEAR => {
                let raw = reader.u8()? as i32;
                Ok(Value::String(if raw == 0 {
                    "0000".to_string()
                } else {
                    (raw + 1900).to_string()
                }))
            }
            field_type::BLOB
            | field_type::TINY_BLOB
            | field_type::MEDIUM_BLOB
            | field_type::LONG_BLOB => self.unpack_length_prefixed(reader, info.meta, false),
            field_type::JSON | field_type::GEOMETRY => {
                self.unpack_length_prefixed(reader, info.meta, true)
            }
            field_type::VARCHAR | field_type::VAR_STRING => {
                let prefixed = if (info.meta as u32) < 256 {
                    reader.u8()? as usize
                } else {
                    reader.u16_le()? as usize
                };
                let bytes = reader.take(prefixed)?;
                self.string_or_bytes(bytes)
            }
            field_type::STRING => self.unpack_string(reader, info.meta),
            other => {
                error!(type_code = other, field = self.name.as_str(), "unsupported field type");
                Err(Error::InvalidRowData(format!(
                    "unsupported field type {other}"
                )))
            }
        }
    }

    fn small_int(&self, signed: i64, unsigned: u64) -> Result<Value> {
        if self.is_unsigned() {
            Ok(Value::UInt32(unsigned as u32))
        } else {
            Ok(Value::Int32(signed as i32))
        }
    }

    // BLOB/JSON/GEOMETRY: `meta` bytes of length prefix
    fn unpack_length_prefixed(
        &self,
        reader: &mut ByteReader,
        meta: u16,
        always_bytes: bool,
    ) -> Result<Value> {
        let length = match meta {
            1 => reader.u8()? as usize,
            2 => reader.u16_le()? as usize,
            3 => reader.u24_le()? as usize,
            4 => reader.u32_le()? as usize,
            other => {
                return Err(Error::InvalidRowData(format!(
                    "blob length prefix of {other} bytes"
                )))
            }
        };
        let bytes = reader.take(length)?;
        if always_bytes {
            Ok(Value::Bytes(bytes.to_vec()))
        } else {
            self.string_or_bytes(bytes)
        }
    }

    // STRING smuggles the real type into meta
    fn unpack_string(&self, reader: &mut ByteReader, meta: u16) -> Result<Value> {
        let (real_type, length) = if meta < 256 {
            (field_type::STRING, meta as u32)
        } else {
            let byte0 = (meta >> 8) as u8;
            let byte1 = (meta & 0xff) as u32;
            if byte0 & 0x30 != 0x30 {
                (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as u32) << 4))
            } else if byte0 == field_type::STRING
                || byte0 == field_type::SET
                || byte0 == field_type::ENUM
            {
                (byte0, byte1)
            } else {
                return Err(Error::InvalidRowData(format!(
                    "string field with real type {byte0}"
                )));
            }
        };

        match real_type {
            field_type::STRING => {
                let prefixed = if length < 256 {
                    reader.u8()? as usize
                } else {
                    reader.u16_le()? as usize
                };
                let bytes = reader.take(prefixed)?;
                if self.is_binary {
                    // Fixed-length binary CHAR is zero-padded to its width
                    let mut padded = bytes.to_vec();
                    padded.resize(self.length as usize, 0);
                    Ok(Value::Bytes(padded))
                } else {
                    self.string_or_bytes(bytes)
                }
            }
            field_type::SET => {
                let len = (meta & 0xff) as usize;
                if len == 0 || len > 8 {
                    return Err(Error::InvalidRowData(format!("set field of {len} bytes")));
                }
                let bytes = reader.take(len)?;
                let mut value = 0u64;
                for (i, b) in bytes.iter().enumerate() {
                    value |= (*b as u64) << (8 * i);
                }
                Ok(Value::UInt64(value))
            }
            field_type::ENUM => match length {
                1 => Ok(Value::Int32(reader.u8()? as i32)),
                2 => Ok(Value::Int32(reader.u16_le()? as i32)),
                other => Err(Error::InvalidRowData(format!(
                    "enum field of {other} bytes"
                ))),
            },
            _ => unreachable!(),
        }
    }

    fn string_or_bytes(&self, bytes: &[u8]) -> Result<Value> {
        if self.is_binary {
            return Ok(Value::Bytes(bytes.to_vec()));
        }
        match self.encoding {
            None => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
            Some(encoding) => {
                let (text, _, had_errors) = encoding.decode(bytes);
                if had_errors {
                    error!(field = self.name.as_str(), "convert charset failed");
                    return Err(Error::InvalidRowData(format!(
                        "charset conversion failed for {}",
                        self.name
                    )));
                }
                Ok(Value::String(text.into_owned()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Text (scan mode) decoding
    // ------------------------------------------------------------------

    /// Decode a scan-mode cell produced by this field's select expression.
    pub fn unpack_text(&self, data: &[u8]) -> Result<Value> {
        match self.type_code {
            field_type::TINY | field_type::SHORT | field_type::INT24 | field_type::LONG => {
                let text = text_str(data)?;
                if self.is_unsigned() {
                    Ok(Value::UInt32(parse_number(text)?))
                } else {
                    Ok(Value::Int32(parse_number(text)?))
                }
            }
            field_type::LONGLONG => {
                let text = text_str(data)?;
                if self.is_unsigned() {
                    Ok(Value::UInt64(parse_number(text)?))
                } else {
                    Ok(Value::Int64(parse_number(text)?))
                }
            }
            field_type::FLOAT => Ok(Value::Float(parse_number(text_str(data)?)?)),
            field_type::DOUBLE => Ok(Value::Double(parse_number(text_str(data)?)?)),
            field_type::BIT => Ok(Value::UInt64(parse_number(text_str(data)?)?)),
            field_type::NEWDECIMAL
            | field_type::DECIMAL
            | field_type::DATE
            | field_type::TIME
            | field_type::TIME2
            | field_type::DATETIME
            | field_type::DATETIME2
            | field_type::TIMESTAMP
            | field_type::TIMESTAMP2
            | field_type::YEAR => Ok(Value::String(text_str(data)?.to_string())),
            field_type::JSON | field_type::GEOMETRY => Ok(Value::Bytes(data.to_vec())),
            field_type::STRING if self.is_enum => {
                Ok(Value::Int32(parse_number(text_str(data)?)?))
            }
            field_type::STRING if self.is_set => {
                Ok(Value::UInt64(parse_number(text_str(data)?)?))
            }
            field_type::BLOB
            | field_type::TINY_BLOB
            | field_type::MEDIUM_BLOB
            | field_type::LONG_BLOB
            | field_type::VARCHAR
            | field_type::VAR_STRING
            | field_type::STRING => {
                // Empty cells are legitimate here, unlike the numeric kinds
                if self.is_binary {
                    // HEX(col) output: two nibbles per byte
                    let text = std::str::from_utf8(data)
                        .map_err(|_| Error::InvalidRowData("non-utf8 hex cell".into()))?;
                    hex::decode(text)
                        .map(Value::Bytes)
                        .map_err(|_| Error::InvalidRowData(format!("bad hex in {}", self.name)))
                } else {
                    self.string_or_bytes(data)
                }
            }
            other => Err(Error::InvalidRowData(format!(
                "unsupported field type {other}"
            ))),
        }
    }
}

fn is_string_family(type_code: u8) -> bool {
    matches!(
        type_code,
        field_type::BLOB
            | field_type::TINY_BLOB
            | field_type::MEDIUM_BLOB
            | field_type::LONG_BLOB
            | field_type::VARCHAR
            | field_type::VAR_STRING
            | field_type::STRING
    )
}

fn text_str(data: &[u8]) -> Result<&str> {
    if data.is_empty() {
        return Err(Error::InvalidRowData("empty text cell".into()));
    }
    std::str::from_utf8(data).map_err(|_| Error::InvalidRowData("non-utf8 text cell".into()))
}

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T> {
    text.trim()
        .parse::<T>()
        .map_err(|_| Error::InvalidRowData(format!("bad numeric cell: {text}")))
}

/// Map a MySQL collation name to its source encoding. `None` means the
/// bytes are already UTF-8 (or ASCII-compatible enough to pass through).
pub fn encoding_for_collation(collation: &str) -> Option<&'static Encoding> {
    let prefix = collation.split('_').next().unwrap_or("");
    match prefix {
        "latin1" | "cp1252" => Some(encoding_rs::WINDOWS_1252),
        "gbk" => Some(encoding_rs::GBK),
        "gb2312" | "gb18030" => Some(encoding_rs::GB18030),
        "big5" => Some(encoding_rs::BIG5),
        "ujis" | "eucjpms" => Some(encoding_rs::EUC_JP),
        "sjis" | "cp932" => Some(encoding_rs::SHIFT_JIS),
        "euckr" => Some(encoding_rs::EUC_KR),
        "koi8r" => Some(encoding_rs::KOI8_R),
        "cp1251" => Some(encoding_rs::WINDOWS_1251),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Date/time codecs
// ---------------------------------------------------------------------------

// Fractional-second tail: (meta+1)/2 bytes, scaled to microseconds
fn read_fraction(reader: &mut ByteReader, meta: u16) -> Result<i32> {
    Ok(match meta {
        1 | 2 => reader.u8()? as i32 * 10_000,
        3 | 4 => {
            let bytes = reader.take(2)?;
            be_uint(bytes, 2) as i32 * 100
        }
        5 | 6 => {
            let bytes = reader.take(3)?;
            be_uint(bytes, 3) as i32
        }
        _ => 0,
    })
}

// Microseconds rendered to `decimals` fractional digits
fn fraction_str(frac: i32, decimals: u16) -> String {
    let text = format!("{:06}", frac.unsigned_abs());
    text[..(decimals as usize).min(6)].to_string()
}

fn unpack_datetime2(reader: &mut ByteReader, meta: u16) -> Result<Value> {
    let int_part = be_uint(reader.take(5)?, 5) as i64 - DATETIMEF_INT_OFS;
    let frac = read_fraction(reader, meta)?;

    let mut text = if int_part == 0 {
        "0000-00-00 00:00:00".to_string()
    } else {
        let ymd = int_part >> 17;
        let ym = ymd >> 5;
        let hms = int_part & ((1 << 17) - 1);
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            (ym / 13) % 10000,
            (ym % 13) % 100,
            (ymd & 0x1f) % 100,
            (hms >> 12) % 100,
            ((hms >> 6) & 0x3f) % 100,
            (hms & 0x3f) % 100
        )
    };
    if frac >= 1 {
        text.push('.');
        text.push_str(&fraction_str(frac, meta));
    }
    Ok(Value::String(text))
}

fn unpack_timestamp2(reader: &mut ByteReader, meta: u16) -> Result<Value> {
    let seconds = be_uint(reader.take(4)?, 4);
    let frac = read_fraction(reader, meta)?;

    let mut text = if seconds == 0 {
        "0000-00-00 00:00:00".to_string()
    } else {
        match Local.timestamp_opt(seconds as i64, 0) {
            chrono::LocalResult::Single(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            _ => return Err(Error::InvalidRowData(format!("bad timestamp {seconds}"))),
        }
    };
    if meta >= 1 {
        text.push('.');
        text.push_str(&fraction_str(frac, meta));
    }
    Ok(Value::String(text))
}

fn unpack_time2(reader: &mut ByteReader, meta: u16) -> Result<Value> {
    let (int_part, frac, ltime): (i64, i32, i64) = match meta {
        1 | 2 => {
            let mut int_part = be_uint(reader.take(3)?, 3) as i64 - TIME_INT_OFS;
            let mut frac = reader.u8()? as i32;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part, frac * 10_000, int_part << 24)
        }
        3 | 4 => {
            let mut int_part = be_uint(reader.take(3)?, 3) as i64 - TIME_INT_OFS;
            let mut frac = be_uint(reader.take(2)?, 2) as i32;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part, frac * 100, int_part << 24)
        }
        5 | 6 => {
            let int_part = be_uint(reader.take(6)?, 6) as i64 - TIME_OFS;
            (int_part, (int_part % (1 << 24)) as i32, int_part)
        }
        _ => {
            let int_part = be_uint(reader.take(3)?, 3) as i64 - TIME_INT_OFS;
            (int_part, 0, int_part << 24)
        }
    };

    let mut text = if int_part == 0 {
        "00:00:00".to_string()
    } else {
        let magnitude = ltime.unsigned_abs() as i64;
        let hms = magnitude >> 24;
        let hours = (hms >> 12) & 0x3ff;
        let sign = if ltime < 0 { "-" } else { "" };
        format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            hours,
            (hms >> 6) & 0x3f,
            hms & 0x3f
        )
    };
    if meta >= 1 {
        text.push('.');
        text.push_str(&fraction_str(frac, meta));
    }
    Ok(Value::String(text))
}

fn unpack_date(reader: &mut ByteReader) -> Result<Value> {
    let packed = reader.u24_le()?;
    let text = if packed == 0 {
        "0000-00-00".to_string()
    } else {
        format!(
            "{:04}-{:02}-{:02}",
            (packed / (16 * 32)) % 10000,
            (packed / 32 % 16) % 100,
            (packed % 32) % 100
        )
    };
    Ok(Value::String(text))
}

// ---------------------------------------------------------------------------
// NEWDECIMAL
// ---------------------------------------------------------------------------

const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
const DIG_PER_DEC: u32 = 9;

/// Packed size of a decimal of the given precision and scale.
pub fn decimal_bin_size(precision: u32, scale: u32) -> usize {
    let intg = precision - scale;
    let intg0 = (intg / DIG_PER_DEC) as usize;
    let frac0 = (scale / DIG_PER_DEC) as usize;
    let intg0x = (intg % DIG_PER_DEC) as usize;
    let frac0x = (scale % DIG_PER_DEC) as usize;
    intg0 * 4 + DIG_TO_BYTES[intg0x] + frac0 * 4 + DIG_TO_BYTES[frac0x]
}

fn unpack_decimal(reader: &mut ByteReader, precision: u32, scale: u32) -> Result<Value> {
    if precision == 0 || scale > precision {
        return Err(Error::InvalidRowData(format!(
            "decimal meta {precision}.{scale}"
        )));
    }
    let size = decimal_bin_size(precision, scale);
    let mut buf = reader.take(size)?.to_vec();

    let positive = buf[0] & 0x80 != 0;
    buf[0] ^= 0x80;
    if !positive {
        for b in buf.iter_mut() {
            *b = !*b;
        }
    }

    let intg = precision - scale;
    let intg0 = (intg / DIG_PER_DEC) as usize;
    let intg0x = (intg % DIG_PER_DEC) as usize;
    let frac0 = (scale / DIG_PER_DEC) as usize;
    let frac0x = (scale % DIG_PER_DEC) as usize;

    let mut pos = 0;
    let mut int_digits = String::new();
    let lead = DIG_TO_BYTES[intg0x];
    if lead > 0 {
        int_digits.push_str(&be_uint(&buf[pos..], lead).to_string());
        pos += lead;
    }
    for _ in 0..intg0 {
        let group = be_uint(&buf[pos..], 4);
        pos += 4;
        if int_digits.is_empty() {
            int_digits.push_str(&group.to_string());
        } else {
            int_digits.push_str(&format!("{group:09}"));
        }
    }
    let int_digits = {
        let trimmed = int_digits.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let mut frac_digits = String::new();
    for _ in 0..frac0 {
        let group = be_uint(&buf[pos..], 4);
        pos += 4;
        frac_digits.push_str(&format!("{group:09}"));
    }
    let tail = DIG_TO_BYTES[frac0x];
    if tail > 0 {
        let group = be_uint(&buf[pos..], tail);
        frac_digits.push_str(&format!("{:0width$}", group, width = frac0x));
    }

    let mut text = String::new();
    if !positive {
        text.push('-');
    }
    text.push_str(&int_digits);
    if scale > 0 {
        text.push('.');
        text.push_str(&frac_digits[..scale as usize]);
    }
    Ok(Value::String(text))
}
