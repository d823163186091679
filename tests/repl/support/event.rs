//! Binlog event buffer builder for the fixture table.
//!
//! Wire layouts follow the v4 binlog format; every event carries a real
//! `event_size` and `log_pos` so resume positions line up, plus a zeroed
//! 4-byte checksum trailer (the fetcher negotiates checksums off).

const HEADER_LEN: usize = 19;
const TABLE_ID: u64 = 42;

const QUERY_EVENT: u8 = 2;
const ROTATE_EVENT: u8 = 4;
const TABLE_MAP_EVENT: u8 = 19;
const WRITE_ROWS_EVENT: u8 = 30;
const UPDATE_ROWS_EVENT: u8 = 31;
const DELETE_ROWS_EVENT: u8 = 32;

const TYPE_LONG: u8 = 3;
const TYPE_VARCHAR: u8 = 15;

/// Builds raw event buffers for the `mytest.t (id, face, age)` fixture.
pub struct EventBuilder;

impl EventBuilder {
    fn build(event_type: u8, start_pos: u64, body: &[u8]) -> (Vec<u8>, u64) {
        let event_size = (HEADER_LEN + body.len()) as u32;
        let log_pos = start_pos as u32 + event_size;
        let mut buf = Vec::with_capacity(event_size as usize);
        buf.extend_from_slice(&1_700_000_000u32.to_le_bytes()); // timestamp
        buf.push(event_type);
        buf.extend_from_slice(&10_000u32.to_le_bytes()); // server id
        buf.extend_from_slice(&event_size.to_le_bytes());
        buf.extend_from_slice(&log_pos.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(body);
        (buf, log_pos as u64)
    }

    fn push_table_id(body: &mut Vec<u8>) {
        body.extend_from_slice(&TABLE_ID.to_le_bytes()[..6]);
        body.extend_from_slice(&0u16.to_le_bytes()); // flags
    }

    /// TABLE_MAP for the fixture table.
    pub fn table_map(start_pos: u64) -> (Vec<u8>, u64) {
        Self::table_map_for(start_pos, "mytest", "t")
    }

    /// TABLE_MAP with explicit database and table names.
    pub fn table_map_for(start_pos: u64, db: &str, table: &str) -> (Vec<u8>, u64) {
        let mut body = Vec::new();
        Self::push_table_id(&mut body);
        body.push(db.len() as u8);
        body.extend_from_slice(db.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        body.push(3); // column count (lenenc, < 251)
        body.extend_from_slice(&[TYPE_LONG, TYPE_VARCHAR, TYPE_LONG]);
        body.push(2); // metadata block length
        body.extend_from_slice(&255u16.to_le_bytes()); // VARCHAR max length
        body.push(0b0000_0110); // face and age nullable
        body.extend_from_slice(&[0u8; 4]); // checksum
        Self::build(TABLE_MAP_EVENT, start_pos, &body)
    }

    /// TABLE_MAP whose declared metadata block exceeds `2 * column_count`.
    pub fn table_map_with_meta_size(start_pos: u64, meta_size: u8) -> Vec<u8> {
        let mut body = Vec::new();
        Self::push_table_id(&mut body);
        body.push(6);
        body.extend_from_slice(b"mytest");
        body.push(0);
        body.push(1);
        body.extend_from_slice(b"t");
        body.push(0);
        body.push(3);
        body.extend_from_slice(&[TYPE_LONG, TYPE_VARCHAR, TYPE_LONG]);
        body.push(meta_size);
        body.extend_from_slice(&vec![0u8; meta_size as usize]);
        body.push(0);
        body.extend_from_slice(&[0u8; 4]);
        Self::build(TABLE_MAP_EVENT, start_pos, &body).0
    }

    fn push_row_image(body: &mut Vec<u8>, pk: u64, face: &str, age: i32) {
        body.push(0); // null bitmap: nothing null
        body.extend_from_slice(&(pk as u32).to_le_bytes());
        body.push(face.len() as u8); // VARCHAR(255): 1-byte length prefix
        body.extend_from_slice(face.as_bytes());
        body.extend_from_slice(&age.to_le_bytes());
    }

    fn rows_body(rows_images: impl FnOnce(&mut Vec<u8>), update: bool) -> Vec<u8> {
        let mut body = Vec::new();
        Self::push_table_id(&mut body);
        body.extend_from_slice(&2u16.to_le_bytes()); // extra header: just its length
        body.push(3); // column count
        body.push(0b0000_0111); // present bitmap
        if update {
            body.push(0b0000_0111); // after-image present bitmap
        }
        rows_images(&mut body);
        body.extend_from_slice(&[0u8; 4]); // checksum
        body
    }

    /// WRITE_ROWS (V2) carrying `(pk, face, age)` rows.
    pub fn write_rows(start_pos: u64, rows: &[(u64, &str, i32)]) -> (Vec<u8>, u64) {
        let rows = rows.to_vec();
        let body = Self::rows_body(
            move |out| {
                for (pk, face, age) in rows {
                    Self::push_row_image(out, pk, face, age);
                }
            },
            false,
        );
        Self::build(WRITE_ROWS_EVENT, start_pos, &body)
    }

    /// UPDATE_ROWS (V2) carrying before/after image pairs.
    pub fn update_rows(
        start_pos: u64,
        pairs: &[((u64, &str, i32), (u64, &str, i32))],
    ) -> (Vec<u8>, u64) {
        let pairs = pairs.to_vec();
        let body = Self::rows_body(
            move |out| {
                for ((bpk, bface, bage), (apk, aface, aage)) in pairs {
                    Self::push_row_image(out, bpk, bface, bage);
                    Self::push_row_image(out, apk, aface, aage);
                }
            },
            true,
        );
        Self::build(UPDATE_ROWS_EVENT, start_pos, &body)
    }

    /// DELETE_ROWS (V2) carrying the removed images.
    pub fn delete_rows(start_pos: u64, rows: &[(u64, &str, i32)]) -> (Vec<u8>, u64) {
        let rows = rows.to_vec();
        let body = Self::rows_body(
            move |out| {
                for (pk, face, age) in rows {
                    Self::push_row_image(out, pk, face, age);
                }
            },
            false,
        );
        Self::build(DELETE_ROWS_EVENT, start_pos, &body)
    }

    /// WRITE_ROWS whose V2 extra header declares an impossible length.
    pub fn write_rows_short_extra(start_pos: u64) -> Vec<u8> {
        let mut body = Vec::new();
        Self::push_table_id(&mut body);
        body.extend_from_slice(&1u16.to_le_bytes()); // extra_len < 2
        body.push(3);
        body.push(0b0000_0111);
        body.extend_from_slice(&[0u8; 4]);
        Self::build(WRITE_ROWS_EVENT, start_pos, &body).0
    }

    /// QUERY_EVENT with the given statement text.
    pub fn query_event(db: &str, query: &str, start_pos: u64) -> (Vec<u8>, u64) {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // slave_proxy_id
        body.extend_from_slice(&0u32.to_le_bytes()); // execution time
        body.push(db.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes()); // error code
        body.extend_from_slice(&0u16.to_le_bytes()); // status vars length
        body.extend_from_slice(db.as_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        body.extend_from_slice(&[0u8; 4]); // checksum
        Self::build(QUERY_EVENT, start_pos, &body)
    }

    /// ROTATE_EVENT pointing at the next file.
    pub fn rotate_event(file_name: &str, position: u64, has_crc: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&position.to_le_bytes());
        body.extend_from_slice(file_name.as_bytes());
        if has_crc {
            body.extend_from_slice(&[0u8; 4]);
        }
        Self::build(ROTATE_EVENT, 0, &body).0
    }
}
