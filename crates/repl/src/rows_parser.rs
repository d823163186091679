//! Rows-event parsing against the cached table map and schema.
//!
//! One `parse` call consumes exactly one logical row (both images for an
//! update) and advances the event cursor; the caller keeps invoking it until
//! `is_finished`. The emitted resume position is the start of the TABLE_MAP
//! event that preceded the rows event, so re-opening at that position
//! replays the map.

use std::sync::Arc;

use tracing::error;

use quiver_core::error::{Error, Result};
use quiver_core::proto::{LsnContext, RowData, RowOperation};
use quiver_core::value::{Value, INVALID_PRIMARY_KEY};

use crate::event::RowsEvent;
use crate::packet::ByteReader;
use crate::schema::TableSchema;

/// Walks rows events and emits logical rows.
pub struct RowsEventParser {
    schema: Arc<TableSchema>,
}

impl RowsEventParser {
    /// Parser bound to the current table schema.
    pub fn new(schema: Arc<TableSchema>) -> Self {
        RowsEventParser { schema }
    }

    /// Swap in a refreshed schema after an ALTER.
    pub fn update_schema(&mut self, schema: Arc<TableSchema>) {
        self.schema = schema;
    }

    /// Parse the next logical row of `event` into `context`'s position.
    pub fn parse(&self, event: &mut RowsEvent, context: &mut LsnContext) -> Result<RowData> {
        if self.schema.fields().len() != event.column_count as usize {
            error!(
                actual = event.column_count,
                expected = self.schema.fields().len(),
                "binlog row column count mismatched"
            );
            return Err(Error::InvalidRowData(
                "row column count does not match the schema".into(),
            ));
        }

        let table_map = event
            .table_map()
            .cloned()
            .ok_or_else(|| Error::RuntimeError("rows event without a table map".into()))?;

        let remaining = event.remaining().to_vec();
        let mut reader = ByteReader::new(&remaining);

        let present = event.present_columns.clone();
        let mut values = self.parse_row_image(&mut reader, &present, event, &table_map)?;
        if event.header.event_type.is_update() {
            let present_update = event
                .present_columns_update
                .clone()
                .ok_or_else(|| Error::InvalidRowData("update event without after-image bitmap".into()))?;
            // The after image wins; the before image only locates the row
            values = self.parse_row_image(&mut reader, &present_update, event, &table_map)?;
        }
        let consumed = reader.position();

        let row = self.fill_row_data(values, event)?;

        event.advance(consumed);
        // Resume replays the preceding TABLE_MAP while rows of this event
        // remain; once the event is drained the cursor moves past the group
        // so consumed rows are never re-emitted.
        context.position = if event.is_finished() {
            event.header.log_pos as u64
        } else {
            event.start_position()
        };
        Ok(row)
    }

    fn parse_row_image(
        &self,
        reader: &mut ByteReader,
        present_columns: &[u8],
        event: &RowsEvent,
        table_map: &Arc<crate::event::TableMapEvent>,
    ) -> Result<Vec<Option<Value>>> {
        let column_count = event.column_count as usize;
        let null_bits = reader.take(event.bits_length)?.to_vec();
        let mut values = vec![None; column_count];
        let fields = self.schema.fields();

        for c in 0..column_count {
            // ROW image always marks every column present; kept for safety
            if present_columns[c / 8] & (1 << (c % 8)) == 0 {
                continue;
            }
            if null_bits[c / 8] & (1 << (c % 8)) != 0 {
                continue;
            }
            let value = fields[c]
                .unpack_binary(reader, table_map.column_info(c))
                .map_err(|err| {
                    error!(
                        column = c,
                        field = fields[c].name(),
                        "unpack column data failed"
                    );
                    err
                })?;
            values[c] = Some(value);
        }
        Ok(values)
    }

    fn fill_row_data(&self, values: Vec<Option<Value>>, event: &RowsEvent) -> Result<RowData> {
        let pk_value = values
            .get(self.schema.auto_increment_id())
            .and_then(|v| v.as_ref())
            .ok_or_else(|| Error::RuntimeError("row image without a primary key".into()))?;
        let primary_key = pk_value.as_u64_key().ok_or_else(|| {
            error!(kind = pk_value.kind(), "get auto increment id failed");
            Error::RuntimeError("auto-increment column is not an integer".into())
        })?;
        if primary_key == INVALID_PRIMARY_KEY {
            return Err(Error::InvalidRowData("reserved primary key value".into()));
        }

        let event_type = event.header.event_type;
        let operation = if event_type.is_update() {
            RowOperation::Update
        } else if matches!(
            event_type,
            crate::event::EventType::DeleteRows | crate::event::EventType::DeleteRowsV1
        ) {
            RowOperation::Delete
        } else {
            RowOperation::Insert
        };

        let mut row = RowData {
            primary_key,
            operation,
            index_values: Vec::new(),
            forward_values: Vec::new(),
            lsn: 0,
            lsn_context: String::new(),
        };
        if operation != RowOperation::Delete {
            for &id in self.schema.selected_index_ids() {
                row.index_values.push(take_value(&values, id));
            }
            for &id in self.schema.selected_forward_ids() {
                row.forward_values.push(take_value(&values, id));
            }
        }
        Ok(row)
    }
}

// NULL columns travel as empty byte values
fn take_value(values: &[Option<Value>], id: usize) -> Value {
    values
        .get(id)
        .and_then(|v| v.clone())
        .unwrap_or(Value::Bytes(Vec::new()))
}
