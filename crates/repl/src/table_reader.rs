//! The initial full-scan cursor.
//!
//! Streams `SELECT pk, <selected cols> FROM db.tbl WHERE pk > :seq` without
//! client buffering; every row is an INSERT with `seq_id = pk`. On a stream
//! error the cursor remembers the last emitted `seq_id`, reconnects, and
//! re-issues the scan above it.

use std::sync::Arc;

use tracing::{debug, error, info};

use quiver_core::error::{Error, Result};
use quiver_core::proto::{LsnContext, RowData, RowDataStatus, RowOperation};
use quiver_core::value::Value;

use crate::connector::{ConnectorManager, ConnectorProxy, MysqlRow};
use crate::handler::MysqlReader;
use crate::info_fetcher::InfoFetcher;
use crate::schema::TableSchema;
use crate::sql::SqlBuilder;

/// Streaming scan cursor for one table.
pub struct TableReader {
    table_name: String,
    info_fetcher: Arc<InfoFetcher>,
    manager: Arc<ConnectorManager>,
    proxy: Option<ConnectorProxy>,
    table_schema: Option<Arc<TableSchema>>,
    sequence_id: u64,
    need_reconnect: bool,
}

impl TableReader {
    /// Reader over the shared connector pool.
    pub fn new(
        table_name: &str,
        info_fetcher: Arc<InfoFetcher>,
        manager: Arc<ConnectorManager>,
    ) -> Self {
        TableReader {
            table_name: table_name.to_string(),
            info_fetcher,
            manager,
            proxy: None,
            table_schema: None,
            sequence_id: 0,
            need_reconnect: false,
        }
    }

    fn schema(&self) -> Result<&Arc<TableSchema>> {
        self.table_schema
            .as_ref()
            .ok_or_else(|| Error::RuntimeError("table reader not initialized".into()))
    }

    fn prepare_reader(&mut self, seq_id: u64) -> Result<()> {
        let schema = self.schema()?.clone();
        let select_fields: Vec<String> = schema
            .selected_fields()
            .iter()
            .map(|f| f.select_expr().to_string())
            .collect();
        let auto_inc_field = schema.auto_increment_field().name().to_string();
        let sql = SqlBuilder::scan_table(
            self.info_fetcher.database(),
            &self.table_name,
            &auto_inc_field,
            &select_fields,
            seq_id,
        );
        let proxy = self
            .proxy
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("table reader not initialized".into()))?;
        proxy.connector().execute_streaming_query(&sql).map_err(|err| {
            error!(code = err.code(), "connector execute query failed");
            err
        })?;
        Ok(())
    }

    fn build_row_data(&self, row: &MysqlRow, context: &mut LsnContext) -> Result<RowData> {
        let schema = self.schema()?;
        let selected = schema.selected_fields();
        let max_index_id = schema.max_index_id();

        // Column 0 is the primary key; selected fields follow in SELECT order
        let pk_field = schema.auto_increment_field();
        let pk_value = pk_field.unpack_text(row.field_value(0).unwrap_or_default())?;
        let primary_key = pk_value.as_u64_key().ok_or_else(|| {
            error!(kind = pk_value.kind(), "get auto increment id failed");
            Error::RuntimeError("auto-increment column is not an integer".into())
        })?;

        let mut data = RowData {
            primary_key,
            operation: RowOperation::Insert,
            index_values: Vec::new(),
            forward_values: Vec::new(),
            lsn: 0,
            lsn_context: String::new(),
        };
        for (i, field) in selected.iter().enumerate() {
            let cell = row.field_value(i + 1);
            let value = match cell {
                Some(bytes) => field.unpack_text(bytes)?,
                None => Value::Bytes(Vec::new()),
            };
            if i < max_index_id {
                data.index_values.push(value);
            } else {
                data.forward_values.push(value);
            }
        }

        context.seq_id = primary_key;
        Ok(data)
    }
}

impl MysqlReader for TableReader {
    fn init(&mut self) -> Result<()> {
        info!("begin init table reader");
        self.proxy = Some(self.manager.get()?);
        self.table_schema = Some(self.info_fetcher.get_table_schema(&self.table_name)?);
        info!("table reader init success");
        Ok(())
    }

    fn start(&mut self, context: &LsnContext) -> Result<()> {
        info!(seq_id = context.seq_id, "begin start table reader");
        self.prepare_reader(context.seq_id)?;
        self.sequence_id = context.seq_id;
        Ok(())
    }

    fn get_next_row_data(&mut self, context: &mut LsnContext) -> Result<Option<RowData>> {
        if self.need_reconnect {
            let seq_id = self.sequence_id;
            let reconnected = self
                .proxy
                .as_mut()
                .map(|p| p.connector().reconnect())
                .unwrap_or(false);
            if reconnected && self.prepare_reader(seq_id).is_ok() {
                self.need_reconnect = false;
            } else {
                return Err(Error::ConnectMysql("table scan reconnect failed".into()));
            }
        }

        let fetched = {
            let proxy = self
                .proxy
                .as_mut()
                .ok_or_else(|| Error::RuntimeError("table reader not initialized".into()))?;
            proxy.connector().fetch_stream_row()
        };
        let row = match fetched {
            Ok(Some(row)) => row,
            Ok(None) => {
                context.status = RowDataStatus::NoMoreData;
                return Ok(None);
            }
            Err(_) => {
                self.need_reconnect = true;
                return Err(Error::FetchMysqlResult);
            }
        };

        let data = self.build_row_data(&row, context)?;
        context.status = RowDataStatus::Normal;
        self.sequence_id = context.seq_id;
        debug!(primary_key = data.primary_key, "scan row fetched");
        Ok(Some(data))
    }

    fn table_schema(&self) -> Option<Arc<TableSchema>> {
        self.table_schema.clone()
    }

    fn info_fetcher(&self) -> Arc<InfoFetcher> {
        self.info_fetcher.clone()
    }
}
