//! The change-data cursor over a binlog dump stream.
//!
//! Holds the cached TABLE_MAP, a pending schema refresh (an ALTER whose
//! re-read failed and must be retried), and an in-progress rows event whose
//! cursor has not reached the end. `SCHEMA_CHANGED` is a barrier: the caller
//! quiesces downstream writers, re-reads the collection schema, then
//! resumes. A schema-incompatible ALTER suspends the reader until operator
//! intervention.

use std::sync::Arc;

use tracing::{debug, error, info};

use quiver_core::error::{Error, Result};
use quiver_core::proto::{LsnContext, RowData, RowDataStatus};

use crate::connector::ConnectorManager;
use crate::event::{Event, QueryEvent, RowsEvent, TableMapEvent};
use crate::fetcher::EventFetcher;
use crate::handler::MysqlReader;
use crate::info_fetcher::InfoFetcher;
use crate::rows_parser::RowsEventParser;
use crate::schema::TableSchema;

struct LogState {
    file_name: String,
    position: u64,
    table_map: Option<Arc<TableMapEvent>>,
}

/// Resumable binlog cursor for one watched table.
pub struct BinlogReader {
    table_name: String,
    info_fetcher: Arc<InfoFetcher>,
    manager: Arc<ConnectorManager>,
    table_schema: Option<Arc<TableSchema>>,
    parser: Option<RowsEventParser>,
    event_fetcher: Option<EventFetcher>,
    rows_event: Option<RowsEvent>,
    pending_schema_refresh: bool,
    schema_changed: bool,
    suspended: bool,
    skipped_event: bool,
    log: LogState,
}

impl BinlogReader {
    /// Reader over the shared connector pool.
    pub fn new(
        table_name: &str,
        info_fetcher: Arc<InfoFetcher>,
        manager: Arc<ConnectorManager>,
    ) -> Self {
        BinlogReader {
            table_name: table_name.to_string(),
            info_fetcher,
            manager,
            table_schema: None,
            parser: None,
            event_fetcher: None,
            rows_event: None,
            pending_schema_refresh: false,
            schema_changed: false,
            suspended: false,
            skipped_event: false,
            log: LogState {
                file_name: String::new(),
                position: 0,
                table_map: None,
            },
        }
    }

    fn parser(&self) -> Result<&RowsEventParser> {
        self.parser
            .as_ref()
            .ok_or_else(|| Error::RuntimeError("binlog reader not initialized".into()))
    }

    // Emit the next row of a partially consumed rows event
    fn next_remaining_row(&mut self, context: &mut LsnContext) -> Result<Option<RowData>> {
        let mut event = self.rows_event.take().expect("caller checked presence");
        let parser = self.parser()?;
        let row = parser.parse(&mut event, context).map_err(|err| {
            error!(code = err.code(), "parse rows event failed");
            err
        })?;
        if !event.is_finished() {
            self.rows_event = Some(event);
        }
        Ok(Some(row))
    }

    fn refresh_schema(&mut self) -> Result<()> {
        let schema = self.info_fetcher.get_table_schema(&self.table_name)?;
        if let Some(parser) = self.parser.as_mut() {
            parser.update_schema(schema.clone());
        }
        self.table_schema = Some(schema);
        Ok(())
    }

    fn process_query_event(&mut self, event: &QueryEvent) -> Result<()> {
        if !is_alter_table_statement(&event.query) {
            return Ok(());
        }
        match self.refresh_schema() {
            Ok(()) => {
                self.schema_changed = true;
                Ok(())
            }
            Err(Error::InvalidCollectionConfig(reason)) => {
                self.suspended = true;
                error!(
                    table = self.table_name.as_str(),
                    reason = reason.as_str(),
                    "table schema and collection config mismatched, reader enters suspended status"
                );
                Err(Error::InvalidCollectionConfig(reason))
            }
            Err(err) => {
                // Retry the refresh on the next call
                self.pending_schema_refresh = true;
                error!(code = err.code(), "info fetcher get table schema failed");
                Err(err)
            }
        }
    }

    fn process_table_map_event(&mut self, event: TableMapEvent) {
        let is_current_table = event
            .database_name
            .eq_ignore_ascii_case(self.info_fetcher.database())
            && event.table_name.eq_ignore_ascii_case(&self.table_name);
        if is_current_table {
            self.log.table_map = Some(Arc::new(event));
            self.skipped_event = false;
        } else {
            // Rows events up to the next map belong to another table
            self.skipped_event = true;
        }
    }

    fn process_rows_event(
        &mut self,
        mut event: RowsEvent,
        context: &mut LsnContext,
    ) -> Result<Option<RowData>> {
        if self.skipped_event {
            return Ok(None);
        }
        let table_map = match self.log.table_map.clone() {
            Some(map) => map,
            None => {
                debug!("rows event before any table map, skipped");
                return Ok(None);
            }
        };
        event.fill_table_map(table_map);

        let parser = self.parser()?;
        let row = parser.parse(&mut event, context)?;
        if !event.is_finished() {
            self.rows_event = Some(event);
        }
        Ok(Some(row))
    }
}

impl MysqlReader for BinlogReader {
    fn init(&mut self) -> Result<()> {
        info!("begin init binlog reader");
        self.refresh_schema().map_err(|err| {
            error!(code = err.code(), "info fetcher get table schema failed");
            err
        })?;
        self.parser = Some(RowsEventParser::new(
            self.table_schema.clone().expect("schema just refreshed"),
        ));
        self.event_fetcher = Some(EventFetcher::new(self.manager.clone()));
        self.suspended = false;
        info!("binlog reader init success");
        Ok(())
    }

    fn start(&mut self, context: &LsnContext) -> Result<()> {
        info!(
            file = context.file_name.as_str(),
            position = context.position,
            "begin start binlog reader"
        );
        let fetcher = self
            .event_fetcher
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("binlog reader not initialized".into()))?;
        fetcher.init(&context.file_name, context.position)?;
        self.log.file_name = context.file_name.clone();
        self.log.position = context.position;
        Ok(())
    }

    fn get_next_row_data(&mut self, context: &mut LsnContext) -> Result<Option<RowData>> {
        if self.suspended {
            return Err(Error::Suspended);
        }
        context.status = RowDataStatus::Normal;

        // Resume whatever the previous call left half done
        if self.rows_event.is_some() {
            let row = self.next_remaining_row(context)?;
            context.file_name = self.log.file_name.clone();
            return Ok(row);
        }
        if self.pending_schema_refresh {
            self.refresh_schema()?;
            self.pending_schema_refresh = false;
            context.status = RowDataStatus::SchemaChanged;
            context.file_name = self.log.file_name.clone();
            return Ok(None);
        }

        let mut row = None;
        loop {
            if self.schema_changed {
                context.status = RowDataStatus::SchemaChanged;
                self.schema_changed = false;
                break;
            }

            let fetched = {
                let fetcher = self
                    .event_fetcher
                    .as_mut()
                    .ok_or_else(|| Error::RuntimeError("binlog reader not initialized".into()))?;
                fetcher.fetch()
            };
            let event = match fetched {
                Ok(event) => event,
                Err(Error::BinlogNoMoreData) => {
                    context.status = RowDataStatus::NoMoreData;
                    break;
                }
                Err(err) => {
                    error!(code = err.code(), "fetch next event failed");
                    return Err(err);
                }
            };

            match event {
                Event::Query(query) => {
                    self.process_query_event(&query)?;
                }
                Event::TableMap(map) => {
                    self.process_table_map_event(map);
                }
                Event::Rows(rows) => {
                    if let Some(parsed) = self.process_rows_event(rows, context)? {
                        row = Some(parsed);
                        break;
                    }
                }
                Event::Rotate(rotate) => {
                    self.log.file_name = rotate.next_file;
                    self.log.position = rotate.position;
                }
                Event::Other(_) => {}
            }
        }
        context.file_name = self.log.file_name.clone();

        if context.status != RowDataStatus::NoMoreData {
            if let Some(row) = &row {
                debug!(primary_key = row.primary_key, status = ?context.status, "row fetched");
            }
        }
        Ok(row)
    }

    fn table_schema(&self) -> Option<Arc<TableSchema>> {
        self.table_schema.clone()
    }

    fn info_fetcher(&self) -> Arc<InfoFetcher> {
        self.info_fetcher.clone()
    }
}

/// Whitespace-tolerant, case-insensitive recognizer for
/// `ALTER TABLE ...` statement text.
pub fn is_alter_table_statement(query: &str) -> bool {
    let rest = query.trim_start_matches([' ', '\t', '\r', '\n']);
    let rest = match strip_keyword(rest, "alter") {
        Some(rest) => rest,
        None => return false,
    };
    if !rest.starts_with([' ', '\t', '\r', '\n']) {
        return false;
    }
    let rest = rest.trim_start_matches([' ', '\t', '\r', '\n']);
    match strip_keyword(rest, "table") {
        // Something must follow the keyword
        Some(rest) => !rest.is_empty(),
        None => false,
    }
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    if text.len() < keyword.len() {
        return None;
    }
    let (head, tail) = text.split_at(keyword.len());
    if head.eq_ignore_ascii_case(keyword) {
        Some(tail)
    } else {
        None
    }
}
