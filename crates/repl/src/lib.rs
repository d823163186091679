//! MySQL replication ingestion: binlog parsing and table scanning.
//!
//! The pipeline mirrors a replica: an `EventFetcher` speaks the dump
//! protocol, `event` decodes the ROW-format stream, `field` turns typed
//! column payloads into tagged values, and two resumable cursors
//! (`BinlogReader` for change data, `TableReader` for the initial full scan)
//! emit logical rows keyed by `(file, position)` / `seq_id`.

#![warn(clippy::all)]

pub mod binlog_reader;
pub mod connector;
pub mod event;
pub mod fetcher;
pub mod field;
pub mod handler;
pub mod info_fetcher;
pub mod packet;
pub mod rows_parser;
pub mod schema;
pub mod sql;
pub mod table_reader;
pub mod validator;

pub use binlog_reader::BinlogReader;
pub use connector::{
    Connector, ConnectorManager, ConnectorProxy, FieldMeta, MysqlResultSet, MysqlRow, MysqlUri,
};
pub use event::{ColumnInfo, Event, EventHeader, EventType, RowsEvent, TableMapEvent};
pub use fetcher::EventFetcher;
pub use field::{Field, FieldAttr};
pub use handler::{MysqlHandler, MysqlReader, ScanMode};
pub use info_fetcher::InfoFetcher;
pub use rows_parser::RowsEventParser;
pub use schema::TableSchema;
pub use table_reader::TableReader;
