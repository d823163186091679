//! MysqlHandler: entry point of the ingestion pipeline.
//!
//! Validates the source, then owns one reader at a time: a `TableReader`
//! for the initial full scan or a `BinlogReader` for change data. A
//! collection has exactly one write source; the handler is it.

use std::sync::Arc;

use tracing::{error, info};

use quiver_core::config::RepositoryConfig;
use quiver_core::error::{Error, Result};
use quiver_core::proto::{LsnContext, RowData};

use crate::binlog_reader::BinlogReader;
use crate::connector::{ConnectorManager, MysqlUri};
use crate::info_fetcher::InfoFetcher;
use crate::schema::TableSchema;
use crate::table_reader::TableReader;
use crate::validator::MysqlValidator;

/// Which cursor the handler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Initial full table scan
    Full,
    /// Binlog change data
    Increment,
}

/// Resumable row source, either scan or binlog.
pub trait MysqlReader: Send {
    /// Acquire resources and read the table schema.
    fn init(&mut self) -> Result<()>;

    /// Position the cursor.
    fn start(&mut self, context: &LsnContext) -> Result<()>;

    /// Next logical row. `None` with a non-`Normal` status signals
    /// NO_MORE_DATA or SCHEMA_CHANGED.
    fn get_next_row_data(&mut self, context: &mut LsnContext) -> Result<Option<RowData>>;

    /// Schema the cursor currently decodes against.
    fn table_schema(&self) -> Option<Arc<TableSchema>>;

    /// The shared info fetcher.
    fn info_fetcher(&self) -> Arc<InfoFetcher>;
}

/// One watched table's ingestion front end.
pub struct MysqlHandler {
    config: RepositoryConfig,
    manager: Arc<ConnectorManager>,
    info_fetcher: Option<Arc<InfoFetcher>>,
    reader: Option<Box<dyn MysqlReader>>,
    inited: bool,
}

impl MysqlHandler {
    /// Handler over a TCP connector pool built from the config.
    pub fn new(config: &RepositoryConfig) -> Result<Self> {
        let uri = MysqlUri::parse(&config.connection_uri)?;
        let manager = ConnectorManager::new(uri, &config.user, &config.password);
        Ok(Self::with_manager(config, manager))
    }

    /// Handler over an explicit pool (tests inject scripted connectors).
    pub fn with_manager(config: &RepositoryConfig, manager: Arc<ConnectorManager>) -> Self {
        MysqlHandler {
            config: config.clone(),
            manager,
            info_fetcher: None,
            reader: None,
            inited: false,
        }
    }

    /// Validate the source and build the reader for `mode`.
    pub fn init(&mut self, mode: ScanMode) -> Result<()> {
        if self.inited {
            return Err(Error::LogicError("handler already initialized".into()));
        }
        self.validate_mysql()?;

        let info_fetcher = Arc::new(InfoFetcher::new(&self.config, self.manager.clone())?);
        info_fetcher.init()?;
        self.info_fetcher = Some(info_fetcher.clone());

        let mut reader = self.build_reader(mode, info_fetcher);
        reader.init()?;
        self.reader = Some(reader);
        self.inited = true;
        info!(
            collection = self.config.collection_name.as_str(),
            table = self.config.table_name.as_str(),
            ?mode,
            "mysql handler ready"
        );
        Ok(())
    }

    fn build_reader(&self, mode: ScanMode, info_fetcher: Arc<InfoFetcher>) -> Box<dyn MysqlReader> {
        match mode {
            ScanMode::Full => Box::new(TableReader::new(
                &self.config.table_name,
                info_fetcher,
                self.manager.clone(),
            )),
            ScanMode::Increment => Box::new(BinlogReader::new(
                &self.config.table_name,
                info_fetcher,
                self.manager.clone(),
            )),
        }
    }

    /// Position the current reader.
    pub fn start(&mut self, context: &LsnContext) -> Result<()> {
        self.reader_mut()?.start(context)
    }

    /// Next logical row from the current reader.
    pub fn get_next_row_data(&mut self, context: &mut LsnContext) -> Result<Option<RowData>> {
        self.reader_mut()?.get_next_row_data(context)
    }

    /// Swap the reader (e.g. scan finished, switch to increments) and
    /// reposition it.
    pub fn reset_status(&mut self, mode: ScanMode, context: &LsnContext) -> Result<()> {
        let info_fetcher = self
            .info_fetcher
            .clone()
            .ok_or_else(|| Error::RuntimeError("handler not initialized".into()))?;
        let mut reader = self.build_reader(mode, info_fetcher);
        reader.init()?;
        reader.start(context)?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Binlog `(file, position)` snapshot of the watched table.
    pub fn get_table_snapshot(&self) -> Result<(String, u64)> {
        let info_fetcher = self
            .info_fetcher
            .as_ref()
            .ok_or_else(|| Error::RuntimeError("handler not initialized".into()))?;
        info_fetcher.get_table_snapshot(&self.config.table_name)
    }

    /// Schema the current reader decodes against.
    pub fn table_schema(&self) -> Option<Arc<TableSchema>> {
        self.reader.as_ref().and_then(|r| r.table_schema())
    }

    fn reader_mut(&mut self) -> Result<&mut Box<dyn MysqlReader>> {
        self.reader
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("handler not initialized".into()))
    }

    fn validate_mysql(&self) -> Result<()> {
        let uri = MysqlUri::parse(&self.config.connection_uri)?;
        let mut validator = MysqlValidator::new(&uri.database, self.manager.clone());
        validator.init()?;
        validator.validate_version().map_err(|err| {
            error!(code = err.code(), "mysql version validation failed");
            err
        })?;
        validator.validate_binlog_format().map_err(|err| {
            error!(code = err.code(), "binlog format validation failed");
            err
        })?;
        validator.validate_database_exist()
    }
}
