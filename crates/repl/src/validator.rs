//! Source-server validation.
//!
//! The pipeline only speaks to MySQL 5.7 with ROW binlog format; both are
//! checked once at handler init, together with the configured database.

use std::sync::Arc;

use tracing::error;

use quiver_core::error::{Error, Result};

use crate::connector::{ConnectorManager, ConnectorProxy};
use crate::sql::SqlBuilder;

const SUPPORTED_MAJOR: &str = "5";
const SUPPORTED_MINOR: &str = "7";

/// Validates the source server before any reader starts.
pub struct MysqlValidator {
    proxy: Option<ConnectorProxy>,
    manager: Arc<ConnectorManager>,
    database: String,
}

impl MysqlValidator {
    /// Validator over the shared pool.
    pub fn new(database: &str, manager: Arc<ConnectorManager>) -> Self {
        MysqlValidator {
            proxy: None,
            manager,
            database: database.to_string(),
        }
    }

    /// Check a connection out of the pool.
    pub fn init(&mut self) -> Result<()> {
        if self.proxy.is_none() {
            self.proxy = Some(self.manager.get()?);
        }
        Ok(())
    }

    fn proxy(&mut self) -> Result<&mut ConnectorProxy> {
        self.proxy
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("validator not initialized".into()))
    }

    /// The server must be MySQL 5.7.
    pub fn validate_version(&mut self) -> Result<()> {
        let mut result = self
            .proxy()?
            .connector()
            .execute_query(SqlBuilder::select_version())?;
        if result.rows_num() != 1 || result.fields_num() != 1 {
            return Err(Error::InvalidMysqlResult(
                "version probe returned unexpected shape".into(),
            ));
        }
        let row = result
            .next()
            .ok_or_else(|| Error::InvalidMysqlResult("version probe returned no row".into()))?;
        let version = row
            .field_value(0)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let mut parts = version.split('.');
        let supported = parts.next() == Some(SUPPORTED_MAJOR)
            && parts.next() == Some(SUPPORTED_MINOR);
        if !supported {
            error!(version = version.as_str(), "only mysql 5.7 is supported");
            return Err(Error::UnsupportedMysqlVersion(version));
        }
        Ok(())
    }

    /// binlog_format must be ROW.
    pub fn validate_binlog_format(&mut self) -> Result<()> {
        let mut result = self
            .proxy()?
            .connector()
            .execute_query(SqlBuilder::show_binlog_format())?;
        if result.rows_num() != 1 || result.fields_num() != 2 {
            return Err(Error::InvalidMysqlResult(
                "binlog_format probe returned unexpected shape".into(),
            ));
        }
        let row = result
            .next()
            .ok_or_else(|| Error::InvalidMysqlResult("binlog_format probe returned no row".into()))?;
        let format = row
            .field_value(1)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        if format != "ROW" {
            error!(format = format.as_str(), "only ROW binlog format is supported");
            return Err(Error::UnsupportedBinlogFormat(format));
        }
        Ok(())
    }

    /// The configured database must exist.
    pub fn validate_database_exist(&mut self) -> Result<()> {
        let database = self.database.clone();
        let result = self
            .proxy()?
            .connector()
            .execute_query(&SqlBuilder::select_db(&database))?;
        if result.rows_num() != 1 {
            return Err(Error::InvalidCollectionConfig(format!(
                "database {database} does not exist"
            )));
        }
        Ok(())
    }
}
