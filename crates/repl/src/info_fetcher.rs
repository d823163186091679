//! Table schema and snapshot discovery.
//!
//! The info fetcher owns one pooled connection and answers two questions:
//! what does the watched table look like right now (columns, collations,
//! auto-increment key), and where does its binlog currently end (snapshot
//! position, taken under a table READ lock).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use quiver_core::config::RepositoryConfig;
use quiver_core::error::{Error, Result};

use crate::connector::{Connector, ConnectorManager, ConnectorProxy, MysqlUri};
use crate::field::{Field, FieldAttr};
use crate::schema::{SelectedFields, TableSchema};
use crate::sql::SqlBuilder;

/// Discovers schemas and snapshot positions for one watched table.
pub struct InfoFetcher {
    config: RepositoryConfig,
    database: String,
    selected: SelectedFields,
    manager: Arc<ConnectorManager>,
    proxy: Mutex<Option<ConnectorProxy>>,
}

impl InfoFetcher {
    /// Fetcher over the collection's repository config.
    pub fn new(config: &RepositoryConfig, manager: Arc<ConnectorManager>) -> Result<InfoFetcher> {
        let uri = MysqlUri::parse(&config.connection_uri)?;
        let selected = SelectedFields::new(
            config.index_columns.clone(),
            config.forward_columns.clone(),
        );
        if selected.is_empty() {
            return Err(Error::InvalidCollectionConfig(
                "no index or forward columns selected".into(),
            ));
        }
        Ok(InfoFetcher {
            config: config.clone(),
            database: uri.database,
            selected,
            manager,
            proxy: Mutex::new(None),
        })
    }

    /// Check a connection out of the pool.
    pub fn init(&self) -> Result<()> {
        let mut proxy = self.proxy.lock();
        if proxy.is_none() {
            *proxy = Some(self.manager.get()?);
        }
        info!(table = self.config.table_name.as_str(), "info fetcher ready");
        Ok(())
    }

    /// Database (schema) name of the watched table.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Selected column names.
    pub fn selected_fields(&self) -> &SelectedFields {
        &self.selected
    }

    fn with_connector<T>(
        &self,
        f: impl FnOnce(&mut dyn Connector) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.proxy.lock();
        let proxy = guard
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("info fetcher not initialized".into()))?;
        f(proxy.connector())
    }

    /// Read the table's current schema and project the selection onto it.
    ///
    /// Fails with `InvalidCollectionConfig` when the table no longer carries
    /// every selected column or lost its auto-increment key; that is the
    /// signal that suspends a binlog reader.
    pub fn get_table_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        let collations = self.get_collation_info(table)?;

        let result = self.with_connector(|connector| {
            connector.execute_query(&SqlBuilder::get_schema(&self.database, table))
        })?;
        if result.fields_num() == 0 {
            return Err(Error::InvalidMysqlResult("schema probe returned no columns".into()));
        }

        let mut fields = Vec::with_capacity(result.fields_num());
        let mut auto_increment_id = None;
        let mut found_index = 0usize;
        let mut found_forward = 0usize;
        for (i, meta) in result.fields.iter().enumerate() {
            let attr = FieldAttr {
                is_index: self.selected.is_index(&meta.name),
                is_forward: self.selected.is_forward(&meta.name),
                collation: collations.get(&meta.name).cloned().unwrap_or_default(),
                meta: meta.clone(),
            };
            if attr.is_index {
                found_index += 1;
            }
            if attr.is_forward {
                found_forward += 1;
            }
            if meta.is_auto_increment() && auto_increment_id.is_none() {
                auto_increment_id = Some(i);
            }
            fields.push(Arc::new(Field::new(&meta.name, &attr)));
        }

        if found_index != self.selected.index_fields().len()
            || found_forward != self.selected.forward_fields().len()
        {
            error!(
                table,
                found_index,
                found_forward,
                "table schema and collection config mismatched"
            );
            return Err(Error::InvalidCollectionConfig(format!(
                "table {table} is missing selected columns"
            )));
        }
        let auto_increment_id = auto_increment_id.ok_or_else(|| {
            Error::InvalidCollectionConfig(format!("table {table} has no auto-increment key"))
        })?;

        Ok(Arc::new(TableSchema::new(fields, auto_increment_id)))
    }

    // SHOW FULL COLUMNS: Field at 0, Collation at 2
    fn get_collation_info(&self, table: &str) -> Result<HashMap<String, String>> {
        let mut result = self.with_connector(|connector| {
            connector.execute_query(&SqlBuilder::show_full_columns(&self.database, table))
        })?;
        if result.fields_num() < 3 {
            return Err(Error::InvalidMysqlResult(
                "show full columns returned too few fields".into(),
            ));
        }
        let mut collations = HashMap::new();
        while let Some(row) = result.next() {
            let name = row
                .field_value(0)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .ok_or_else(|| Error::InvalidMysqlResult("column row without a name".into()))?;
            let collation = row
                .field_value(2)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            collations.insert(name, collation);
        }
        Ok(collations)
    }

    /// Binlog `(file, position)` snapshot of the table, taken under a READ
    /// lock so scan and replay meet at one point.
    pub fn get_table_snapshot(&self, table: &str) -> Result<(String, u64)> {
        self.with_connector(|connector| {
            connector.execute_query(&SqlBuilder::lock_table(&self.database, table))?;
            let snapshot = Self::read_master_status(connector);
            // The lock must drop even when the status read failed
            let unlock = connector.execute_query(SqlBuilder::unlock_tables());
            let (file, position) = snapshot?;
            unlock?;
            Ok((file, position))
        })
    }

    fn read_master_status(connector: &mut dyn Connector) -> Result<(String, u64)> {
        let mut result = connector.execute_query(SqlBuilder::show_master_status())?;
        if result.fields_num() < 2 {
            return Err(Error::InvalidMysqlResult(
                "master status returned too few fields".into(),
            ));
        }
        let row = result
            .next()
            .ok_or_else(|| Error::InvalidMysqlResult("master status returned no rows".into()))?;
        let file = row
            .field_value(0)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .ok_or_else(|| Error::InvalidMysqlResult("master status without a file".into()))?;
        let position = row
            .field_value(1)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidMysqlResult("master status without a position".into()))?;
        Ok((file, position))
    }
}
