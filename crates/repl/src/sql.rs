//! SQL statement builders for the replication pipeline.

/// Statement text builders. Everything the pipeline sends lives here so the
/// tests can script a connector against exact strings.
pub struct SqlBuilder;

impl SqlBuilder {
    /// Full scan of a table above a sequence id, primary key first.
    pub fn scan_table(
        database: &str,
        table: &str,
        auto_inc_field: &str,
        select_fields: &[String],
        seq_id: u64,
    ) -> String {
        let mut sql = format!("SELECT {auto_inc_field}");
        for field in select_fields {
            sql.push_str(", ");
            sql.push_str(field);
        }
        sql.push_str(&format!(
            " FROM {database}.{table} WHERE {auto_inc_field} > {seq_id}"
        ));
        sql
    }

    /// Zero-row SELECT used to learn a table's column metadata.
    pub fn get_schema(database: &str, table: &str) -> String {
        format!("SELECT * FROM {database}.{table} LIMIT 0")
    }

    /// Shared read lock while the snapshot position is taken.
    pub fn lock_table(database: &str, table: &str) -> String {
        format!("LOCK TABLE {database}.{table} READ")
    }

    /// Probe whether a `(file, position)` pair addresses a real event.
    pub fn select_events(file_name: &str, position: u64) -> String {
        format!("SHOW BINLOG EVENTS IN '{file_name}' from {position} LIMIT 1")
    }

    /// Collation lookup per column.
    pub fn show_full_columns(database: &str, table: &str) -> String {
        format!("SHOW FULL COLUMNS FROM {table} IN {database}")
    }

    /// List binlog files.
    pub fn show_binary_logs() -> &'static str {
        "SHOW BINARY LOGS"
    }

    /// Release table locks.
    pub fn unlock_tables() -> &'static str {
        "UNLOCK TABLES"
    }

    /// Server version probe.
    pub fn select_version() -> &'static str {
        "SELECT VERSION()"
    }

    /// binlog_format probe.
    pub fn show_binlog_format() -> &'static str {
        "SHOW GLOBAL VARIABLES LIKE 'binlog_format'"
    }

    /// Current binlog file and position.
    pub fn show_master_status() -> &'static str {
        "SHOW MASTER STATUS"
    }

    /// Disable binlog checksums for this session.
    pub fn turn_off_checksum() -> &'static str {
        "SET @master_binlog_checksum='NONE'"
    }

    /// Database existence probe.
    pub fn select_db(database: &str) -> String {
        format!("SELECT * FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME='{database}'")
    }
}
