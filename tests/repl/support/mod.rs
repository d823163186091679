//! Scripted connector and table fixtures shared by the repl tests.
//!
//! The watched table is `mytest.t (id INT AUTO_INCREMENT, face VARCHAR(255),
//! age INT)` feeding collection `teachers` with index column `face` and
//! forward column `age`.

pub mod event;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use quiver_core::config::RepositoryConfig;
use quiver_core::error::{Error, Result};
use quiver_repl::connector::{
    Connector, ConnectorManager, FieldMeta, MysqlResultSet, MysqlRow, MysqlUri,
    AUTO_INCREMENT_FLAG,
};
use quiver_repl::field::{Field, FieldAttr};
use quiver_repl::schema::TableSchema;
use quiver_repl::InfoFetcher;

const TYPE_LONG: u8 = 3;
const TYPE_VAR_STRING: u8 = 253;

enum ScanItem {
    Row(MysqlRow),
    Error,
}

/// Shared state every scripted connector reads from.
pub struct ScriptState {
    packets: Mutex<VecDeque<Vec<u8>>>,
    scan_items: Mutex<VecDeque<ScanItem>>,
    queries: Mutex<Vec<String>>,
    server_version: Mutex<String>,
    binlog_format: Mutex<String>,
    fail_events_probe: AtomicBool,
    schema_probes: AtomicUsize,
    drop_face_after_first_probe: bool,
}

/// Script for the healthy table.
pub fn default_script() -> Arc<ScriptState> {
    Arc::new(ScriptState::new(false))
}

/// Script whose schema loses the `face` column after the first probe,
/// simulating an incompatible ALTER.
pub fn alter_schema_script() -> Arc<ScriptState> {
    Arc::new(ScriptState::new(true))
}

impl ScriptState {
    fn new(drop_face_after_first_probe: bool) -> Self {
        ScriptState {
            packets: Mutex::new(VecDeque::new()),
            scan_items: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            server_version: Mutex::new("5.7.32-log".to_string()),
            binlog_format: Mutex::new("ROW".to_string()),
            fail_events_probe: AtomicBool::new(false),
            schema_probes: AtomicUsize::new(0),
            drop_face_after_first_probe,
        }
    }

    /// Queue one binlog event as a dump-stream packet.
    pub fn push_event(&self, event_bytes: &[u8]) {
        let mut packet = Vec::with_capacity(event_bytes.len() + 1);
        packet.push(0); // OK marker ahead of the event buffer
        packet.extend_from_slice(event_bytes);
        self.packets.lock().push_back(packet);
    }

    /// Queue the short 0xFE end-of-stream packet.
    pub fn push_end_of_stream(&self) {
        self.packets.lock().push_back(vec![0xfe]);
    }

    /// Queue one streamed scan row.
    pub fn push_scan_row(&self, row: MysqlRow) {
        self.scan_items.lock().push_back(ScanItem::Row(row));
    }

    /// Queue a mid-stream scan failure.
    pub fn push_scan_error(&self) {
        self.scan_items.lock().push_back(ScanItem::Error);
    }

    /// Make the SHOW BINLOG EVENTS probe fail.
    pub fn fail_binlog_events_probe(&self) {
        self.fail_events_probe.store(true, Ordering::Release);
    }

    /// Override the reported server version.
    pub fn set_server_version(&self, version: &str) {
        *self.server_version.lock() = version.to_string();
    }

    /// Override the reported binlog format.
    pub fn set_binlog_format(&self, format: &str) {
        *self.binlog_format.lock() = format.to_string();
    }

    /// Every SQL statement the pipeline issued.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// The repository config of the fixture collection.
    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            connection_uri: "mysql://127.0.0.1:3306/mytest".to_string(),
            user: "repl".to_string(),
            password: "repl".to_string(),
            table_name: "t".to_string(),
            collection_name: "teachers".to_string(),
            index_columns: vec!["face".to_string()],
            forward_columns: vec!["age".to_string()],
        }
    }

    /// An initialized info fetcher over this script.
    pub fn info_fetcher(self: &Arc<Self>, manager: &Arc<ConnectorManager>) -> Arc<InfoFetcher> {
        let fetcher = InfoFetcher::new(&self.repository_config(), manager.clone()).unwrap();
        fetcher.init().unwrap();
        Arc::new(fetcher)
    }

    fn columns_for(&self, probe: usize) -> Vec<(&'static str, u8, u32, &'static str)> {
        let mut columns = vec![
            ("id", TYPE_LONG, AUTO_INCREMENT_FLAG, ""),
            ("face", TYPE_VAR_STRING, 0, "utf8_general_ci"),
            ("age", TYPE_LONG, 0, ""),
        ];
        if self.drop_face_after_first_probe && probe >= 1 {
            columns.retain(|(name, ..)| *name != "face");
        }
        columns
    }

    fn field_meta(name: &str, type_code: u8, flags: u32) -> FieldMeta {
        FieldMeta {
            name: name.to_string(),
            type_code,
            length: if type_code == TYPE_VAR_STRING { 255 } else { 11 },
            decimals: 0,
            flags,
        }
    }

    fn text_result(fields: &[&str], rows: Vec<Vec<Option<String>>>) -> MysqlResultSet {
        let fields = fields
            .iter()
            .map(|name| Self::field_meta(name, TYPE_VAR_STRING, 0))
            .collect();
        let rows = rows
            .into_iter()
            .map(|cells| {
                MysqlRow::new(
                    cells
                        .into_iter()
                        .map(|c| c.map(|v| v.into_bytes()))
                        .collect(),
                )
            })
            .collect();
        MysqlResultSet::new(fields, rows)
    }

    fn handle_query(&self, sql: &str) -> Result<MysqlResultSet> {
        self.queries.lock().push(sql.to_string());

        if sql.starts_with("SHOW FULL COLUMNS") {
            let probe = self.schema_probes.load(Ordering::Acquire);
            let rows = self
                .columns_for(probe)
                .into_iter()
                .map(|(name, _, _, collation)| {
                    vec![
                        Some(name.to_string()),
                        Some("varchar(255)".to_string()),
                        if collation.is_empty() {
                            None
                        } else {
                            Some(collation.to_string())
                        },
                    ]
                })
                .collect();
            return Ok(Self::text_result(&["Field", "Type", "Collation"], rows));
        }
        if sql.starts_with("SELECT * FROM mytest.t LIMIT 0") {
            let probe = self.schema_probes.fetch_add(1, Ordering::AcqRel);
            let fields = self
                .columns_for(probe)
                .into_iter()
                .map(|(name, type_code, flags, _)| Self::field_meta(name, type_code, flags))
                .collect();
            return Ok(MysqlResultSet::new(fields, Vec::new()));
        }
        if sql.starts_with("SET @master_binlog_checksum") {
            return Ok(MysqlResultSet::default());
        }
        if sql.starts_with("SHOW BINLOG EVENTS") {
            if self.fail_events_probe.load(Ordering::Acquire) {
                return Err(Error::ExecuteMysql("unknown binlog file".into()));
            }
            return Ok(MysqlResultSet::default());
        }
        if sql.starts_with("SHOW BINARY LOGS") {
            return Ok(Self::text_result(
                &["Log_name", "File_size"],
                vec![
                    vec![Some("binlog.000003".to_string()), Some("4096".to_string())],
                    vec![Some("binlog.000005".to_string()), Some("4096".to_string())],
                ],
            ));
        }
        if sql.starts_with("SELECT VERSION()") {
            return Ok(Self::text_result(
                &["VERSION()"],
                vec![vec![Some(self.server_version.lock().clone())]],
            ));
        }
        if sql.starts_with("SHOW GLOBAL VARIABLES LIKE 'binlog_format'") {
            return Ok(Self::text_result(
                &["Variable_name", "Value"],
                vec![vec![
                    Some("binlog_format".to_string()),
                    Some(self.binlog_format.lock().clone()),
                ]],
            ));
        }
        if sql.starts_with("SELECT * FROM INFORMATION_SCHEMA.SCHEMATA") {
            return Ok(Self::text_result(
                &["SCHEMA_NAME"],
                vec![vec![Some("mytest".to_string())]],
            ));
        }
        if sql.starts_with("SHOW MASTER STATUS") {
            return Ok(Self::text_result(
                &["File", "Position"],
                vec![vec![
                    Some("binlog.000004".to_string()),
                    Some("154".to_string()),
                ]],
            ));
        }
        if sql.starts_with("LOCK TABLE") || sql.starts_with("UNLOCK TABLES") {
            return Ok(MysqlResultSet::default());
        }
        Err(Error::ExecuteMysql(format!("unscripted statement: {sql}")))
    }
}

struct MockConnector {
    state: Arc<ScriptState>,
    uri: MysqlUri,
}

impl Connector for MockConnector {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn reconnect(&mut self) -> bool {
        true
    }

    fn execute_query(&mut self, sql: &str) -> Result<MysqlResultSet> {
        self.state.handle_query(sql)
    }

    fn execute_streaming_query(&mut self, sql: &str) -> Result<Vec<FieldMeta>> {
        self.state.queries.lock().push(sql.to_string());
        // Scan SELECT order: primary key, index columns, forward columns
        Ok(vec![
            ScriptState::field_meta("id", TYPE_LONG, AUTO_INCREMENT_FLAG),
            ScriptState::field_meta("face", TYPE_VAR_STRING, 0),
            ScriptState::field_meta("age", TYPE_LONG, 0),
        ])
    }

    fn fetch_stream_row(&mut self) -> Result<Option<MysqlRow>> {
        match self.state.scan_items.lock().pop_front() {
            Some(ScanItem::Row(row)) => Ok(Some(row)),
            Some(ScanItem::Error) => Err(Error::FetchMysqlResult),
            None => Ok(None),
        }
    }

    fn execute_simple_command(&mut self, _command: u8, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        self.state
            .packets
            .lock()
            .pop_front()
            .ok_or_else(|| Error::ConnectMysql("scripted stream exhausted".into()))
    }

    fn uri(&self) -> &MysqlUri {
        &self.uri
    }
}

/// Connector pool producing scripted connectors over shared state.
pub fn manager_with_script(state: &Arc<ScriptState>) -> Arc<ConnectorManager> {
    let state = state.clone();
    ConnectorManager::with_factory(Box::new(move || {
        Ok(Box::new(MockConnector {
            state: state.clone(),
            uri: MysqlUri {
                host: "127.0.0.1".to_string(),
                port: 3306,
                database: "mytest".to_string(),
            },
        }) as Box<dyn Connector>)
    }))
}

/// The fixture table's schema, built directly for parser-level tests.
pub fn schema_from_script() -> Arc<TableSchema> {
    let id = Field::new(
        "id",
        &FieldAttr {
            is_index: false,
            is_forward: false,
            collation: String::new(),
            meta: ScriptState::field_meta("id", TYPE_LONG, AUTO_INCREMENT_FLAG),
        },
    );
    let face = Field::new(
        "face",
        &FieldAttr {
            is_index: true,
            is_forward: false,
            collation: "utf8_general_ci".to_string(),
            meta: ScriptState::field_meta("face", TYPE_VAR_STRING, 0),
        },
    );
    let age = Field::new(
        "age",
        &FieldAttr {
            is_index: false,
            is_forward: true,
            collation: String::new(),
            meta: ScriptState::field_meta("age", TYPE_LONG, 0),
        },
    );
    Arc::new(TableSchema::new(
        vec![Arc::new(id), Arc::new(face), Arc::new(age)],
        0,
    ))
}

/// A streamed scan row for the fixture table: `id, face, age`.
pub fn row_values(pk: u64, face: &str, age: i32) -> MysqlRow {
    MysqlRow::new(vec![
        Some(pk.to_string().into_bytes()),
        Some(face.as_bytes().to_vec()),
        Some(age.to_string().into_bytes()),
    ])
}
