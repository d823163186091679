//! Dump-protocol event fetcher.
//!
//! Wraps a pooled connection: disables binlog checksums, validates the
//! requested `(file, position)` (falling back to the smallest strictly
//! greater file at position 4), issues COM_BINLOG_DUMP with a synthetic
//! server id, and reads one event per `fetch`. A short 0xFE packet marks
//! end-of-stream: the connection is flagged for reconnect and the caller
//! decides whether to sleep and retry.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use quiver_core::error::{Error, Result};

use crate::connector::{ConnectorManager, ConnectorProxy, COM_BINLOG_DUMP};
use crate::event::Event;
use crate::sql::SqlBuilder;

const BINLOG_DUMP_NON_BLOCK: u16 = 1;
const BINLOG_FILE_START: u64 = 4;

/// Resumable dump-stream client.
pub struct EventFetcher {
    manager: Arc<ConnectorManager>,
    proxy: Option<ConnectorProxy>,
    event_idx: u64,
    file_name: String,
    position: u64,
    need_reconnect: bool,
    server_id: u32,
}

impl EventFetcher {
    /// Fetcher over the shared connector pool.
    pub fn new(manager: Arc<ConnectorManager>) -> Self {
        EventFetcher {
            manager,
            proxy: None,
            event_idx: 0,
            file_name: String::new(),
            position: 0,
            need_reconnect: false,
            server_id: 0,
        }
    }

    /// Connect, negotiate, and start dumping at `(file_name, position)`.
    pub fn init(&mut self, file_name: &str, position: u64) -> Result<()> {
        self.proxy = Some(self.manager.get()?);
        self.event_idx = 0;
        self.turnoff_checksum()?;
        self.update_lsn_info(file_name, position)?;
        let (file, pos) = (self.file_name.clone(), self.position);
        self.request_dump(&file, pos)?;
        Ok(())
    }

    /// Current stream position.
    pub fn position(&self) -> (&str, u64) {
        (&self.file_name, self.position)
    }

    fn proxy(&mut self) -> Result<&mut ConnectorProxy> {
        self.proxy
            .as_mut()
            .ok_or_else(|| Error::RuntimeError("event fetcher not initialized".into()))
    }

    fn turnoff_checksum(&mut self) -> Result<()> {
        let proxy = self.proxy()?;
        proxy
            .connector()
            .execute_query(SqlBuilder::turn_off_checksum())
            .map_err(|err| {
                error!(code = err.code(), "turnoff checksum failed");
                err
            })?;
        Ok(())
    }

    // Probe the pair; on failure fall back to the smallest file name
    // strictly greater than the requested one, at the file start.
    fn update_lsn_info(&mut self, file_name: &str, position: u64) -> Result<()> {
        let probe = {
            let proxy = self.proxy()?;
            proxy
                .connector()
                .execute_query(&SqlBuilder::select_events(file_name, position))
        };
        if probe.is_ok() {
            self.file_name = file_name.to_string();
            self.position = position;
            return Ok(());
        }
        error!(
            file_name,
            position, "current lsn info is invalid, skipped"
        );

        let mut result = {
            let proxy = self.proxy()?;
            proxy
                .connector()
                .execute_query(SqlBuilder::show_binary_logs())?
        };
        if result.fields_num() != 2 {
            error!(fields = result.fields_num(), "binary logs fields mismatched");
            return Err(Error::InvalidMysqlResult(
                "SHOW BINARY LOGS returned unexpected fields".into(),
            ));
        }
        while let Some(row) = result.next() {
            let candidate = row
                .field_value(0)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            if file_name < candidate.as_str() {
                self.file_name = candidate;
                self.position = BINLOG_FILE_START;
                info!(
                    file_name = self.file_name.as_str(),
                    position = self.position,
                    "binlog lsn updated"
                );
                return Ok(());
            }
        }
        Err(Error::RuntimeError(format!(
            "no binlog file after {file_name}"
        )))
    }

    // Dump request payload: position(4) | flags(2) | server_id(4) | file
    fn request_dump(&mut self, file_name: &str, position: u64) -> Result<()> {
        if self.server_id == 0 {
            self.server_id = generate_server_id();
        }
        let mut payload = Vec::with_capacity(10 + file_name.len());
        payload.extend_from_slice(&(position as u32).to_le_bytes());
        payload.extend_from_slice(&BINLOG_DUMP_NON_BLOCK.to_le_bytes());
        payload.extend_from_slice(&self.server_id.to_le_bytes());
        payload.extend_from_slice(file_name.as_bytes());

        let proxy = self.proxy()?;
        proxy
            .connector()
            .execute_simple_command(COM_BINLOG_DUMP, &payload)
            .map_err(|err| {
                error!(code = err.code(), "execute COM_BINLOG_DUMP command failed");
                err
            })
    }

    fn read_data(&mut self) -> Result<Vec<u8>> {
        if self.need_reconnect {
            std::thread::sleep(Duration::from_secs(1));
            let reconnected = {
                let proxy = self.proxy()?;
                proxy.connector().reconnect()
            };
            if !reconnected {
                return Err(Error::ConnectMysql("binlog reconnect failed".into()));
            }
            self.turnoff_checksum()?;
            let (file, pos) = (self.file_name.clone(), self.position);
            self.request_dump(&file, pos)?;
            self.need_reconnect = false;
            self.event_idx = 0;
        }
        let proxy = self.proxy()?;
        proxy.connector().read_packet()
    }

    /// Read and decode the next event.
    pub fn fetch(&mut self) -> Result<Event> {
        let payload = self.read_data().map_err(|err| {
            self.need_reconnect = true;
            error!(code = err.code(), "read event failed");
            err
        })?;

        // End-of-stream marker: 0xFE with a short payload
        if payload.len() < 8 && payload.first() == Some(&0xfe) {
            self.need_reconnect = true;
            return Err(Error::BinlogNoMoreData);
        }
        if payload.is_empty() {
            return Err(Error::InvalidRowData("empty event packet".into()));
        }

        self.event_idx += 1;
        let event = Event::parse(&payload[1..], self.event_idx == 1)?;

        if event.header().log_pos != 0 {
            self.position = event.header().log_pos as u64;
        }
        if let Event::Rotate(rotate) = &event {
            self.file_name = rotate.next_file.clone();
            self.position = rotate.position;
            debug!(
                file = self.file_name.as_str(),
                position = self.position,
                "rotate event info"
            );
        }
        Ok(event)
    }
}

// Timestamp-derived id, kept above the range of real replicas
fn generate_server_id() -> u32 {
    loop {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u32)
            .unwrap_or(0);
        if micros > 10_000 {
            return micros;
        }
    }
}
