//! Replication pipeline integration tests over a scripted connector.

mod support;

use quiver_core::error::Error;
use quiver_core::proto::{LsnContext, RowDataStatus, RowOperation};
use quiver_core::value::Value;
use quiver_repl::event::{Event, EventType, RowsEvent, TableMapEvent};
use quiver_repl::handler::{MysqlReader, ScanMode};
use quiver_repl::rows_parser::RowsEventParser;
use quiver_repl::{BinlogReader, EventFetcher, MysqlHandler, TableReader};

use support::{
    alter_schema_script, default_script, event::EventBuilder, manager_with_script, row_values,
    schema_from_script,
};

const BINLOG_FILE: &str = "binlog.000004";

fn start_context() -> LsnContext {
    LsnContext::with_position(BINLOG_FILE, 4)
}

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

#[test]
fn query_event_round_trips_text() {
    let bytes = EventBuilder::query_event("mytest", "ALTER TABLE mytest.t ADD COLUMN x INT", 4).0;
    let event = Event::parse(&bytes, false).unwrap();
    match event {
        Event::Query(query) => {
            assert_eq!(query.db_name, "mytest");
            assert_eq!(query.query, "ALTER TABLE mytest.t ADD COLUMN x INT");
        }
        other => panic!("unexpected event {:?}", other.header().event_type),
    }
}

#[test]
fn rotate_event_crc_depends_on_stream_position() {
    let with_crc = EventBuilder::rotate_event("binlog.000005", 4, true);
    match Event::parse(&with_crc, false).unwrap() {
        Event::Rotate(rotate) => {
            assert_eq!(rotate.next_file, "binlog.000005");
            assert_eq!(rotate.position, 4);
        }
        _ => panic!("expected rotate"),
    }

    let without_crc = EventBuilder::rotate_event("binlog.000005", 4, false);
    match Event::parse(&without_crc, true).unwrap() {
        Event::Rotate(rotate) => assert_eq!(rotate.next_file, "binlog.000005"),
        _ => panic!("expected rotate"),
    }
}

#[test]
fn table_map_reads_column_layout() {
    let (bytes, _) = EventBuilder::table_map(4);
    let map = match Event::parse(&bytes, false).unwrap() {
        Event::TableMap(map) => map,
        _ => panic!("expected table map"),
    };
    assert_eq!(map.database_name, "mytest");
    assert_eq!(map.table_name, "t");
    assert_eq!(map.column_count, 3);
    // id LONG, face VARCHAR(meta 255), age LONG
    assert_eq!(map.column_info(0).type_code, 3);
    assert_eq!(map.column_info(1).type_code, 15);
    assert_eq!(map.column_info(1).meta, 255);
    assert_eq!(map.start_position(), 4);
}

#[test]
fn oversized_metadata_block_is_invalid_row_data() {
    let bytes = EventBuilder::table_map_with_meta_size(4, 7);
    assert!(matches!(
        Event::parse(&bytes, false),
        Err(Error::InvalidRowData(_))
    ));
}

#[test]
fn rows_v2_short_extra_header_fails_the_event() {
    let (map_bytes, end) = EventBuilder::table_map(4);
    let _ = Event::parse(&map_bytes, false).unwrap();
    let bytes = EventBuilder::write_rows_short_extra(end);
    assert!(matches!(
        Event::parse(&bytes, false),
        Err(Error::InvalidRowData(_))
    ));
}

// ---------------------------------------------------------------------------
// Rows event parsing
// ---------------------------------------------------------------------------

fn parse_map_and_rows(rows: &[(u64, &str, i32)]) -> (TableMapEvent, RowsEvent) {
    let (map_bytes, map_end) = EventBuilder::table_map(4);
    let map = match Event::parse(&map_bytes, false).unwrap() {
        Event::TableMap(map) => map,
        _ => panic!("expected table map"),
    };
    let (rows_bytes, _) = EventBuilder::write_rows(map_end, rows);
    let rows_event = match Event::parse(&rows_bytes, false).unwrap() {
        Event::Rows(event) => event,
        _ => panic!("expected rows event"),
    };
    (map, rows_event)
}

#[test]
fn k_row_event_parses_exactly_k_times() {
    let schema = schema_from_script();
    let parser = RowsEventParser::new(schema);
    let rows = [(1u64, "1,2,3,4", 30), (2, "5,6,7,8", 31), (3, "9,9,9,9", 32)];
    let (map, mut event) = parse_map_and_rows(&rows);
    event.fill_table_map(std::sync::Arc::new(map));

    let mut context = start_context();
    for (i, (pk, vector, age)) in rows.iter().enumerate() {
        assert!(!event.is_finished(), "row {i} should remain");
        let row = parser.parse(&mut event, &mut context).unwrap();
        assert_eq!(row.primary_key, *pk);
        assert_eq!(row.operation, RowOperation::Insert);
        assert_eq!(row.index_values, vec![Value::String((*vector).into())]);
        assert_eq!(row.forward_values, vec![Value::Int32(*age)]);
    }
    // The k-th parse consumed exactly the payload
    assert!(event.is_finished());
    assert!(event.remaining().is_empty());
}

#[test]
fn resume_position_points_at_the_map_until_the_event_drains() {
    let schema = schema_from_script();
    let parser = RowsEventParser::new(schema);
    let rows = [(1u64, "1,2,3,4", 30), (2, "5,6,7,8", 31)];
    let (map, mut event) = parse_map_and_rows(&rows);
    let map_start = map.start_position();
    let rows_end = event.header.log_pos as u64;
    event.fill_table_map(std::sync::Arc::new(map));

    let mut context = start_context();
    parser.parse(&mut event, &mut context).unwrap();
    // Mid-event: resuming must replay the TABLE_MAP
    assert_eq!(context.position, map_start);

    parser.parse(&mut event, &mut context).unwrap();
    // Drained: the cursor moves past the group
    assert_eq!(context.position, rows_end);
}

#[test]
fn update_event_emits_the_after_image() {
    let schema = schema_from_script();
    let parser = RowsEventParser::new(schema);
    let (map_bytes, map_end) = EventBuilder::table_map(4);
    let map = match Event::parse(&map_bytes, false).unwrap() {
        Event::TableMap(map) => map,
        _ => panic!("expected table map"),
    };
    let (bytes, _) =
        EventBuilder::update_rows(map_end, &[((7, "1,2,3,4", 30), (7, "2,2,2,2", 44))]);
    let mut event = match Event::parse(&bytes, false).unwrap() {
        Event::Rows(event) => event,
        _ => panic!("expected rows event"),
    };
    assert_eq!(event.header.event_type, EventType::UpdateRows);
    event.fill_table_map(std::sync::Arc::new(map));

    let mut context = start_context();
    let row = parser.parse(&mut event, &mut context).unwrap();
    assert_eq!(row.operation, RowOperation::Update);
    assert_eq!(row.primary_key, 7);
    assert_eq!(row.index_values, vec![Value::String("2,2,2,2".into())]);
    assert_eq!(row.forward_values, vec![Value::Int32(44)]);
    assert!(event.is_finished());
}

#[test]
fn delete_event_carries_no_column_values() {
    let schema = schema_from_script();
    let parser = RowsEventParser::new(schema);
    let (map_bytes, map_end) = EventBuilder::table_map(4);
    let map = match Event::parse(&map_bytes, false).unwrap() {
        Event::TableMap(map) => map,
        _ => panic!("expected table map"),
    };
    let (bytes, _) = EventBuilder::delete_rows(map_end, &[(5, "1,2,3,4", 30)]);
    let mut event = match Event::parse(&bytes, false).unwrap() {
        Event::Rows(event) => event,
        _ => panic!("expected rows event"),
    };
    event.fill_table_map(std::sync::Arc::new(map));

    let mut context = start_context();
    let row = parser.parse(&mut event, &mut context).unwrap();
    assert_eq!(row.operation, RowOperation::Delete);
    assert_eq!(row.primary_key, 5);
    assert!(row.index_values.is_empty());
    assert!(row.forward_values.is_empty());
}

// ---------------------------------------------------------------------------
// BinlogReader
// ---------------------------------------------------------------------------

#[test]
fn reader_emits_rows_then_no_more_data() {
    let script = default_script();
    let (map, map_end) = EventBuilder::table_map(4);
    let (rows, _) = EventBuilder::write_rows(map_end, &[(1, "1,2,3,4", 30)]);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(context.status, RowDataStatus::Normal);
    assert_eq!(context.file_name, BINLOG_FILE);
    assert_eq!(row.primary_key, 1);
    assert_eq!(row.index_values, vec![Value::String("1,2,3,4".into())]);
    assert_eq!(row.forward_values, vec![Value::Int32(30)]);

    let none = reader.get_next_row_data(&mut context).unwrap();
    assert!(none.is_none());
    assert_eq!(context.status, RowDataStatus::NoMoreData);
}

#[test]
fn reopening_at_the_emitted_context_never_replays_the_row() {
    // Session one: single-row event, capture the context next to pk=1
    let script = default_script();
    let (map1, map1_end) = EventBuilder::table_map(4);
    let (rows1, rows1_end) = EventBuilder::write_rows(map1_end, &[(1, "1,2,3,4", 30)]);
    script.push_event(&map1);
    script.push_event(&rows1);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 1);
    assert_eq!(context.position, rows1_end);

    // Session two: the dump resumed at that position starts at the next
    // group; pk=1 is never re-emitted
    let script2 = default_script();
    let (map2, map2_end) = EventBuilder::table_map(rows1_end);
    let (rows2, _) = EventBuilder::write_rows(map2_end, &[(2, "5,6,7,8", 31)]);
    script2.push_event(&map2);
    script2.push_event(&rows2);
    script2.push_end_of_stream();

    let manager2 = manager_with_script(&script2);
    let fetcher2 = script2.info_fetcher(&manager2);
    let mut reader2 = BinlogReader::new("t", fetcher2, manager2);
    reader2.init().unwrap();
    let resume = LsnContext {
        file_name: context.file_name.clone(),
        position: context.position,
        seq_id: 0,
        status: RowDataStatus::Normal,
    };
    reader2.start(&resume).unwrap();

    let mut context2 = LsnContext::default();
    let row = reader2.get_next_row_data(&mut context2).unwrap().unwrap();
    assert_eq!(row.primary_key, 2);
    let end = reader2.get_next_row_data(&mut context2).unwrap();
    assert!(end.is_none());
    assert_eq!(context2.status, RowDataStatus::NoMoreData);
}

#[test]
fn multi_row_event_resumes_across_calls() {
    let script = default_script();
    let (map, map_end) = EventBuilder::table_map(4);
    let (rows, _) =
        EventBuilder::write_rows(map_end, &[(1, "1,2,3,4", 30), (2, "5,6,7,8", 31)]);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let first = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(first.primary_key, 1);
    let second = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(second.primary_key, 2);
    assert!(reader.get_next_row_data(&mut context).unwrap().is_none());
}

#[test]
fn foreign_table_rows_are_dropped() {
    let script = default_script();
    let (other_map, other_end) = EventBuilder::table_map_for(4, "mytest", "other");
    let (other_rows, rows_end) = EventBuilder::write_rows(other_end, &[(9, "9,9,9,9", 99)]);
    let (map, map_end) = EventBuilder::table_map(rows_end);
    let (rows, _) = EventBuilder::write_rows(map_end, &[(1, "1,2,3,4", 30)]);
    script.push_event(&other_map);
    script.push_event(&other_rows);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 1);
}

#[test]
fn alter_table_is_a_schema_changed_barrier() {
    let script = default_script();
    let (alter, alter_end) =
        EventBuilder::query_event("mytest", "  ALTER TABLE mytest.t ADD COLUMN x INT", 4);
    let (map, map_end) = EventBuilder::table_map(alter_end);
    let (rows, _) = EventBuilder::write_rows(map_end, &[(9, "1,2,3,4", 30)]);
    script.push_event(&alter);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    // The barrier arrives without consuming the following rows
    let mut context = LsnContext::default();
    let none = reader.get_next_row_data(&mut context).unwrap();
    assert!(none.is_none());
    assert_eq!(context.status, RowDataStatus::SchemaChanged);

    // The rows after the barrier are still there
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 9);
    assert_eq!(context.status, RowDataStatus::Normal);
}

#[test]
fn incompatible_alter_suspends_the_reader() {
    let script = alter_schema_script();
    let (alter, _) =
        EventBuilder::query_event("mytest", "ALTER TABLE mytest.t DROP COLUMN face", 4);
    script.push_event(&alter);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let err = reader.get_next_row_data(&mut context).unwrap_err();
    assert!(matches!(err, Error::InvalidCollectionConfig(_)));

    // Suspended until operator intervention
    assert_eq!(reader.get_next_row_data(&mut context), Err(Error::Suspended));
    assert_eq!(reader.get_next_row_data(&mut context), Err(Error::Suspended));
}

#[test]
fn rotate_updates_the_emitted_file_name() {
    let script = default_script();
    // The first event of a fresh dump stream carries no checksum
    let rotate = EventBuilder::rotate_event("binlog.000005", 4, false);
    let (map, map_end) = EventBuilder::table_map(4);
    let (rows, _) = EventBuilder::write_rows(map_end, &[(1, "1,2,3,4", 30)]);
    script.push_event(&rotate);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = BinlogReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&start_context()).unwrap();

    let mut context = LsnContext::default();
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 1);
    assert_eq!(context.file_name, "binlog.000005");
}

// ---------------------------------------------------------------------------
// EventFetcher
// ---------------------------------------------------------------------------

#[test]
fn invalid_position_falls_back_to_the_next_file() {
    let script = default_script();
    script.fail_binlog_events_probe();
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let mut fetcher = EventFetcher::new(manager);
    fetcher.init("binlog.000004", 4).unwrap();

    // SHOW BINARY LOGS listed 000003 and 000005; the smallest strictly
    // greater file wins, at the file start
    let (file, position) = fetcher.position();
    assert_eq!(file, "binlog.000005");
    assert_eq!(position, 4);

    assert_eq!(fetcher.fetch().unwrap_err(), Error::BinlogNoMoreData);
}

#[test]
fn end_of_stream_is_no_more_data() {
    let script = default_script();
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let mut fetcher = EventFetcher::new(manager);
    fetcher.init(BINLOG_FILE, 4).unwrap();
    assert_eq!(fetcher.fetch().unwrap_err(), Error::BinlogNoMoreData);
}

// ---------------------------------------------------------------------------
// TableReader
// ---------------------------------------------------------------------------

#[test]
fn full_scan_emits_inserts_with_seq_ids() {
    let script = default_script();
    script.push_scan_row(row_values(1, "1,2,3,4", 30));
    script.push_scan_row(row_values(2, "5,6,7,8", 31));

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = TableReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&LsnContext::default()).unwrap();

    let mut context = LsnContext::default();
    let first = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(first.operation, RowOperation::Insert);
    assert_eq!(first.primary_key, 1);
    assert_eq!(context.seq_id, 1);
    assert_eq!(first.index_values, vec![Value::String("1,2,3,4".into())]);
    assert_eq!(first.forward_values, vec![Value::Int32(30)]);

    let second = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(second.primary_key, 2);
    assert_eq!(context.seq_id, 2);

    assert!(reader.get_next_row_data(&mut context).unwrap().is_none());
    assert_eq!(context.status, RowDataStatus::NoMoreData);

    // The scan SELECT lists the primary key first
    assert!(script
        .queries()
        .iter()
        .any(|sql| sql.starts_with("SELECT id, face, age FROM mytest.t WHERE id > 0")));
}

#[test]
fn scan_errors_reconnect_and_resume_above_the_last_seq_id() {
    let script = default_script();
    script.push_scan_row(row_values(1, "1,2,3,4", 30));
    script.push_scan_row(row_values(2, "5,6,7,8", 31));
    script.push_scan_error();
    script.push_scan_row(row_values(3, "2,2,2,2", 32));

    let manager = manager_with_script(&script);
    let fetcher = script.info_fetcher(&manager);
    let mut reader = TableReader::new("t", fetcher, manager);
    reader.init().unwrap();
    reader.start(&LsnContext::default()).unwrap();

    let mut context = LsnContext::default();
    assert_eq!(
        reader.get_next_row_data(&mut context).unwrap().unwrap().primary_key,
        1
    );
    assert_eq!(
        reader.get_next_row_data(&mut context).unwrap().unwrap().primary_key,
        2
    );

    // The stream breaks; the cursor remembers seq_id = 2
    assert_eq!(
        reader.get_next_row_data(&mut context),
        Err(Error::FetchMysqlResult)
    );

    // Reconnect re-issues the scan above the last emitted key
    let row = reader.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 3);
    assert!(script
        .queries()
        .iter()
        .any(|sql| sql.contains("WHERE id > 2")));
}

// ---------------------------------------------------------------------------
// MysqlHandler
// ---------------------------------------------------------------------------

#[test]
fn handler_validates_and_drives_a_full_scan() {
    let script = default_script();
    script.push_scan_row(row_values(1, "1,2,3,4", 30));

    let manager = manager_with_script(&script);
    let mut handler = MysqlHandler::with_manager(&script.repository_config(), manager);
    handler.init(ScanMode::Full).unwrap();
    handler.start(&LsnContext::default()).unwrap();

    let mut context = LsnContext::default();
    let row = handler.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(row.primary_key, 1);

    assert!(handler.get_next_row_data(&mut context).unwrap().is_none());
    assert_eq!(context.status, RowDataStatus::NoMoreData);

    let (file, position) = handler.get_table_snapshot().unwrap();
    assert_eq!(file, BINLOG_FILE);
    assert_eq!(position, 154);
}

#[test]
fn handler_rejects_unsupported_sources() {
    let script = default_script();
    script.set_server_version("8.0.28");
    let manager = manager_with_script(&script);
    let mut handler = MysqlHandler::with_manager(&script.repository_config(), manager);
    assert!(matches!(
        handler.init(ScanMode::Full),
        Err(Error::UnsupportedMysqlVersion(_))
    ));

    let script = default_script();
    script.set_binlog_format("STATEMENT");
    let manager = manager_with_script(&script);
    let mut handler = MysqlHandler::with_manager(&script.repository_config(), manager);
    assert!(matches!(
        handler.init(ScanMode::Full),
        Err(Error::UnsupportedBinlogFormat(_))
    ));
}

#[test]
fn handler_switches_from_scan_to_increments() {
    let script = default_script();
    script.push_scan_row(row_values(1, "1,2,3,4", 30));
    let (map, map_end) = EventBuilder::table_map(154);
    let (rows, _) = EventBuilder::write_rows(map_end, &[(2, "5,6,7,8", 31)]);
    script.push_event(&map);
    script.push_event(&rows);
    script.push_end_of_stream();

    let manager = manager_with_script(&script);
    let mut handler = MysqlHandler::with_manager(&script.repository_config(), manager);
    handler.init(ScanMode::Full).unwrap();
    handler.start(&LsnContext::default()).unwrap();

    let mut context = LsnContext::default();
    let scanned = handler.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(scanned.primary_key, 1);
    assert!(handler.get_next_row_data(&mut context).unwrap().is_none());

    // Scan drained: switch to the binlog at the snapshot position
    let resume = LsnContext::with_position(BINLOG_FILE, 154);
    handler.reset_status(ScanMode::Increment, &resume).unwrap();
    let replicated = handler.get_next_row_data(&mut context).unwrap().unwrap();
    assert_eq!(replicated.primary_key, 2);
}
