//! Index service integration tests: lifecycle, registry, persistence.

use std::path::Path;

use quiver_core::config::IndexConfig;
use quiver_core::error::Error;
use quiver_core::meta::{CollectionMeta, ColumnMeta};
use quiver_core::proto::{CollectionDataset, RowData, RowOperation};
use quiver_core::service::ServiceStatus;
use quiver_core::value::Value;
use quiver_core::vector::{pack_f32, DataType};
use quiver_index::{IndexService, Segment};

fn config(dir: &Path) -> IndexConfig {
    IndexConfig {
        index_directory: dir.to_str().unwrap().to_string(),
        flush_interval_secs: 0,
        optimize_interval_secs: 0,
        ..Default::default()
    }
}

fn teachers_schema() -> CollectionMeta {
    CollectionMeta::new(
        "teachers",
        vec!["age".into()],
        vec![ColumnMeta::new("face", DataType::Fp32, 16)],
    )
}

fn face_row(pk: u64, fill: f32) -> RowData {
    let features: Vec<f32> = (0..16).map(|i| fill + i as f32).collect();
    RowData {
        primary_key: pk,
        operation: RowOperation::Insert,
        index_values: vec![Value::Bytes(pack_f32(&features, DataType::Fp32).unwrap())],
        forward_values: vec![Value::Int32(32)],
        lsn: 0,
        lsn_context: String::new(),
    }
}

#[test]
fn lifecycle_walks_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::new(config(dir.path()));
    assert_eq!(service.status(), ServiceStatus::Created);

    service.init().unwrap();
    assert_eq!(service.status(), ServiceStatus::Initialized);
    service.start().unwrap();
    assert_eq!(service.status(), ServiceStatus::Started);
    service.stop().unwrap();
    assert_eq!(service.status(), ServiceStatus::Initialized);
    service.cleanup().unwrap();
    assert_eq!(service.status(), ServiceStatus::Created);
}

#[test]
fn every_out_of_order_transition_is_status_error() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::new(config(dir.path()));

    assert!(matches!(service.start(), Err(Error::StatusError { .. })));
    assert!(matches!(service.stop(), Err(Error::StatusError { .. })));
    assert!(matches!(service.cleanup(), Err(Error::StatusError { .. })));
    assert_eq!(service.status(), ServiceStatus::Created);

    service.init().unwrap();
    assert!(matches!(service.init(), Err(Error::StatusError { .. })));
    assert!(matches!(service.stop(), Err(Error::StatusError { .. })));
    assert_eq!(service.status(), ServiceStatus::Initialized);
}

#[test]
fn registry_rejects_duplicates_and_unknown_names() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::new(config(dir.path()));
    service.init().unwrap();
    service.start().unwrap();

    service.create_collection("teachers", &teachers_schema()).unwrap();
    assert_eq!(
        service.create_collection("teachers", &teachers_schema()),
        Err(Error::DuplicateCollection("teachers".into()))
    );
    assert_eq!(
        service.write_records(
            "students",
            &CollectionDataset {
                revision: 0,
                rows: vec![face_row(1, 0.0)],
            }
        ),
        Err(Error::InexistentCollection("students".into()))
    );
    assert_eq!(service.list_collections().unwrap(), vec!["teachers".to_string()]);
}

#[test]
fn writes_survive_restart_through_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::new(config(dir.path()));
    service.init().unwrap();
    service.start().unwrap();
    service.create_collection("teachers", &teachers_schema()).unwrap();

    service
        .write_records(
            "teachers",
            &CollectionDataset {
                revision: 0,
                rows: vec![face_row(123456, 1.0), face_row(123457, 40.0)],
            },
        )
        .unwrap();

    // stop() flushes and clears the registry
    service.stop().unwrap();
    service.start().unwrap();
    assert!(!service.has_collection("teachers"));

    // The manifest on disk makes create open the existing index
    service.create_collection("teachers", &teachers_schema()).unwrap();
    let stats = service.get_collection_stats("teachers").unwrap();
    assert_eq!(stats.total_doc_count, 2);

    let segments = service.list_segments("teachers").unwrap();
    let hit = segments
        .iter()
        .find_map(|s| s.kv_search(123456).unwrap())
        .expect("row restored from snapshot");
    assert_eq!(hit.primary_key, 123456);
}

#[test]
fn deletes_and_updates_route_to_owning_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = teachers_schema();
    schema.max_docs_per_segment = 2;
    let service = IndexService::new(config(dir.path()));
    service.init().unwrap();
    service.start().unwrap();
    service.create_collection("teachers", &schema).unwrap();

    let rows: Vec<RowData> = (1..=5).map(|pk| face_row(pk, pk as f32)).collect();
    service
        .write_records("teachers", &CollectionDataset { revision: 0, rows })
        .unwrap();
    assert!(service.get_collection_stats("teachers").unwrap().segment_count >= 3);

    // Delete a row that lives in the first (full) segment
    let delete = RowData {
        primary_key: 1,
        operation: RowOperation::Delete,
        index_values: Vec::new(),
        forward_values: Vec::new(),
        lsn: 0,
        lsn_context: String::new(),
    };
    service
        .write_records(
            "teachers",
            &CollectionDataset {
                revision: 0,
                rows: vec![delete],
            },
        )
        .unwrap();
    let segments = service.list_segments("teachers").unwrap();
    assert!(segments.iter().all(|s| s.kv_search(1).unwrap().is_none()));

    // Update moves the row to the latest segment with new forwards
    let mut update = face_row(2, 9.0);
    update.operation = RowOperation::Update;
    update.forward_values = vec![Value::Int32(33)];
    service
        .write_records(
            "teachers",
            &CollectionDataset {
                revision: 0,
                rows: vec![update],
            },
        )
        .unwrap();
    let hits: Vec<_> = segments
        .iter()
        .filter_map(|s| s.kv_search(2).unwrap())
        .collect();
    assert_eq!(hits.len(), 1);
}

#[test]
fn background_loops_flush_without_explicit_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.flush_interval_secs = 1;
    let service = IndexService::new(cfg);
    service.init().unwrap();
    service.start().unwrap();
    service.create_collection("teachers", &teachers_schema()).unwrap();
    service
        .write_records(
            "teachers",
            &CollectionDataset {
                revision: 0,
                rows: vec![face_row(7, 0.5)],
            },
        )
        .unwrap();

    // The flush loop persists the segment snapshot within its interval
    let snapshot = dir.path().join("teachers").join("segment_0.seg");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !snapshot.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert!(snapshot.exists());

    service.stop().unwrap();
}

#[test]
fn latest_lsn_tracks_replicated_writes() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::new(config(dir.path()));
    service.init().unwrap();
    service.start().unwrap();
    service.create_collection("teachers", &teachers_schema()).unwrap();

    let mut row = face_row(1, 0.0);
    row.lsn = 154;
    row.lsn_context = "binlog.000004:154".into();
    service
        .write_records(
            "teachers",
            &CollectionDataset {
                revision: 0,
                rows: vec![row],
            },
        )
        .unwrap();

    let (lsn, context) = service.get_latest_lsn("teachers").unwrap();
    assert_eq!(lsn, 154);
    assert_eq!(context, "binlog.000004:154");
}
