//! Query engine integration tests: the end-to-end read path.

use std::path::Path;
use std::sync::Arc;

use quiver_core::config::IndexConfig;
use quiver_core::error::Error;
use quiver_core::meta::{CollectionMeta, ColumnMeta, MemoryMetaService, MetaService};
use quiver_core::profiler::Profiler;
use quiver_core::proto::{
    CollectionDataset, FeatureInput, GetDocumentRequest, KnnQueryParam, QueryRequest, QueryType,
    RowData, RowOperation,
};
use quiver_core::value::Value;
use quiver_core::vector::{pack_f32, DataType};
use quiver_executor::task::{ClosureTask, TaskRef};
use quiver_executor::{Executor, Scheduler};
use quiver_index::IndexService;
use quiver_query::QueryService;

struct Harness {
    _dir: tempfile::TempDir,
    index_service: Arc<IndexService>,
    meta_service: Arc<MemoryMetaService>,
    query_service: QueryService,
}

fn schema(dim: u32) -> CollectionMeta {
    CollectionMeta::new(
        "teachers",
        vec!["age".into()],
        vec![ColumnMeta::new("face", DataType::Fp32, dim)],
    )
}

fn harness(dim: u32, max_docs_per_segment: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = IndexConfig {
        index_directory: dir.path().to_str().unwrap().to_string(),
        flush_interval_secs: 0,
        optimize_interval_secs: 0,
        ..Default::default()
    };
    let index_service = Arc::new(IndexService::new(config));
    index_service.init().unwrap();
    index_service.start().unwrap();

    let mut meta = schema(dim);
    meta.max_docs_per_segment = max_docs_per_segment;
    index_service.create_collection("teachers", &meta).unwrap();

    let meta_service = Arc::new(MemoryMetaService::new());
    meta_service.create_collection(meta).unwrap();

    let executor = Arc::new(Executor::new(Arc::new(Scheduler::new(4))));
    let query_service =
        QueryService::with_executor(index_service.clone(), meta_service.clone(), executor);
    Harness {
        _dir: dir,
        index_service,
        meta_service,
        query_service,
    }
}

fn write_row(h: &Harness, revision: u64, pk: u64, features: &[f32], forwards: Vec<Value>) {
    let row = RowData {
        primary_key: pk,
        operation: RowOperation::Insert,
        index_values: vec![Value::Bytes(pack_f32(features, DataType::Fp32).unwrap())],
        forward_values: forwards,
        lsn: 0,
        lsn_context: String::new(),
    };
    h.index_service
        .write_records("teachers", &CollectionDataset { revision, rows: vec![row] })
        .unwrap();
}

fn knn_request(features: FeatureInput, topk: u32, dim: u32, batch: u32) -> QueryRequest {
    QueryRequest {
        collection_name: "teachers".into(),
        query_type: QueryType::Knn,
        debug_mode: false,
        knn_param: Some(KnnQueryParam {
            column_name: "face".into(),
            topk,
            dimension: dim,
            data_type: DataType::Fp32,
            features,
            batch_count: batch,
            radius: 0.0,
            is_linear: false,
            extra_params: Vec::new(),
        }),
    }
}

#[test]
fn exact_match_returns_score_zero_with_forwards() {
    let h = harness(16, 100_000);
    let features: Vec<f32> = (1..=16).map(|i| i as f32).collect();
    write_row(&h, 0, 123456, &features, vec![Value::Int32(32)]);

    let request = knn_request(
        FeatureInput::Bytes(pack_f32(&features, DataType::Fp32).unwrap()),
        1,
        16,
        1,
    );
    let response = h.query_service.search(&request).unwrap();
    assert_eq!(response.results.len(), 1);
    let docs = &response.results[0].documents;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].primary_key, 123456);
    assert_eq!(docs[0].score, 0.0);
    assert_eq!(
        docs[0].forward_column_values,
        vec![("age".to_string(), Value::Int32(32))]
    );
}

#[test]
fn results_merge_across_segments_in_score_order() {
    // Three-doc segments force a multi-segment fan-out
    let h = harness(4, 3);
    for pk in 1..=10u64 {
        let v = pk as f32;
        write_row(&h, 0, pk, &[v, v, v, v], vec![Value::Int32(pk as i32)]);
    }
    assert!(h.index_service.get_collection_stats("teachers").unwrap().segment_count >= 3);

    let request = knn_request(
        FeatureInput::Bytes(pack_f32(&[0.0; 4], DataType::Fp32).unwrap()),
        4,
        4,
        1,
    );
    let response = h.query_service.search(&request).unwrap();
    let docs = &response.results[0].documents;
    let keys: Vec<u64> = docs.iter().map(|d| d.primary_key).collect();
    assert_eq!(keys, vec![1, 2, 3, 4]);
    let scores: Vec<f32> = docs.iter().map(|d| d.score).collect();
    assert!(scores.windows(2).all(|w| w[0] <= w[1]));

    // Primary keys are unique in a merged batch
    let mut deduped = keys.clone();
    deduped.dedup();
    assert_eq!(deduped, keys);
}

#[test]
fn matrix_input_accepts_flat_and_nested_arrays() {
    let h = harness(4, 100_000);
    write_row(&h, 0, 1, &[1.0, 0.0, 0.0, 0.0], vec![Value::Int32(1)]);
    write_row(&h, 0, 2, &[0.0, 1.0, 0.0, 0.0], vec![Value::Int32(2)]);

    let flat = knn_request(FeatureInput::Matrix("[1, 0, 0, 0]".into()), 1, 4, 1);
    let response = h.query_service.search(&flat).unwrap();
    assert_eq!(response.results[0].documents[0].primary_key, 1);

    let nested = knn_request(
        FeatureInput::Matrix("[[1, 0, 0, 0], [0, 1, 0, 0]]".into()),
        1,
        4,
        2,
    );
    let response = h.query_service.search(&nested).unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].documents[0].primary_key, 1);
    assert_eq!(response.results[1].documents[0].primary_key, 2);
}

#[test]
fn malformed_requests_map_to_contract_errors() {
    let h = harness(4, 100_000);
    write_row(&h, 0, 1, &[0.0; 4], vec![Value::Int32(1)]);

    // Wrong byte length
    let short = knn_request(FeatureInput::Bytes(vec![0u8; 15]), 1, 4, 1);
    assert!(matches!(
        h.query_service.search(&short),
        Err(Error::InvalidVectorFormat(_))
    ));

    // Unknown column
    let mut request = knn_request(FeatureInput::Bytes(vec![0u8; 16]), 1, 4, 1);
    request.knn_param.as_mut().unwrap().column_name = "voice".into();
    assert!(matches!(
        h.query_service.search(&request),
        Err(Error::InexistentColumn(_))
    ));

    // Unknown collection
    let mut request = knn_request(FeatureInput::Bytes(vec![0u8; 16]), 1, 4, 1);
    request.collection_name = "students".into();
    assert!(matches!(
        h.query_service.search(&request),
        Err(Error::InexistentCollection(_))
    ));

    // Integer conversion path is rejected
    let mut request = knn_request(FeatureInput::Bytes(vec![0u8; 4]), 1, 4, 1);
    request.knn_param.as_mut().unwrap().data_type = DataType::Int8;
    assert_eq!(
        h.query_service.search(&request).unwrap_err(),
        Error::MismatchedDataType
    );

    // Undefined query type fails every phase
    let undefined = QueryRequest {
        collection_name: "teachers".into(),
        query_type: QueryType::Undefined,
        debug_mode: false,
        knn_param: None,
    };
    assert!(h.query_service.search(&undefined).is_err());
}

#[test]
fn search_by_key_hits_and_misses() {
    let h = harness(16, 100_000);
    let features: Vec<f32> = (1..=16).map(|i| i as f32).collect();
    write_row(&h, 0, 123456, &features, vec![Value::Int32(32)]);

    let hit = h
        .query_service
        .search_by_key(&GetDocumentRequest {
            collection_name: "teachers".into(),
            primary_key: 123456,
            debug_mode: false,
        })
        .unwrap();
    let doc = hit.document.expect("document found");
    assert_eq!(doc.primary_key, 123456);
    assert_eq!(
        doc.forward_column_values,
        vec![("age".to_string(), Value::Int32(32))]
    );

    // A miss is an empty document, not an error
    let miss = h
        .query_service
        .search_by_key(&GetDocumentRequest {
            collection_name: "teachers".into(),
            primary_key: 999,
            debug_mode: false,
        })
        .unwrap();
    assert!(miss.document.is_none());
}

#[test]
fn forward_names_resolve_at_the_writing_revision() {
    let h = harness(4, 100_000);
    // Revision 0 carries forwards ["age"]
    write_row(&h, 0, 1, &[1.0, 0.0, 0.0, 0.0], vec![Value::Int32(30)]);

    // Revision 1 adds a forward column
    let mut next = schema(4);
    next.forward_columns.push("name".into());
    let stored = h.meta_service.update_collection(next.clone()).unwrap();
    assert_eq!(stored.revision, 1);
    h.index_service.update_collection("teachers", &stored).unwrap();

    write_row(
        &h,
        1,
        2,
        &[0.0, 1.0, 0.0, 0.0],
        vec![Value::Int32(31), Value::String("bob".into())],
    );

    // The older row resolves against the revision-0 name list, length 1
    let old = h
        .query_service
        .search_by_key(&GetDocumentRequest {
            collection_name: "teachers".into(),
            primary_key: 1,
            debug_mode: false,
        })
        .unwrap()
        .document
        .unwrap();
    assert_eq!(
        old.forward_column_values,
        vec![("age".to_string(), Value::Int32(30))]
    );

    // The newer row resolves against revision 1, length 2
    let new = h
        .query_service
        .search_by_key(&GetDocumentRequest {
            collection_name: "teachers".into(),
            primary_key: 2,
            debug_mode: false,
        })
        .unwrap()
        .document
        .unwrap();
    assert_eq!(new.forward_column_values.len(), 2);
    assert_eq!(new.forward_column_values[1].0, "name");
}

#[test]
fn debug_mode_attaches_profiler_json() {
    let h = harness(4, 100_000);
    write_row(&h, 0, 1, &[0.0; 4], vec![Value::Int32(1)]);

    let mut request = knn_request(
        FeatureInput::Bytes(pack_f32(&[0.0; 4], DataType::Fp32).unwrap()),
        1,
        4,
        1,
    );
    request.debug_mode = true;
    let response = h.query_service.search(&request).unwrap();
    let json: serde_json::Value = serde_json::from_str(&response.debug_info).unwrap();
    assert!(json.get("latency").is_some());
    assert!(json["query"]["evaluate"].get("latency").is_some());

    // Without debug mode the field stays empty
    request.debug_mode = false;
    let response = h.query_service.search(&request).unwrap();
    assert!(response.debug_info.is_empty());
}

#[test]
fn profiler_round_trip_matches_contract() {
    let enabled = Profiler::new(true);
    enabled.start();
    enabled.stop();
    let json: serde_json::Value = serde_json::from_str(&enabled.as_json_string()).unwrap();
    assert!(json.get("latency").is_some());

    let disabled = Profiler::new(false);
    disabled.start();
    disabled.stop();
    assert_eq!(disabled.as_json_string(), "{}");
}

#[test]
fn executor_returns_first_error_in_task_order() {
    let executor = Executor::new(Arc::new(Scheduler::new(2)));
    let tasks: Vec<TaskRef> = vec![
        ClosureTask::new("t1", || Ok(())),
        ClosureTask::new("t2", || Err(Error::InvalidSegment)),
        ClosureTask::new("t3", || Err(Error::OutOfBoundsResult)),
    ];
    assert_eq!(executor.execute_tasks(&tasks), Err(Error::InvalidSegment));
}
