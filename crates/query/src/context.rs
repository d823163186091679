//! Per-request query state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use quiver_core::error::{Error, Result};
use quiver_core::profiler::ProfilerRef;
use quiver_core::proto::Document;
use quiver_executor::Executor;
use quiver_index::segment::{QueryResult, SegmentRef};
use quiver_index::IndexService;

use crate::forward;
use crate::meta_wrapper::MetaWrapper;

/// State shared by every query kind: services, profiler, and the
/// per-request `revision → forward columns` cache.
pub struct QueryContext {
    trace_id: u64,
    index_service: Arc<IndexService>,
    meta: Arc<MetaWrapper>,
    executor: Arc<Executor>,
    profiler: ProfilerRef,
    forward_columns: Mutex<HashMap<u64, Vec<String>>>,
}

impl QueryContext {
    /// Assemble the context of one request.
    pub fn new(
        trace_id: u64,
        index_service: Arc<IndexService>,
        meta: Arc<MetaWrapper>,
        executor: Arc<Executor>,
        profiler: ProfilerRef,
    ) -> Self {
        QueryContext {
            trace_id,
            index_service,
            meta,
            executor,
            profiler,
            forward_columns: Mutex::new(HashMap::new()),
        }
    }

    /// Unique request id, tracing all relevant information.
    pub fn id(&self) -> u64 {
        self.trace_id
    }

    /// Profiler of this request.
    pub fn profiler(&self) -> ProfilerRef {
        self.profiler.clone()
    }

    /// Meta projection.
    pub fn meta(&self) -> &MetaWrapper {
        &self.meta
    }

    /// Executor of this request.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Segments of the collection; empty means nothing is queryable.
    pub fn list_segments(&self, collection: &str) -> Result<Vec<SegmentRef>> {
        let segments = self.index_service.list_segments(collection).map_err(|e| {
            error!(collection, code = e.code(), "can't get the segments");
            e
        })?;
        if segments.is_empty() {
            return Err(Error::UnavailableSegment);
        }
        Ok(segments)
    }

    /// Forward column names of the hit's revision, resolved through the
    /// meta provider exactly once per revision encountered.
    pub fn forward_columns(&self, collection: &str, revision: u64) -> Result<Vec<String>> {
        let mut cache = self.forward_columns.lock();
        if let Some(columns) = cache.get(&revision) {
            return Ok(columns.clone());
        }
        let columns = self.meta.list_columns(collection, revision)?;
        debug!(collection, revision, "resolved forward columns");
        cache.insert(revision, columns.clone());
        Ok(columns)
    }

    /// Enrich a document with the hit's forward key/value pairs.
    pub fn fill_forward(
        &self,
        collection: &str,
        hit: &QueryResult,
        doc: &mut Document,
    ) -> Result<()> {
        let columns = self.forward_columns(collection, hit.revision)?;
        forward::fill_forward(hit, &columns, doc)
    }
}
