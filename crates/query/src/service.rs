//! QueryService: the entry point of the read path.
//!
//! Opens a profiler per request, builds the query via the factory, and
//! drives `validate → prepare → evaluate → finalize`. Any failing phase
//! short-circuits to `finalize`, which always runs. The profiler closes in
//! `stop` and its serialization is attached to the response when the caller
//! requested debug mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use quiver_core::error::{Error, Result};
use quiver_core::meta::MetaServiceRef;
use quiver_core::profiler::{Profiler, ProfilerRef};
use quiver_core::proto::{
    GetDocumentRequest, GetDocumentResponse, QueryRequest, QueryResponse,
};
use quiver_executor::Executor;
use quiver_index::IndexService;

use crate::context::QueryContext;
use crate::equal::EqualQuery;
use crate::meta_wrapper::MetaWrapper;
use crate::query::Query;

static TRACE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_trace_id() -> u64 {
    TRACE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Read-path service over the index.
pub struct QueryService {
    index_service: Arc<IndexService>,
    meta: Arc<MetaWrapper>,
    executor: Arc<Executor>,
}

impl QueryService {
    /// Service over the process-global scheduler.
    pub fn new(index_service: Arc<IndexService>, meta_service: MetaServiceRef) -> Self {
        Self::with_executor(
            index_service,
            meta_service,
            Arc::new(Executor::with_global_scheduler()),
        )
    }

    /// Service over an explicit executor (isolated pools, tests).
    pub fn with_executor(
        index_service: Arc<IndexService>,
        meta_service: MetaServiceRef,
        executor: Arc<Executor>,
    ) -> Self {
        info!("query service created with parallel executor");
        QueryService {
            index_service,
            meta: Arc::new(MetaWrapper::new(meta_service)),
            executor,
        }
    }

    fn context(&self, trace_id: u64, profiler: ProfilerRef) -> QueryContext {
        QueryContext::new(
            trace_id,
            self.index_service.clone(),
            self.meta.clone(),
            self.executor.clone(),
            profiler,
        )
    }

    /// Batch kNN search.
    pub fn search(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let profiler: ProfilerRef = Arc::new(Profiler::new(request.debug_mode));
        profiler.start();
        let timer = Instant::now();

        profiler.open_stage("before_process_query")?;
        let trace_id = next_trace_id();
        let mut query = Query::from_request(
            self.context(trace_id, profiler.clone()),
            request.clone(),
        );
        profiler.close_stage()?;

        let outcome = Self::process_query(&mut query, &profiler);

        profiler.open_stage("after_process_query")?;
        let mut response = query.into_query_response();
        let result_count: usize = response.results.iter().map(|r| r.documents.len()).sum();
        profiler.close_stage()?;
        profiler.stop();

        match outcome {
            Ok(()) => {
                if let Some(param) = &request.knn_param {
                    info!(
                        query_id = trace_id,
                        batch_count = param.batch_count,
                        topk = param.topk,
                        is_linear = param.is_linear,
                        resnum = result_count,
                        rt_us = timer.elapsed().as_micros() as u64,
                        collection = request.collection_name.as_str(),
                        "knn search success"
                    );
                }
                if request.debug_mode {
                    response.debug_info = profiler.as_json_string();
                }
                Ok(response)
            }
            Err(err) => {
                error!(code = err.code(), reason = %err, "process query failed");
                Err(err)
            }
        }
    }

    /// Exact primary-key lookup.
    pub fn search_by_key(&self, request: &GetDocumentRequest) -> Result<GetDocumentResponse> {
        let profiler: ProfilerRef = Arc::new(Profiler::new(request.debug_mode));
        profiler.start();
        let timer = Instant::now();

        let trace_id = next_trace_id();
        let mut query = Query::Equal(EqualQuery::new(
            self.context(trace_id, profiler.clone()),
            request.clone(),
        ));

        let outcome = Self::process_query(&mut query, &profiler);
        profiler.stop();

        match (outcome, query) {
            (Ok(()), Query::Equal(equal)) => {
                let mut response = equal.into_response();
                info!(
                    query_id = trace_id,
                    pk = request.primary_key,
                    resnum = response.document.is_some() as u32,
                    rt_us = timer.elapsed().as_micros() as u64,
                    collection = request.collection_name.as_str(),
                    "kv search success"
                );
                if request.debug_mode {
                    response.debug_info = profiler.as_json_string();
                }
                Ok(response)
            }
            (Err(err), _) => {
                error!(code = err.code(), reason = %err, "process query failed");
                Err(err)
            }
            _ => Err(Error::RuntimeError("unexpected query kind".into())),
        }
    }

    // Four-phase protocol; finalize always runs
    fn process_query(query: &mut Query, profiler: &ProfilerRef) -> Result<()> {
        profiler.add("query_id", query.id())?;
        profiler.open_stage("query")?;

        let mut outcome = query.validate();
        if outcome.is_ok() {
            outcome = query.prepare();
            if outcome.is_ok() {
                outcome = query.evaluate();
            } else {
                error!(trace_id = query.id(), "failed to prepare resource for query");
            }
        } else {
            error!("can't validate query, skip it and continue");
        }

        let _ = query.finalize();
        debug!(trace_id = query.id(), "query has been finished");
        profiler.close_stage()?;

        outcome
    }
}
