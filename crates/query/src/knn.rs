//! kNN query: fan out per segment, merge per batch.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, error};

use quiver_core::error::{Error, Result};
use quiver_core::profiler::ScopedLatency;
use quiver_core::proto::{Document, FeatureInput, KnnQueryParam, QueryRequest, QueryResponse, ResultSet};
use quiver_core::vector::{
    self, fp16_bits_to_fp32, fp32_to_fp16_bits, DataType, VectorView,
};
use quiver_executor::task::TaskRef;
use quiver_index::segment::{QueryParams, Segment};

use crate::context::QueryContext;
use crate::merger::ResultHeap;
use crate::tasks::{KnnTask, KnnTaskContext};

/// Handler of one kNN request.
pub struct KnnQuery {
    context: QueryContext,
    request: QueryRequest,
    response: QueryResponse,
    params: QueryParams,
    features: Vec<u8>,
    tasks: Vec<Arc<KnnTask>>,
}

impl KnnQuery {
    /// Build the handler; phases run later.
    pub fn new(context: QueryContext, request: QueryRequest) -> Self {
        KnnQuery {
            context,
            request,
            response: QueryResponse::default(),
            params: QueryParams::default(),
            features: Vec::new(),
            tasks: Vec::new(),
        }
    }

    fn collection(&self) -> &str {
        &self.request.collection_name
    }

    fn knn_param(&self) -> Result<&KnnQueryParam> {
        self.request
            .knn_param
            .as_ref()
            .ok_or_else(|| Error::InvalidQuery("knn request without knn_param".into()))
    }

    /// Trace id.
    pub fn id(&self) -> u64 {
        self.context.id()
    }

    /// Phase 1: the collection must be readable and the column indexed.
    pub fn validate(&self) -> Result<()> {
        let _latency = ScopedLatency::new("validate", self.context.profiler());
        let param = self.knn_param()?;
        if param.batch_count == 0 || param.dimension == 0 {
            return Err(Error::InvalidQuery("zero batch or dimension".into()));
        }
        self.context
            .meta()
            .validate_column(self.collection(), &param.column_name)
    }

    /// Phase 2: acquire segments, build tasks, translate parameters and
    /// transform the feature payload.
    pub fn prepare(&mut self) -> Result<()> {
        let _latency = ScopedLatency::new("prepare", self.context.profiler());
        let segments = self.context.list_segments(self.collection())?;

        self.build_query_params()?;
        self.transform_features().map_err(|err| {
            error!(code = err.code(), "failed to transform features");
            err
        })?;

        let (column, batch_count) = {
            let param = self.knn_param()?;
            (param.column_name.clone(), param.batch_count)
        };
        let task_context = Arc::new(KnnTaskContext {
            column,
            features: std::mem::take(&mut self.features),
            batch_count,
            params: self.params.clone(),
        });
        for segment in segments {
            let name = format!("knn_task_{}_{}", segment.segment_id(), self.id());
            self.tasks
                .push(KnnTask::new(name, segment, task_context.clone()));
        }
        Ok(())
    }

    /// Phase 3: run every segment task, then merge.
    pub fn evaluate(&mut self) -> Result<()> {
        let profiler = self.context.profiler();
        profiler.open_stage("evaluate")?;
        let tasks: Vec<TaskRef> = self.tasks.iter().map(|t| t.clone() as TaskRef).collect();
        let code = {
            let _latency = ScopedLatency::new("execute", profiler.clone());
            self.context.executor().execute_tasks(&tasks)
        };
        let result = match code {
            Ok(()) => {
                let _latency = ScopedLatency::new("merge_and_sort", profiler.clone());
                self.collect_results()
            }
            Err(err) => Err(err),
        };
        profiler.close_stage()?;
        result
    }

    /// Phase 4: side-effect free.
    pub fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hand the assembled response to the service.
    pub fn into_response(self) -> QueryResponse {
        self.response
    }

    fn build_query_params(&mut self) -> Result<()> {
        let trace_id = self.context.id();
        let params = {
            let param = self.knn_param()?;
            QueryParams {
                query_id: trace_id,
                topk: param.topk,
                dimension: param.dimension,
                data_type: param.data_type,
                radius: param.radius,
                is_linear: param.is_linear,
                extra_params: param.extra_params.clone(),
            }
        };
        self.params = params;
        Ok(())
    }

    fn transform_features(&mut self) -> Result<()> {
        let param = self.knn_param()?.clone();
        let column_type = self
            .context
            .meta()
            .get_data_type(self.collection(), &param.column_name);

        self.features = match &param.features {
            FeatureInput::Bytes(bytes) => {
                transform_bytes(bytes, &param, column_type)?
            }
            FeatureInput::Matrix(json) => {
                let values = parse_matrix(json, param.dimension, param.batch_count)?;
                pack_matrix(&values, column_type)?
            }
        };
        // The kernel sees features in the column's own element type
        self.params.data_type = column_type;
        Ok(())
    }

    fn collect_results(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        let per_task: Vec<_> = self.tasks.iter().map(|t| t.result()).collect();
        let batch_count = self.knn_param()?.batch_count;
        let topk = self.params.topk;

        for batch in 0..batch_count as usize {
            let mut heap = ResultHeap::new(topk as usize);
            for lists in &per_task {
                let stream = lists.get(batch).ok_or(Error::OutOfBoundsResult)?;
                // Streams are score-sorted; stop once the heap's worst
                // element outranks the next candidate
                for hit in stream {
                    heap.push(hit.clone());
                    if heap.dominates(hit) {
                        break;
                    }
                }
            }

            let sorted = heap.into_sorted();
            let mut result_set = ResultSet::default();
            for hit in &sorted {
                let mut doc = Document {
                    primary_key: hit.primary_key,
                    score: hit.score,
                    forward_column_values: Vec::new(),
                };
                self.context.fill_forward(self.collection(), hit, &mut doc)?;
                result_set.documents.push(doc);
            }
            if result_set.documents.len() < topk as usize {
                debug!(
                    batch,
                    have = result_set.documents.len(),
                    "no enough results to fill response"
                );
            }
            self.response.results.push(result_set);
        }
        Ok(())
    }
}

fn transform_bytes(
    bytes: &[u8],
    param: &KnnQueryParam,
    column_type: DataType,
) -> Result<Vec<u8>> {
    let declared = param.data_type;
    let expected =
        declared.vector_size(param.dimension as usize) * param.batch_count as usize;
    if expected == 0 || bytes.len() != expected {
        return Err(Error::InvalidVectorFormat(format!(
            "feature bytes {}, expected {}",
            bytes.len(),
            expected
        )));
    }
    if declared == column_type {
        return Ok(bytes.to_vec());
    }
    // Conversion is limited to the float family
    match (declared, column_type) {
        (DataType::Fp32, DataType::Fp16) => {
            let view = VectorView::<f32>::new(bytes);
            let mut out = Vec::with_capacity(view.len() * 2);
            for v in view.iter() {
                out.extend_from_slice(&fp32_to_fp16_bits(v).to_le_bytes());
            }
            Ok(out)
        }
        (DataType::Fp16, DataType::Fp32) => {
            let view = VectorView::<u16>::new(bytes);
            let mut out = Vec::with_capacity(view.len() * 4);
            for v in view.iter() {
                out.extend_from_slice(&fp16_bits_to_fp32(v).to_le_bytes());
            }
            Ok(out)
        }
        _ => Err(Error::MismatchedDataType),
    }
}

// Accepts both flat `[..]` and nested `[[..],[..]]` arrays
fn parse_matrix(json: &str, dimension: u32, batch_count: u32) -> Result<Vec<f64>> {
    let node: JsonValue = serde_json::from_str(json)
        .map_err(|e| Error::InvalidVectorFormat(format!("matrix parse: {e}")))?;
    let array = node
        .as_array()
        .ok_or_else(|| Error::InvalidVectorFormat("matrix is not an array".into()))?;
    if array.is_empty() {
        return Err(Error::InvalidVectorFormat("matrix is empty".into()));
    }

    let mut values = Vec::with_capacity((dimension * batch_count) as usize);
    if array[0].is_array() {
        for row in array {
            let row = row
                .as_array()
                .filter(|r| r.len() == dimension as usize)
                .ok_or_else(|| {
                    Error::InvalidVectorFormat("nested rows must match the dimension".into())
                })?;
            for v in row {
                values.push(number(v)?);
            }
        }
    } else {
        if array.len() != dimension as usize {
            return Err(Error::InvalidVectorFormat(
                "flat matrix must match the dimension".into(),
            ));
        }
        for v in array {
            values.push(number(v)?);
        }
    }

    if values.len() != (dimension * batch_count) as usize {
        return Err(Error::InvalidVectorFormat(format!(
            "matrix holds {} values, expected {}",
            values.len(),
            dimension * batch_count
        )));
    }
    Ok(values)
}

fn number(v: &JsonValue) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| Error::InvalidVectorFormat("matrix element is not a number".into()))
}

fn pack_matrix(values: &[f64], column_type: DataType) -> Result<Vec<u8>> {
    vector::pack_f64_values(values, column_type).ok_or_else(|| {
        error!("unsupported column data type");
        Error::MismatchedDataType
    })
}
