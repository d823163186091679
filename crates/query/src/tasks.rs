//! Tasks scheduled by the query executor, one per segment.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use quiver_core::error::Result;
use quiver_executor::task::{Task, TaskCore};
use quiver_index::segment::{QueryParams, QueryResult, Segment, SegmentRef};

/// Immutable kNN inputs shared by every segment task of one request.
pub struct KnnTaskContext {
    /// Index column to search
    pub column: String,
    /// Packed query features, `batch` vectors back to back
    pub features: Vec<u8>,
    /// Number of logical queries
    pub batch_count: u32,
    /// Kernel parameters
    pub params: QueryParams,
}

/// kNN over one segment; the per-batch result lists stay on the task.
pub struct KnnTask {
    core: TaskCore,
    segment: SegmentRef,
    context: Arc<KnnTaskContext>,
    result: Mutex<Vec<Vec<QueryResult>>>,
}

impl KnnTask {
    /// Task named `knn_task_<segment>_<trace>`.
    pub fn new(name: String, segment: SegmentRef, context: Arc<KnnTaskContext>) -> Arc<Self> {
        Arc::new(KnnTask {
            core: TaskCore::new(name),
            segment,
            context,
            result: Mutex::new(Vec::new()),
        })
    }

    /// Per-batch result lists produced by `knn_search`.
    pub fn result(&self) -> Vec<Vec<QueryResult>> {
        self.result.lock().clone()
    }
}

impl Task for KnnTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn execute(&self) -> Result<()> {
        debug!(
            query_id = self.context.params.query_id,
            segment_id = self.segment.segment_id(),
            "knn task start to run"
        );
        let lists = self.segment.knn_search(
            &self.context.column,
            &self.context.features,
            &self.context.params,
            self.context.batch_count,
        )?;
        *self.result.lock() = lists;
        Ok(())
    }
}

/// Primary-key lookup over one segment.
pub struct EqualTask {
    core: TaskCore,
    segment: SegmentRef,
    primary_key: u64,
    hit: Mutex<Option<QueryResult>>,
}

impl EqualTask {
    /// Lookup task for one segment.
    pub fn new(segment: SegmentRef, primary_key: u64) -> Arc<Self> {
        Arc::new(EqualTask {
            core: TaskCore::new("equal_task"),
            segment,
            primary_key,
            hit: Mutex::new(None),
        })
    }

    /// The hit, if this segment addressed the key.
    pub fn hit(&self) -> Option<QueryResult> {
        self.hit.lock().clone()
    }
}

impl Task for EqualTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn execute(&self) -> Result<()> {
        *self.hit.lock() = self.segment.kv_search(self.primary_key)?;
        Ok(())
    }
}
