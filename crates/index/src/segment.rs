//! Segment facade: the single-shard read surface of the index kernel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use quiver_core::error::Result;
use quiver_core::vector::DataType;

/// Shared segment handle.
pub type SegmentRef = Arc<dyn Segment>;

/// Parameters of one kNN invocation against a segment.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Trace id of the owning request
    pub query_id: u64,
    /// Result limit per logical query
    pub topk: u32,
    /// Query vector dimension
    pub dimension: u32,
    /// Element type of the packed query features
    pub data_type: DataType,
    /// Radius threshold; 0 disables the filter
    pub radius: f32,
    /// Prefer exact (linear) search inside the kernel
    pub is_linear: bool,
    /// Opaque kernel parameters
    pub extra_params: Vec<(String, String)>,
}

/// One hit returned by a segment.
///
/// Ordering is by `(score, primary_key)` ascending; smaller score is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Primary key of the hit
    pub primary_key: u64,
    /// Distance score, smaller is better
    pub score: f32,
    /// Schema revision the row was written under
    pub revision: u64,
    /// Log sequence number of the originating write
    pub lsn: u64,
    /// Serialized forward tuple
    pub forward_data: Vec<u8>,
}

impl QueryResult {
    /// Total order used by the merger: score ascending, ties broken by
    /// primary key ascending.
    pub fn cmp_rank(&self, other: &QueryResult) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.primary_key.cmp(&other.primary_key))
    }
}

/// Read surface of a segment.
pub trait Segment: Send + Sync {
    /// Identifier, unique within the collection.
    fn segment_id(&self) -> u64;

    /// Number of documents currently addressed by this segment.
    ///
    /// Monotonically increases until `optimize` rewrites the segment.
    fn doc_count(&self) -> u64;

    /// Batch kNN search over one index column.
    ///
    /// `features` holds `batch` packed query vectors back to back. Returns
    /// one score-ascending result list per logical query.
    fn knn_search(
        &self,
        column: &str,
        features: &[u8],
        params: &QueryParams,
        batch: u32,
    ) -> Result<Vec<Vec<QueryResult>>>;

    /// Exact primary-key lookup; `None` on a miss.
    fn kv_search(&self, primary_key: u64) -> Result<Option<QueryResult>>;
}
