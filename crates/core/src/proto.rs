//! Request/response and write-path shapes.
//!
//! These are the language-neutral structures exchanged with transports and
//! with the replication pipeline. Transports themselves (HTTP/RPC binding)
//! are out of scope; the shapes are the contract.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::Value;
use crate::vector::DataType;

// ---------------------------------------------------------------------------
// Query path
// ---------------------------------------------------------------------------

/// Kind of query carried by a [`QueryRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// Not set; fails every phase
    Undefined,
    /// Approximate nearest neighbor
    Knn,
    /// Exact primary-key lookup
    Equal,
}

/// Feature payload of a kNN request: either pre-encoded bytes or a JSON
/// matrix (flat `[..]` or nested `[[..],[..]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureInput {
    /// Packed features, `batch * dimension * type_size` bytes
    Bytes(Vec<u8>),
    /// JSON array text
    Matrix(String),
}

/// Parameters of a kNN query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnQueryParam {
    /// Index column to search
    pub column_name: String,
    /// Number of best matches per logical query
    pub topk: u32,
    /// Query vector dimension
    pub dimension: u32,
    /// Element type of the supplied features
    pub data_type: DataType,
    /// Feature payload
    pub features: FeatureInput,
    /// Number of logical queries in the payload
    pub batch_count: u32,
    /// Radius threshold, 0 = unbounded
    pub radius: f32,
    /// Hint to search linearly (exact) inside the kernel
    pub is_linear: bool,
    /// Extra kernel parameters
    pub extra_params: Vec<(String, String)>,
}

/// Search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Target collection
    pub collection_name: String,
    /// Query kind
    pub query_type: QueryType,
    /// Attach profiler output to the response
    pub debug_mode: bool,
    /// kNN parameters; required when `query_type == Knn`
    pub knn_param: Option<KnnQueryParam>,
}

/// One returned document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Primary key of the hit
    pub primary_key: u64,
    /// Score, smaller is better
    pub score: f32,
    /// Forward column key/value pairs in schema order
    pub forward_column_values: Vec<(String, Value)>,
}

/// Result list of one logical query of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    /// Documents ordered by score ascending
    pub documents: Vec<Document>,
}

/// Search response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    /// One result set per batch query
    pub results: Vec<ResultSet>,
    /// Profiler JSON when the request had `debug_mode`
    pub debug_info: String,
}

/// Primary-key lookup request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDocumentRequest {
    /// Target collection
    pub collection_name: String,
    /// Key to look up
    pub primary_key: u64,
    /// Attach profiler output to the response
    pub debug_mode: bool,
}

/// Primary-key lookup response. `document` is `None` on a miss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDocumentResponse {
    /// The hit, if any
    pub document: Option<Document>,
    /// Profiler JSON when the request had `debug_mode`
    pub debug_info: String,
}

/// Admin status envelope: `code == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    /// Stable numeric code, 0 on success
    pub code: u32,
    /// Human-readable reason, empty on success
    pub reason: String,
}

impl Status {
    /// Success envelope.
    pub fn ok() -> Self {
        Status {
            code: 0,
            reason: String::new(),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Status {
            code: err.code(),
            reason: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

/// Operation carried by a logical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOperation {
    /// New row
    Insert,
    /// Replacement of an existing row
    Update,
    /// Removal
    Delete,
}

/// One logical row entering the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    /// Primary key; never [`crate::value::INVALID_PRIMARY_KEY`]
    pub primary_key: u64,
    /// Operation tag
    pub operation: RowOperation,
    /// Index column values in schema order: packed feature bytes, or a JSON
    /// array rendered as a string (converted at write time)
    pub index_values: Vec<Value>,
    /// Forward column values in schema order
    pub forward_values: Vec<Value>,
    /// Log sequence number when sourced from a replicated stream
    pub lsn: u64,
    /// Serialized LSN context for resume
    pub lsn_context: String,
}

/// A batch of rows written under one schema revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDataset {
    /// Schema revision the rows were built against
    pub revision: u64,
    /// Rows in arrival order
    pub rows: Vec<RowData>,
}

// ---------------------------------------------------------------------------
// Replication cursor
// ---------------------------------------------------------------------------

/// Status attached to a fetched row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowDataStatus {
    /// Row is valid
    Normal,
    /// Stream is drained; caller may sleep and retry
    NoMoreData,
    /// Schema changed; caller must quiesce and re-read the schema
    SchemaChanged,
}

/// Resumable position in the source-of-truth stream.
///
/// For binlog rows, `position` addresses the byte offset of the TABLE_MAP
/// event that preceded the row, never the rows event itself, so resuming
/// replays the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsnContext {
    /// Binlog file name
    pub file_name: String,
    /// Byte offset within the file
    pub position: u64,
    /// Scan-mode sequence id (last emitted primary key)
    pub seq_id: u64,
    /// Row status
    pub status: RowDataStatus,
}

impl LsnContext {
    /// Cursor at the start of a binlog file.
    pub fn with_position(file_name: &str, position: u64) -> Self {
        LsnContext {
            file_name: file_name.to_string(),
            position,
            seq_id: 0,
            status: RowDataStatus::Normal,
        }
    }
}

impl Default for LsnContext {
    fn default() -> Self {
        LsnContext {
            file_name: String::new(),
            position: 0,
            seq_id: 0,
            status: RowDataStatus::Normal,
        }
    }
}
